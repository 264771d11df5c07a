use clap::Parser;
use sockpool::cli::{Cli, Command};
use sockpool::config::Config;
use sockpool::PoolError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    init_logging(&cli, &config)?;

    sockpool::cli::run(cli, config).await
}

fn init_logging(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    // The daemon logs at its configured level; management commands stay
    // quiet unless asked otherwise.
    let default_level = match cli.command {
        Command::Start { .. } | Command::Restart { .. } => config.logging.level.as_str(),
        _ => "warn",
    };
    let level = cli.log_level.as_deref().unwrap_or(default_level);

    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| PoolError::Config(format!("Invalid log level: {}", e)))?;

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| PoolError::Config(format!("Cannot open log file {}: {}", path, e)))?;

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .init();
        }
    }

    Ok(())
}
