use crate::utils::error::{PoolError, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Write the current process id to `path` as ASCII decimal.
pub fn write_pid_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let pid = std::process::id();
    fs::write(path.as_ref(), format!("{}\n", pid)).map_err(|e| {
        PoolError::Config(format!(
            "Failed to write PID file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;
    debug!(pid, path = %path.as_ref().display(), "PID file written");
    Ok(())
}

/// Read a PID file, returning the recorded process id.
pub fn read_pid_file<P: AsRef<Path>>(path: P) -> Result<u32> {
    let content = fs::read_to_string(path.as_ref()).map_err(|e| {
        PoolError::Config(format!(
            "Failed to read PID file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;

    content.trim().parse::<u32>().map_err(|e| {
        PoolError::Config(format!(
            "PID file {} does not contain a process id: {}",
            path.as_ref().display(),
            e
        ))
    })
}

/// Remove a PID file. Missing files are not an error.
pub fn remove_pid_file<P: AsRef<Path>>(path: P) {
    match fs::remove_file(path.as_ref()) {
        Ok(()) => debug!(path = %path.as_ref().display(), "PID file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            path = %path.as_ref().display(),
            error = %e,
            "Failed to remove PID file"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), std::process::id());

        remove_pid_file(&path);
        assert!(read_pid_file(&path).is_err());
        // Second removal is a no-op.
        remove_pid_file(&path);
    }

    #[test]
    fn garbage_pid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "not-a-pid").unwrap();

        assert!(read_pid_file(&path).is_err());
    }
}
