//! Process resource readings for the metrics surface.

use sysinfo::{ProcessRefreshKind, RefreshKind, System};

/// Current resident set size of this process, in bytes.
pub fn memory_usage() -> u64 {
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing().with_memory()),
    );

    sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid))
        .map(|process| process.memory())
        .unwrap_or(0)
}

/// Peak resident set size of this process, in bytes.
///
/// Read from /proc/self/status (VmHWM) where available; falls back to the
/// current RSS elsewhere.
pub fn peak_memory() -> u64 {
    match read_vm_hwm() {
        Some(bytes) => bytes,
        None => memory_usage(),
    }
}

fn read_vm_hwm() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_readings_are_nonzero_on_linux() {
        let rss = memory_usage();
        let peak = peak_memory();

        if cfg!(target_os = "linux") {
            assert!(rss > 0);
            assert!(peak >= rss / 2);
        }
    }
}
