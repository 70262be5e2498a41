use nectar_common::ResourceUsage;

/// Best-effort snapshot of host load. Missing sources read as zero.
pub fn sample() -> ResourceUsage {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    ResourceUsage {
        cpu_percent: std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|raw| cpu_percent(&raw, cores))
            .unwrap_or(0.0),
        memory_mb: std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|raw| resident_mb(&raw))
            .unwrap_or(0.0),
        disk_gb: disk_used_gb("/").unwrap_or(0.0),
    }
}

/// One-minute load average as a share of the available cores, capped at 100
fn cpu_percent(loadavg: &str, cores: usize) -> Option<f64> {
    let load: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    Some((load / cores.max(1) as f64 * 100.0).min(100.0))
}

/// `VmRSS` from a /proc status file, in MB
fn resident_mb(status: &str) -> Option<f64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024.0)
}

#[cfg(unix)]
fn disk_used_gb(path: &str) -> Option<f64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: c_path is NUL-terminated and stat is only read after statvfs succeeds
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };

    let block = stat.f_frsize as f64;
    let used = (stat.f_blocks as f64 - stat.f_bfree as f64) * block;
    Some(used / 1024f64.powi(3))
}

#[cfg(not(unix))]
fn disk_used_gb(_path: &str) -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_average_scales_by_cores() {
        assert_eq!(cpu_percent("1.00 0.50 0.25 1/200 999", 4), Some(25.0));
        assert_eq!(cpu_percent("12.0 0 0", 2), Some(100.0));
        assert_eq!(cpu_percent("", 4), None);
        assert_eq!(cpu_percent("busy", 4), None);
    }

    #[test]
    fn resident_memory_is_read_in_mb() {
        let status = "Name:\tworker\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\nThreads:\t4\n";
        assert_eq!(resident_mb(status), Some(2.0));
        assert_eq!(resident_mb("Name:\tworker\n"), None);
    }

    #[test]
    fn sample_never_goes_negative() {
        let usage = sample();
        assert!(usage.cpu_percent >= 0.0);
        assert!(usage.memory_mb >= 0.0);
        assert!(usage.disk_gb >= 0.0);
    }
}
