//! Hardware/capability collection.
//!
//! Produces the snapshot consumed by admission control and pushed to the
//! coordination service. Collection is best-effort: fields that cannot be
//! read on this platform stay at their defaults rather than failing startup.

use gridrun_core::CapabilitySnapshot;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Capability collection interface. Safely callable from the job manager's
/// task; no other concurrency contract.
pub trait CapabilityProbe: Send + Sync {
    /// Collect a fresh snapshot of this host.
    fn collect(&self) -> CapabilitySnapshot;

    /// Collect and compare against `previous`; `None` means no change.
    fn detect_change(&self, previous: &CapabilitySnapshot) -> Option<CapabilitySnapshot> {
        let current = self.collect();
        (current != *previous).then_some(current)
    }
}

/// Probe reading the local system. Disk figures are taken for the filesystem
/// holding `scan_root` (the job directory tree).
pub struct SystemProbe {
    scan_root: PathBuf,
}

impl SystemProbe {
    pub fn new(scan_root: impl Into<PathBuf>) -> Self {
        Self {
            scan_root: scan_root.into(),
        }
    }
}

impl CapabilityProbe for SystemProbe {
    fn collect(&self) -> CapabilitySnapshot {
        let (total_disk, available_disk) = disk_space(&self.scan_root).unwrap_or_else(|| {
            warn!(path = %self.scan_root.display(), "Could not assess disk space");
            (0, 0)
        });

        let snapshot = CapabilitySnapshot {
            os_name: std::env::consts::OS.to_string(),
            os_release: os_release(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_model: cpu_model(),
            logical_cores: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            physical_cores: None,
            total_memory_bytes: total_memory(),
            total_disk_bytes: total_disk,
            available_disk_bytes: available_disk,
        };
        debug!(?snapshot, "Collected capability snapshot");
        snapshot
    }
}

#[cfg(target_os = "linux")]
fn os_release() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
fn os_release() -> String {
    String::new()
}

#[cfg(target_os = "linux")]
fn cpu_model() -> Option<String> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    cpuinfo
        .lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split(':').nth(1))
        .map(|model| model.trim().to_string())
}

#[cfg(not(target_os = "linux"))]
fn cpu_model() -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn total_memory() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn total_memory() -> u64 {
    0
}

#[cfg(unix)]
fn disk_space(path: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let frsize = stat.f_frsize as u64;
    Some((stat.f_blocks as u64 * frsize, stat.f_bavail as u64 * frsize))
}

#[cfg(not(unix))]
fn disk_space(_path: &Path) -> Option<(u64, u64)> {
    None
}

/// Read the cached snapshot, if one exists and parses.
pub fn read_cached(path: &Path) -> Option<CapabilitySnapshot> {
    let data = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&data) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Discarding unreadable capability cache");
            None
        }
    }
}

/// Persist the snapshot cache.
pub fn write_cache(path: &Path, snapshot: &CapabilitySnapshot) -> std::io::Result<()> {
    let data = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_reports_cores_and_os() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = SystemProbe::new(tmp.path()).collect();
        assert!(snapshot.logical_cores >= 1);
        assert_eq!(snapshot.os_name, std::env::consts::OS);
    }

    struct FixedProbe(CapabilitySnapshot);

    impl CapabilityProbe for FixedProbe {
        fn collect(&self) -> CapabilitySnapshot {
            self.0.clone()
        }
    }

    #[test]
    fn test_detect_change_compares_against_previous() {
        let snapshot = CapabilitySnapshot {
            os_name: "Linux".into(),
            logical_cores: 8,
            ..Default::default()
        };
        let probe = FixedProbe(snapshot.clone());
        assert!(probe.detect_change(&snapshot).is_none());

        let mut smaller = snapshot.clone();
        smaller.logical_cores = 4;
        assert_eq!(probe.detect_change(&smaller), Some(snapshot));
    }

    #[test]
    fn test_cache_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("capability.json");
        let snapshot = SystemProbe::new(tmp.path()).collect();

        assert!(read_cached(&path).is_none());
        write_cache(&path, &snapshot).unwrap();
        assert_eq!(read_cached(&path).unwrap(), snapshot);
    }
}
