//! Capability snapshot and resource accounting.

use serde::{Deserialize, Serialize};

/// Resources a job declares it needs, and the unit of committed-capacity
/// accounting during admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    /// Logical CPU cores.
    pub cores: u32,

    /// Working memory in bytes.
    pub memory_bytes: u64,

    /// Scratch disk in bytes under the job root.
    pub disk_bytes: u64,
}

impl ResourceClaim {
    /// Create a claim for the given cores and memory, no disk requirement.
    pub fn new(cores: u32, memory_bytes: u64) -> Self {
        Self {
            cores,
            memory_bytes,
            disk_bytes: 0,
        }
    }

    /// Builder method to set the disk requirement.
    pub fn with_disk(mut self, disk_bytes: u64) -> Self {
        self.disk_bytes = disk_bytes;
        self
    }

    /// Component-wise sum. Saturates rather than wrapping.
    pub fn plus(&self, other: &ResourceClaim) -> ResourceClaim {
        ResourceClaim {
            cores: self.cores.saturating_add(other.cores),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_add(other.disk_bytes),
        }
    }

    /// Component-wise difference. Saturates at zero.
    pub fn minus(&self, other: &ResourceClaim) -> ResourceClaim {
        ResourceClaim {
            cores: self.cores.saturating_sub(other.cores),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
        }
    }
}

/// Snapshot of the host hardware reported to the coordination service and
/// used locally for admission control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    /// Operating system name (e.g. "Linux").
    pub os_name: String,

    /// Kernel/OS release string.
    pub os_release: String,

    /// Machine architecture (e.g. "x86_64").
    pub architecture: String,

    /// CPU model string, if known.
    pub cpu_model: Option<String>,

    /// Logical core count.
    pub logical_cores: u32,

    /// Physical core count, if distinguishable.
    pub physical_cores: Option<u32>,

    /// Total system memory in bytes.
    pub total_memory_bytes: u64,

    /// Total disk under the job root in bytes.
    pub total_disk_bytes: u64,

    /// Free disk under the job root in bytes.
    pub available_disk_bytes: u64,
}

impl CapabilitySnapshot {
    /// The full capacity this snapshot offers for admission accounting.
    pub fn capacity(&self) -> ResourceClaim {
        ResourceClaim {
            cores: self.logical_cores,
            memory_bytes: self.total_memory_bytes,
            disk_bytes: self.available_disk_bytes,
        }
    }

    /// Whether `requested` fits into what is left of this snapshot once
    /// `committed` is subtracted.
    pub fn admits(&self, committed: &ResourceClaim, requested: &ResourceClaim) -> bool {
        let free = self.capacity().minus(committed);
        requested.cores <= free.cores
            && requested.memory_bytes <= free.memory_bytes
            && requested.disk_bytes <= free.disk_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> CapabilitySnapshot {
        CapabilitySnapshot {
            os_name: "Linux".into(),
            logical_cores: 8,
            total_memory_bytes: 16 << 30,
            available_disk_bytes: 100 << 30,
            ..Default::default()
        }
    }

    #[test]
    fn test_admits_within_free_capacity() {
        let snap = snapshot();
        let committed = ResourceClaim::new(4, 8 << 30);
        assert!(snap.admits(&committed, &ResourceClaim::new(4, 8 << 30)));
        assert!(!snap.admits(&committed, &ResourceClaim::new(5, 1 << 30)));
        assert!(!snap.admits(&committed, &ResourceClaim::new(1, 9 << 30)));
    }

    #[test]
    fn test_admits_checks_disk() {
        let snap = snapshot();
        let req = ResourceClaim::new(1, 1 << 30).with_disk(200 << 30);
        assert!(!snap.admits(&ResourceClaim::default(), &req));
    }

    #[test]
    fn test_minus_saturates() {
        let small = ResourceClaim::new(1, 1024);
        let big = ResourceClaim::new(4, 4096);
        assert_eq!(small.minus(&big), ResourceClaim::default());
    }
}
