//! Host and per-process memory sampling.
//!
//! Wraps `sysinfo::System` behind a narrow `sample()`/`sample_process(pid)`
//! contract. Refreshes are scoped (`refresh_memory_specifics` /
//! `refresh_process`) rather than `refresh_all()`, to keep `sample()` well
//! under the 1ms budget the spec requires of the hot path.

use std::sync::Mutex;
use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, System};

/// An immutable sample of host memory pressure at a point in time.
///
/// `commit_ratio` is this project's portable stand-in for Windows commit
/// accounting: `(used_memory + used_swap) / (total_memory + total_swap)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub total_physical: u64,
    pub available_physical: u64,
    pub commit_charge: u64,
    pub commit_limit: u64,
    pub commit_ratio: f64,
    pub memory_load_percent: u8,
}

impl MemorySnapshot {
    /// A snapshot representing the worst case, used when the probe fails.
    pub fn worst_case() -> Self {
        Self {
            total_physical: 0,
            available_physical: 0,
            commit_charge: 1,
            commit_limit: 1,
            commit_ratio: 1.0,
            memory_load_percent: 100,
        }
    }
}

/// Peak memory observed for a single live child process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessMemory {
    pub peak_working_set_bytes: u64,
    pub peak_commit_bytes: u64,
}

/// Samples host and process memory. Cheap to construct; holds its
/// `sysinfo::System` behind a mutex since `sysinfo` refreshes require `&mut
/// self` and the probe is shared across tasks.
pub struct MemoryProbe {
    system: Mutex<System>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }

    /// Samples host-wide memory pressure. Never fails: a locked system
    /// handle that can't be read is treated the same as a failed OS call —
    /// the caller gets the worst-case snapshot and the governor falls open.
    pub fn sample(&self) -> MemorySnapshot {
        let Ok(mut system) = self.system.lock() else {
            return MemorySnapshot::worst_case();
        };
        system.refresh_memory_specifics(MemoryRefreshKind::everything());

        let total_physical = system.total_memory();
        let available_physical = system.available_memory();
        let total_swap = system.total_swap();
        let used_swap = system.used_swap();
        let used_memory = system.used_memory();

        let commit_charge = used_memory.saturating_add(used_swap);
        let commit_limit = total_physical.saturating_add(total_swap);

        if commit_limit == 0 {
            return MemorySnapshot::worst_case();
        }

        let commit_ratio = (commit_charge as f64 / commit_limit as f64).min(1.0);
        let memory_load_percent = (commit_ratio * 100.0).round().min(100.0) as u8;

        MemorySnapshot {
            total_physical,
            available_physical,
            commit_charge,
            commit_limit,
            commit_ratio,
            memory_load_percent,
        }
    }

    /// Samples peak working-set/commit for a live child process. Returns
    /// `None` if the process has already exited or can't be inspected.
    pub fn sample_process(&self, pid: u32) -> Option<ProcessMemory> {
        let mut system = self.system.lock().ok()?;
        let sys_pid = Pid::from_u32(pid);
        if !system.refresh_process_specifics(sys_pid, ProcessRefreshKind::everything()) {
            return None;
        }
        let process = system.process(sys_pid)?;
        Some(ProcessMemory {
            peak_working_set_bytes: process.memory(),
            peak_commit_bytes: process.virtual_memory(),
        })
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_case_snapshot_has_ratio_one() {
        let snap = MemorySnapshot::worst_case();
        assert_eq!(snap.commit_ratio, 1.0);
        assert_eq!(snap.memory_load_percent, 100);
    }

    #[test]
    fn sample_returns_a_ratio_in_bounds() {
        let probe = MemoryProbe::new();
        let snap = probe.sample();
        assert!(snap.commit_ratio >= 0.0 && snap.commit_ratio <= 1.0);
    }

    #[test]
    fn sample_process_of_self_succeeds() {
        let probe = MemoryProbe::new();
        let pid = std::process::id();
        // The current process should always be inspectable by itself.
        assert!(probe.sample_process(pid).is_some());
    }

    #[test]
    fn sample_process_of_bogus_pid_is_none() {
        let probe = MemoryProbe::new();
        assert!(probe.sample_process(u32::MAX).is_none());
    }
}
