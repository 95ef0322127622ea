//! Resource monitoring - Process table queries for tracked instances

use std::sync::Mutex;

use anyhow::Result;
use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::trace;

use super::resource::{ProcessSample, SystemMemory};
use crate::platform;

/// OS process table seam used by the monitor tick
pub trait ProcessProbe: Send + Sync {
    /// Look up a live process. `Ok(None)` means it is not in the table.
    fn sample(&self, pid: u32) -> Result<Option<ProcessSample>>;

    /// Host-wide memory totals
    fn system_memory(&self) -> SystemMemory;

    /// Ask the OS to trim the process's working set
    fn reclaim_memory(&self, pid: u32) -> Result<()>;
}

/// `sysinfo`-backed process table
pub struct SysinfoProbe {
    system: Mutex<System>,
    /// Logical CPUs, used to scale per-process CPU into 0-100
    cpu_count: f32,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f32;
        Self {
            system: Mutex::new(System::new()),
            cpu_count,
        }
    }
}

impl ProcessProbe for SysinfoProbe {
    fn sample(&self, pid: u32) -> Result<Option<ProcessSample>> {
        let mut system = self
            .system
            .lock()
            .map_err(|e| anyhow::anyhow!("Process table lock poisoned: {}", e))?;

        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        let Some(process) = system.process(pid) else {
            trace!("Process {} not in process table", pid);
            return Ok(None);
        };
        // An unreaped child lingers as a zombie after it exits
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return Ok(None);
        }

        Ok(Some(ProcessSample {
            cpu_percent: process.cpu_usage() / self.cpu_count,
            memory_bytes: process.memory(),
        }))
    }

    fn system_memory(&self) -> SystemMemory {
        let Ok(mut system) = self.system.lock() else {
            return SystemMemory::default();
        };
        system.refresh_memory_specifics(MemoryRefreshKind::everything());
        SystemMemory {
            total_bytes: system.total_memory(),
            used_bytes: system.used_memory(),
        }
    }

    fn reclaim_memory(&self, pid: u32) -> Result<()> {
        platform::trim_working_set(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_found() {
        let probe = SysinfoProbe::new();
        let sample = probe.sample(std::process::id()).unwrap();
        assert!(sample.is_some());
        assert!(sample.unwrap().memory_bytes > 0);
    }

    #[test]
    fn unknown_pid_is_absent() {
        let probe = SysinfoProbe::new();
        assert_eq!(probe.sample(99_999_999).unwrap(), None);
    }

    #[test]
    fn system_memory_reports_totals() {
        let memory = SysinfoProbe::new().system_memory();
        assert!(memory.total_bytes > 0);
        assert!(memory.percent() <= 100.0);
    }
}
