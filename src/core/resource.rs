//! Resource usage tracking for instances and the host

use serde::{Deserialize, Serialize};

/// Current resource usage for an instance, written only by the monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Approximate CPU usage percentage (0.0-100.0) across all cores
    pub cpu_percent: f32,
    /// Working set in bytes
    pub memory_bytes: u64,
    /// GPU usage percentage, zero where the platform does not report it
    pub gpu_percent: f32,
}

impl ResourceUsage {
    /// Format memory as human-readable string
    pub fn memory_string(&self) -> String {
        format_bytes(self.memory_bytes)
    }

    /// Memory usage in whole megabytes
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / (1024 * 1024)
    }
}

/// One process-table observation of a live process
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

impl From<ProcessSample> for ResourceUsage {
    fn from(sample: ProcessSample) -> Self {
        Self {
            cpu_percent: sample.cpu_percent.clamp(0.0, 100.0),
            memory_bytes: sample.memory_bytes,
            gpu_percent: 0.0,
        }
    }
}

/// Host-wide memory totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMemory {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl SystemMemory {
    /// Memory usage percentage
    pub fn percent(&self) -> f32 {
        if self.total_bytes > 0 {
            (self.used_bytes as f32 / self.total_bytes as f32) * 100.0
        } else {
            0.0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
