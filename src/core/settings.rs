//! Orchestrator settings and runtime policies

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Frame rate policy applied to launched clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FpsPolicy {
    /// Write a client settings override lifting the default 60 FPS cap
    pub unlock_frame_cap: bool,
    /// Target frame rate written into the override
    pub max_frame_rate: u32,
    /// How often the frame policy wants the monitor to run
    pub poll_interval_ms: u64,
}

impl Default for FpsPolicy {
    fn default() -> Self {
        Self {
            unlock_frame_cap: true,
            max_frame_rate: 240,
            poll_interval_ms: 1000,
        }
    }
}

/// Memory policy applied by the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourcePolicy {
    /// Working set budget per instance in MB (0 = unlimited)
    #[serde(rename = "maxMemoryPerInstanceMB")]
    pub max_memory_per_instance_mb: u64,
    /// How often the resource policy wants the monitor to run
    pub poll_interval_ms: u64,
    /// Trim the working set of instances over budget
    pub auto_reclaim: bool,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            max_memory_per_instance_mb: 4096,
            poll_interval_ms: 2000,
            auto_reclaim: true,
        }
    }
}

impl ResourcePolicy {
    /// Whether a working set of `memory_bytes` is over the configured budget
    pub fn is_over_budget(&self, memory_bytes: u64) -> bool {
        self.max_memory_per_instance_mb > 0
            && memory_bytes > self.max_memory_per_instance_mb * 1024 * 1024
    }
}

/// Partial update for [`FpsPolicy`]; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FpsPolicyPatch {
    #[serde(alias = "unlockFPS")]
    pub unlock_frame_cap: Option<bool>,
    #[serde(alias = "maxFPS")]
    pub max_frame_rate: Option<u32>,
    #[serde(alias = "monitorInterval")]
    pub poll_interval_ms: Option<u64>,
}

/// Partial update for [`ResourcePolicy`]; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePolicyPatch {
    #[serde(rename = "maxMemoryPerInstanceMB", alias = "maxRAMPerInstance")]
    pub max_memory_per_instance_mb: Option<u64>,
    #[serde(alias = "monitorInterval")]
    pub poll_interval_ms: Option<u64>,
    #[serde(alias = "autoCleanup")]
    pub auto_reclaim: Option<bool>,
}

/// Body of a settings update; unrecognized keys are ignored
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(alias = "fpsSettings")]
    pub fps_policy: Option<FpsPolicyPatch>,
    #[serde(alias = "ramPolicy", alias = "ramSettings")]
    pub resource_policy: Option<ResourcePolicyPatch>,
}

/// Both policies as returned from a settings update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Policies {
    pub fps_policy: FpsPolicy,
    pub resource_policy: ResourcePolicy,
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Policies
    pub fps_policy: FpsPolicy,
    pub resource_policy: ResourcePolicy,

    // Singleton bypass
    /// Hold the client's singleton mutex for the session
    pub acquire_mutex: bool,
    /// Flip the client's multi-instance registry values
    pub apply_registry_tweaks: bool,
    /// How long startup waits for the mutex holder to report
    pub bypass_timeout_ms: u64,

    // Monitoring
    /// Upper bound for one process-table query
    pub probe_timeout_ms: u64,

    // Advanced
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Enable debug logging
    pub debug_logging: bool,
    /// Keep instance history for N days (0 = forever)
    pub history_retention_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fps_policy: FpsPolicy::default(),
            resource_policy: ResourcePolicy::default(),

            acquire_mutex: true,
            apply_registry_tweaks: true,
            bypass_timeout_ms: 3000,

            probe_timeout_ms: 5000,

            data_directory: None,
            debug_logging: false,
            history_retention_days: 30,
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("MultiInstance")
        })
    }

    /// Root directory holding one subdirectory per packaged clone
    pub fn get_clone_root(&self) -> PathBuf {
        self.get_data_directory().join("package-clones")
    }

    /// Path of the settings/history database
    pub fn get_database_path(&self) -> PathBuf {
        self.get_data_directory().join("multiinstance.db")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.fps_policy.max_frame_rate = self.fps_policy.max_frame_rate.clamp(1, 1000);
        self.fps_policy.poll_interval_ms = self.fps_policy.poll_interval_ms.max(100);
        self.resource_policy.poll_interval_ms = self.resource_policy.poll_interval_ms.max(100);
        self.bypass_timeout_ms = self.bypass_timeout_ms.clamp(100, 30_000);
        self.probe_timeout_ms = self.probe_timeout_ms.max(100);
    }

    /// Merge a partial update into the policies
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(fps) = patch.fps_policy {
            if let Some(v) = fps.unlock_frame_cap {
                self.fps_policy.unlock_frame_cap = v;
            }
            if let Some(v) = fps.max_frame_rate {
                self.fps_policy.max_frame_rate = v;
            }
            if let Some(v) = fps.poll_interval_ms {
                self.fps_policy.poll_interval_ms = v;
            }
        }
        if let Some(resource) = patch.resource_policy {
            if let Some(v) = resource.max_memory_per_instance_mb {
                self.resource_policy.max_memory_per_instance_mb = v;
            }
            if let Some(v) = resource.poll_interval_ms {
                self.resource_policy.poll_interval_ms = v;
            }
            if let Some(v) = resource.auto_reclaim {
                self.resource_policy.auto_reclaim = v;
            }
        }
        self.validate();
    }

    pub fn policies(&self) -> Policies {
        Policies {
            fps_policy: self.fps_policy.clone(),
            resource_policy: self.resource_policy.clone(),
        }
    }

    /// Interval between monitor ticks: the tighter of the two policies
    pub fn monitor_interval(&self) -> Duration {
        let ms = self
            .fps_policy
            .poll_interval_ms
            .min(self.resource_policy.poll_interval_ms)
            .max(100);
        Duration::from_millis(ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn bypass_timeout(&self) -> Duration {
        Duration::from_millis(self.bypass_timeout_ms)
    }
}
