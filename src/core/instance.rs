//! Instance records - The orchestrator's view of one launched client

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::OrchestratorError;
use super::resource::ResourceUsage;

/// Unique identifier for an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Validate a caller-supplied id.
    ///
    /// Ids end up inside package identities and clone directory names, so
    /// only ASCII letters, digits, `-` and `.` are accepted.
    pub fn parse(raw: impl Into<String>) -> Result<Self, OrchestratorError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && !raw.starts_with('.')
            && !raw.contains("..")
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if valid {
            Ok(Self(raw))
        } else {
            Err(OrchestratorError::InvalidId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates `instance-<millis>` ids that never repeat within a process
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn next(&self) -> InstanceId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return InstanceId(format!("instance-{}", candidate)),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// How an instance was spawned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchStrategy {
    /// Spawn the located executable directly
    Direct,
    /// Ask the OS shell to open a `roblox-player:` URI
    UriScheme,
    /// Clone the packaged install under a new identity and launch the clone
    PackagedClone,
    /// Start the executable through a script host that reports the pid
    Scripted,
}

impl LaunchStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::UriScheme => "uri-scheme",
            Self::PackagedClone => "packaged-clone",
            Self::Scripted => "scripted",
        }
    }
}

impl std::fmt::Display for LaunchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Strategy requested by a caller; `Auto` resolves against the located installs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMethod {
    #[default]
    Auto,
    Direct,
    #[serde(alias = "protocol")]
    UriScheme,
    #[serde(alias = "uwp")]
    PackagedClone,
    #[serde(alias = "powershell")]
    Scripted,
}

impl LaunchMethod {
    /// The concrete strategy, or `None` for `Auto`
    pub fn explicit(&self) -> Option<LaunchStrategy> {
        match self {
            Self::Auto => None,
            Self::Direct => Some(LaunchStrategy::Direct),
            Self::UriScheme => Some(LaunchStrategy::UriScheme),
            Self::PackagedClone => Some(LaunchStrategy::PackagedClone),
            Self::Scripted => Some(LaunchStrategy::Scripted),
        }
    }
}

impl std::str::FromStr for LaunchMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "direct" => Ok(Self::Direct),
            "uri-scheme" | "protocol" => Ok(Self::UriScheme),
            "packaged-clone" | "uwp" => Ok(Self::PackagedClone),
            "scripted" | "powershell" => Ok(Self::Scripted),
            other => Err(format!("unknown launch method '{}'", other)),
        }
    }
}

/// Status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Spawned, not yet observed by the monitor
    Launching,
    /// Observed alive in the process table
    Running,
    /// The process exited or was stopped
    Stopped,
    /// The monitor failed to observe the process
    Crashed,
}

impl InstanceStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Launching | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Launching => "Launching",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Crashed => "Crashed",
        }
    }
}

static PLACE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"games/(\d+)").expect("place id pattern is valid"));

/// Caller-supplied target, e.g. `https://www.roblox.com/games/123456/Name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResource {
    /// The raw URL as supplied
    pub url: String,
    /// Numeric place identifier, when the URL carries one
    pub place_id: Option<String>,
}

impl TargetResource {
    pub fn parse(url: impl Into<String>) -> Self {
        let url = url.into();
        let place_id = PLACE_ID_PATTERN
            .captures(&url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        Self { url, place_id }
    }
}

/// Snapshot of one tracked instance as handed to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub os_process_id: u32,
    pub launch_strategy: LaunchStrategy,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub requested_target: Option<TargetResource>,
    pub resource_usage: ResourceUsage,
    /// On-disk clone for packaged-clone instances
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_dir: Option<PathBuf>,
    /// Set for synthetic demo processes that never touch the OS
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub demo: bool,
    /// Why the instance stopped or crashed, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl InstanceRecord {
    pub fn new(
        id: InstanceId,
        os_process_id: u32,
        launch_strategy: LaunchStrategy,
        requested_target: Option<TargetResource>,
    ) -> Self {
        Self {
            id,
            os_process_id,
            launch_strategy,
            status: InstanceStatus::Launching,
            started_at: Utc::now(),
            requested_target,
            resource_usage: ResourceUsage::default(),
            clone_dir: None,
            demo: false,
            last_error: None,
        }
    }

    /// Get uptime
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    /// Mark instance as running. Returns true if the status changed.
    pub fn mark_running(&mut self, usage: ResourceUsage) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let changed = self.status != InstanceStatus::Running;
        self.status = InstanceStatus::Running;
        self.resource_usage = usage;
        changed
    }

    /// Mark instance as stopped. Returns true if the status changed.
    pub fn mark_stopped(&mut self, reason: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = InstanceStatus::Stopped;
        self.resource_usage = ResourceUsage::default();
        self.last_error = reason;
        true
    }

    /// Mark instance as crashed. Returns true if the status changed.
    pub fn mark_crashed(&mut self, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = InstanceStatus::Crashed;
        self.resource_usage = ResourceUsage::default();
        self.last_error = Some(error.into());
        true
    }
}
