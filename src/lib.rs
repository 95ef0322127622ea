//! MultiInstance orchestrator - Run multiple copies of a single-instance game client
//!
//! Locates the client, defeats its singleton enforcement, launches instances
//! through one of several strategies, monitors them and tears them down.

pub mod core;
pub mod persistence;
pub mod platform;

pub use crate::core::{
    Installations, InstanceId, InstanceRecord, InstanceStatus, LaunchMethod, LaunchOptions,
    LaunchStrategy, Orchestrator, OrchestratorBuilder, OrchestratorError, Settings, SettingsPatch,
    ShutdownReport, StepOutcome, StopResult,
};
pub use crate::persistence::Database;

/// Application name constant
pub const APP_NAME: &str = "MultiInstance";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
