//! Core module - Instance lifecycle, launch strategies, and resource monitoring

pub mod bypass;
pub mod cloner;
pub mod error;
pub mod instance;
pub mod launcher;
pub mod locator;
pub mod monitor;
pub mod orchestrator;
pub mod process;
mod registry;
pub mod resource;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorBody, OrchestratorError, Result, StepOutcome};
pub use instance::{InstanceId, InstanceRecord, InstanceStatus, LaunchMethod, LaunchStrategy};
pub use launcher::LaunchOptions;
pub use locator::{Installations, Locator};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, ShutdownReport, StopResult};
pub use resource::ResourceUsage;
pub use settings::{Policies, Settings, SettingsPatch};
