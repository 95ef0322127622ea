//! Error and outcome types shared by the orchestrator

use serde::Serialize;
use thiserror::Error;

use super::instance::LaunchStrategy;

/// Errors surfaced directly to the caller of an orchestrator operation
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No Roblox installation found. Please install Roblox first.")]
    NoInstallation,

    #[error("No suitable launch method available")]
    NoLaunchMethod,

    #[error("The {0} launch method requires a standard Roblox installation")]
    StandardInstallMissing(LaunchStrategy),

    #[error("The packaged-clone launch method requires a packaged Roblox installation")]
    PackagedInstallMissing,

    #[error("Instance {0} not found")]
    NotFound(String),

    #[error("Instance {0} is already tracked")]
    DuplicateId(String),

    #[error("Invalid instance id '{0}': use letters, digits, '-' and '.' only")]
    InvalidId(String),

    #[error("Failed to spawn {strategy} instance: {source}")]
    Spawn {
        strategy: LaunchStrategy,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to clone package for instance {id}: {reason}")]
    Clone { id: String, reason: String },

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// The `{message}` body handed to API clients
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            message: self.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Serializable error shape for the API layer
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Result of a best-effort step that must not abort its caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum StepOutcome {
    Succeeded,
    Warned(String),
    Failed(String),
}

impl StepOutcome {
    /// Collapse a fallible step into a warning on failure
    pub fn warn_on_err<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(e) => Self::Warned(e.to_string()),
        }
    }

    /// Collapse a fallible step into a failure on error
    pub fn fail_on_err<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Warned(d) | Self::Failed(d) => Some(d),
        }
    }
}
