//! Singleton bypass - Holds the client's singleton mutex and flips its
//! multi-instance configuration

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::StepOutcome;
use crate::platform::{self, MutexAcquisition};

/// Mutex the client opens at startup to detect a running copy
pub const SINGLETON_MUTEX_NAME: &str = "ROBLOX_singletonEvent";

/// Registry key the client reads its instance policy from
pub const CLIENT_CONFIG_KEY: &str = r"SOFTWARE\Roblox Corporation\Roblox";

/// Values written under [`CLIENT_CONFIG_KEY`]
pub const CLIENT_CONFIG_VALUES: [(&str, u32); 2] = [("MultipleRoblox", 1), ("SingletonMutex", 0)];

/// Holds the singleton mutex for the orchestrator session
#[derive(Debug)]
pub struct BypassGuard {
    outcome: StepOutcome,
    release: Option<Sender<()>>,
    holder: Option<JoinHandle<()>>,
    reported: bool,
    /// This process created the mutex and its holder still owns it
    owned: bool,
}

impl BypassGuard {
    /// How acquisition went
    pub fn outcome(&self) -> &StepOutcome {
        &self.outcome
    }

    /// True only while this process owns the mutex
    pub fn is_held(&self) -> bool {
        self.owned && self.release.is_some()
    }

    /// Let go of the mutex. Safe to call more than once.
    pub fn release(&mut self) -> StepOutcome {
        let Some(release) = self.release.take() else {
            return StepOutcome::Succeeded;
        };
        let _ = release.send(());

        let holder = self.holder.take();
        // A holder that never reported may be stuck inside the OS call
        if !self.reported {
            debug!("Mutex holder never reported; leaving it detached");
            return StepOutcome::Warned("Mutex holder did not report before release".into());
        }
        match holder.map(JoinHandle::join) {
            Some(Err(_)) => StepOutcome::Failed("Mutex holder thread panicked".into()),
            _ => {
                info!("Released singleton mutex");
                StepOutcome::Succeeded
            }
        }
    }
}

impl Drop for BypassGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// One registry value write
#[derive(Debug, Clone, Serialize)]
pub struct ConfigTweak {
    pub name: &'static str,
    pub value: u32,
    pub outcome: StepOutcome,
}

/// Starts and configures the singleton bypass
pub struct SingletonBypass;

impl SingletonBypass {
    /// Poll the singleton mutex once on a dedicated thread and keep holding it.
    ///
    /// Waits at most `timeout` for the holder to report. A mutex already
    /// owned elsewhere counts as success since the client will still see it.
    pub fn acquire(timeout: Duration) -> BypassGuard {
        info!("Creating {} mutex...", SINGLETON_MUTEX_NAME);

        let (report_tx, report_rx) = mpsc::sync_channel(1);
        let (release_tx, release_rx) = mpsc::channel();

        let holder = thread::Builder::new()
            .name("singleton-mutex".into())
            .spawn(move || platform::hold_named_mutex(SINGLETON_MUTEX_NAME, report_tx, release_rx));
        let holder = match holder {
            Ok(h) => h,
            Err(e) => {
                warn!("Failed to start mutex holder: {}", e);
                return BypassGuard {
                    outcome: StepOutcome::Failed(e.to_string()),
                    release: None,
                    holder: None,
                    reported: false,
                    owned: false,
                };
            }
        };

        let (outcome, reported, owned) = match report_rx.recv_timeout(timeout) {
            Ok(MutexAcquisition::Acquired) => {
                info!("Multi-instance mutex created successfully");
                (StepOutcome::Succeeded, true, true)
            }
            Ok(MutexAcquisition::HeldElsewhere) => {
                info!("Mutex already exists - multi-instance should work");
                (StepOutcome::Succeeded, true, false)
            }
            Ok(MutexAcquisition::Failed(reason)) => {
                warn!("Mutex creation failed: {}", reason);
                (StepOutcome::Warned(reason), true, false)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Mutex creation timed out after {:?} - continuing anyway",
                    timeout
                );
                (StepOutcome::Warned("Mutex creation timed out".into()), false, false)
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Mutex holder exited without reporting");
                (
                    StepOutcome::Failed("Mutex holder exited without reporting".into()),
                    true,
                    false,
                )
            }
        };

        BypassGuard {
            outcome,
            release: Some(release_tx),
            holder: Some(holder),
            reported,
            owned,
        }
    }

    /// Write the multi-instance values; each write succeeds or warns on its own
    pub fn apply_config_tweaks() -> Vec<ConfigTweak> {
        info!("Modifying client configuration for multi-instance support...");

        CLIENT_CONFIG_VALUES
            .iter()
            .map(|&(name, value)| {
                let result = platform::set_user_config_dword(CLIENT_CONFIG_KEY, name, value);
                match &result {
                    Ok(()) => info!("Set {}={}", name, value),
                    Err(e) => warn!("Could not set {} (may need admin rights): {}", name, e),
                }
                ConfigTweak {
                    name,
                    value,
                    outcome: StepOutcome::warn_on_err(result),
                }
            })
            .collect()
    }
}
