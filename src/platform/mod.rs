//! Platform-specific implementations for Windows and Unix hosts

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub mod unix;

use std::future::Future;
use std::io;
use std::process::Command;
use std::sync::mpsc::{Receiver, SyncSender};

use anyhow::Result;

/// Result of polling a named mutex once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutexAcquisition {
    /// We own the mutex until released
    Acquired,
    /// Another process owns it; the mutex exists either way
    HeldElsewhere,
    /// The OS refused to open the mutex
    Failed(String),
}

/// Forcibly terminate a process and all of its descendants.
///
/// A process that no longer exists is not an error.
pub fn kill_process_tree(pid: u32) -> Result<()> {
    #[cfg(windows)]
    {
        windows::kill_process_tree(pid)
    }
    #[cfg(unix)]
    {
        unix::kill_process_tree(pid)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Ask the OS to trim a process's working set
pub fn trim_working_set(pid: u32) -> Result<()> {
    #[cfg(windows)]
    {
        windows::trim_working_set(pid)
    }
    #[cfg(not(windows))]
    {
        let _ = pid;
        anyhow::bail!("Working set trimming is only supported on Windows")
    }
}

/// Open `name` without waiting, report the result on `report`, then hold
/// whatever was opened until `release` fires or its sender is dropped.
///
/// Runs on the calling thread; callers give it a dedicated one because
/// mutex ownership is tied to the thread that acquired it.
pub fn hold_named_mutex(name: &str, report: SyncSender<MutexAcquisition>, release: Receiver<()>) {
    #[cfg(windows)]
    {
        windows::hold_named_mutex(name, report, release)
    }
    #[cfg(not(windows))]
    {
        let _ = (name, release);
        let _ = report.send(MutexAcquisition::Failed(
            "Named mutexes are only supported on Windows".to_string(),
        ));
    }
}

/// Set a DWORD value under `HKEY_CURRENT_USER\<path>`
pub fn set_user_config_dword(path: &str, name: &str, value: u32) -> Result<()> {
    #[cfg(windows)]
    {
        windows::set_user_registry_dword(path, name, value)
    }
    #[cfg(not(windows))]
    {
        let _ = (path, name, value);
        anyhow::bail!("Registry configuration is only supported on Windows")
    }
}

/// Run a constant PowerShell script with its inputs passed as environment variables
pub fn run_script_host(script: &str, env: &[(&str, &str)]) -> Result<()> {
    #[cfg(windows)]
    {
        windows::run_powershell(script, env)
    }
    #[cfg(not(windows))]
    {
        let _ = (script, env);
        anyhow::bail!("The package manager is only available on Windows")
    }
}

/// Detach a command from our console and process group
pub fn detach(cmd: &mut Command) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(windows::DETACHED_PROCESS);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }
}

/// Install handlers for the process termination signals and return a
/// future that resolves when the first one arrives.
///
/// Must be called from within a tokio runtime.
pub fn termination_signal() -> io::Result<impl Future<Output = ()>> {
    #[cfg(windows)]
    {
        windows::termination_signal()
    }
    #[cfg(unix)]
    {
        unix::termination_signal()
    }
    #[cfg(not(any(windows, unix)))]
    {
        Ok(async {
            let _ = tokio::signal::ctrl_c().await;
        })
    }
}

/// Name of the host platform as reported by the health check
pub fn platform_name() -> &'static str {
    std::env::consts::OS
}
