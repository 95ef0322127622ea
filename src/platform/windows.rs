//! Windows-specific process control, singleton mutex and registry access

use anyhow::{Context, Result};
use std::future::Future;
use std::io;
use std::process::{Command, Stdio};
use std::sync::mpsc::{Receiver, SyncSender};
use tracing::{debug, warn};

use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, FALSE, WAIT_ABANDONED, WAIT_OBJECT_0,
};
use windows::Win32::System::ProcessStatus::K32EmptyWorkingSet;
use windows::Win32::System::Threading::{
    CreateMutexW, OpenProcess, ReleaseMutex, WaitForSingleObject, PROCESS_QUERY_INFORMATION,
    PROCESS_SET_QUOTA,
};
use tokio::signal::windows::{ctrl_c, ctrl_close};
use winreg::enums::HKEY_CURRENT_USER;
use winreg::RegKey;

use super::MutexAcquisition;

pub const DETACHED_PROCESS: u32 = 0x00000008;
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// WAIT_TIMEOUT as returned by WaitForSingleObject
const WAIT_TIMEOUT_CODE: u32 = 0x0000_0102;

/// taskkill exit code for "process not found"
const TASKKILL_NOT_FOUND: i32 = 128;

/// Kill a process tree with `taskkill /T /F`
pub fn kill_process_tree(pid: u32) -> Result<()> {
    use std::os::windows::process::CommandExt;

    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW)
        .stdin(Stdio::null())
        .output()
        .context("Failed to run taskkill")?;

    match output.status.code() {
        Some(0) => Ok(()),
        Some(TASKKILL_NOT_FOUND) => {
            debug!("Process {} already exited", pid);
            Ok(())
        }
        _ => anyhow::bail!(
            "taskkill failed for PID {}: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

/// Trim the working set of a process
pub fn trim_working_set(pid: u32) -> Result<()> {
    unsafe {
        let handle = OpenProcess(PROCESS_SET_QUOTA | PROCESS_QUERY_INFORMATION, FALSE, pid)
            .context("Failed to open process")?;

        let result = K32EmptyWorkingSet(handle);
        let _ = CloseHandle(handle);

        if result.as_bool() {
            Ok(())
        } else {
            anyhow::bail!("Failed to trim working set of PID {}", pid)
        }
    }
}

/// Open a named mutex, poll it once, and hold it until released
pub fn hold_named_mutex(name: &str, report: SyncSender<MutexAcquisition>, release: Receiver<()>) {
    let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();

    unsafe {
        let handle = match CreateMutexW(None, FALSE, PCWSTR::from_raw(wide.as_ptr())) {
            Ok(h) => h,
            Err(e) => {
                let _ = report.send(MutexAcquisition::Failed(e.to_string()));
                return;
            }
        };
        let existed = GetLastError() == ERROR_ALREADY_EXISTS;

        let wait = WaitForSingleObject(handle, 0);
        let owned = wait == WAIT_OBJECT_0 || wait == WAIT_ABANDONED;
        let state = if owned {
            MutexAcquisition::Acquired
        } else if wait.0 == WAIT_TIMEOUT_CODE {
            MutexAcquisition::HeldElsewhere
        } else {
            MutexAcquisition::Failed(format!("Wait on mutex returned {:?}", wait))
        };
        debug!("Mutex '{}' opened (existed: {}, owned: {})", name, existed, owned);

        let failed = matches!(state, MutexAcquisition::Failed(_));
        let _ = report.send(state);

        // Keep the handle open for the session, even when someone else owns it
        if !failed {
            let _ = release.recv();
        }

        if owned {
            if let Err(e) = ReleaseMutex(handle) {
                warn!("Failed to release mutex '{}': {}", name, e);
            }
        }
        let _ = CloseHandle(handle);
    }
}

/// Set a DWORD under HKEY_CURRENT_USER
pub fn set_user_registry_dword(path: &str, name: &str, value: u32) -> Result<()> {
    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let (key, _) = hkcu
        .create_subkey(path)
        .with_context(|| format!("Failed to open HKCU\\{}", path))?;
    key.set_value(name, &value)
        .with_context(|| format!("Failed to set {}", name))?;
    Ok(())
}

/// Run a PowerShell script; inputs arrive through `$env:` so none are spliced into the script
pub fn run_powershell(script: &str, env: &[(&str, &str)]) -> Result<()> {
    use std::os::windows::process::CommandExt;

    let mut cmd = Command::new("powershell");
    cmd.args(["-NoProfile", "-NonInteractive", "-Command", script])
        .creation_flags(CREATE_NO_WINDOW)
        .stdin(Stdio::null());
    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd.output().context("Failed to run PowerShell")?;
    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!(
            "PowerShell exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }
}

/// Ctrl+C or the console being closed
pub fn termination_signal() -> io::Result<impl Future<Output = ()>> {
    let mut interrupt = ctrl_c()?;
    let mut close = ctrl_close()?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => debug!("Received Ctrl+C"),
            _ = close.recv() => debug!("Console closed"),
        }
    })
}
