//! Unix-specific process control

use std::future::Future;
use std::io;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::debug;

/// Kill the process group led by `pid`, falling back to the single process.
///
/// Spawned instances call `setsid`, so their pid doubles as the group id.
pub fn kill_process_tree(pid: u32) -> Result<()> {
    let pid = pid as i32;
    if pid <= 0 {
        anyhow::bail!("Refusing to signal pid {}", pid);
    }

    unsafe {
        if libc::kill(-pid, libc::SIGKILL) == 0 {
            return Ok(());
        }
        if libc::kill(pid, libc::SIGKILL) == 0 {
            return Ok(());
        }
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("Process {} already exited", pid);
        Ok(())
    } else {
        anyhow::bail!("Failed to kill process {}: {}", pid, err)
    }
}

/// SIGINT or SIGTERM. Both handlers are installed before this returns.
pub fn termination_signal() -> io::Result<impl Future<Output = ()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => debug!("Received SIGINT"),
            _ = terminate.recv() => debug!("Received SIGTERM"),
        }
    })
}
