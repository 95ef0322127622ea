//! Process management - Spawning invocations and owning the resulting handles

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::platform;

/// How long a script host gets to print the pid it started
const PID_REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// A fully structured command line; nothing is ever spliced into shell text
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    /// The program prints the pid of the process it starts on its first line
    pub reports_pid: bool,
}

impl Invocation {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            reports_pid: false,
        }
    }

    /// Rebuild a prepared [`Command`] as an invocation
    pub fn from_command(cmd: &Command) -> Self {
        Self {
            program: cmd.get_program().to_os_string(),
            args: cmd.get_args().map(|a| a.to_os_string()).collect(),
            env: cmd
                .get_envs()
                .filter_map(|(k, v)| {
                    Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned()))
                })
                .collect(),
            working_dir: cmd.get_current_dir().map(PathBuf::from),
            reports_pid: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn reporting_pid(mut self) -> Self {
        self.reports_pid = true;
        self
    }

    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

// Environment values may carry credentials, so only their keys are printed
impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("working_dir", &self.working_dir)
            .field("reports_pid", &self.reports_pid)
            .finish()
    }
}

/// Owned handle to a spawned instance process
pub trait ProcessHandle: Send {
    /// OS process id assigned at spawn time
    fn pid(&self) -> u32;

    /// `Ok(Some(description))` once the process is known to have exited
    fn try_exit(&mut self) -> io::Result<Option<String>>;

    /// Forcibly terminate the process and its descendants
    fn terminate_tree(&mut self) -> Result<()>;

    /// True for demo processes that do not exist in the OS process table
    fn is_synthetic(&self) -> bool {
        false
    }
}

/// Turns invocations into running processes
pub trait Spawner: Send + Sync {
    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn ProcessHandle>>;
}

/// A child we spawned and must reap
pub struct ChildProcess {
    child: Child,
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exit(&mut self) -> io::Result<Option<String>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| format!("Process exited with status: {}", status)))
    }

    fn terminate_tree(&mut self) -> Result<()> {
        let result = platform::kill_process_tree(self.child.id());
        // The direct child always dies here, so the wait cannot hang
        let _ = self.child.kill();
        let _ = self.child.wait();
        result
    }
}

/// A process started by a script host; only its pid is ours
pub struct ReportedProcess {
    pid: u32,
    host: Child,
}

impl ProcessHandle for ReportedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<Option<String>> {
        // Reap the host; liveness of the reported pid comes from the process table
        let _ = self.host.try_wait();
        Ok(None)
    }

    fn terminate_tree(&mut self) -> Result<()> {
        let result = platform::kill_process_tree(self.pid);
        if let Ok(None) = self.host.try_wait() {
            let _ = self.host.kill();
            let _ = self.host.wait();
        }
        result
    }
}

/// Spawns real OS processes
#[derive(Debug, Default)]
pub struct SystemSpawner;

impl Spawner for SystemSpawner {
    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn ProcessHandle>> {
        info!(
            "Spawning {:?} {:?}",
            invocation.program,
            invocation.args_lossy()
        );

        let mut cmd = invocation.to_command();
        platform::detach(&mut cmd);
        cmd.stdin(Stdio::null()).stderr(Stdio::null());

        if !invocation.reports_pid {
            let child = cmd.stdout(Stdio::null()).spawn()?;
            info!("Spawned process with PID {}", child.id());
            return Ok(Box::new(ChildProcess { child }));
        }

        let mut host = cmd.stdout(Stdio::piped()).spawn()?;
        let host_pid = host.id();
        match host.stdout.take().map(read_reported_pid) {
            Some(Ok(pid)) => {
                info!("Script host {} started PID {}", host_pid, pid);
                Ok(Box::new(ReportedProcess { pid, host }))
            }
            Some(Err(e)) => {
                warn!(
                    "Script host {} did not report a pid ({}); tracking the host",
                    host_pid, e
                );
                Ok(Box::new(ChildProcess { child: host }))
            }
            None => Ok(Box::new(ChildProcess { child: host })),
        }
    }
}

/// Read the first stdout line of a script host as a pid, bounded in time
fn read_reported_pid(stdout: std::process::ChildStdout) -> io::Result<u32> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let result = BufReader::new(stdout).read_line(&mut line).map(|_| line);
        let _ = tx.send(result);
    });

    let line = rx
        .recv_timeout(PID_REPORT_TIMEOUT)
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no pid reported"))??;
    parse_reported_pid(&line)
}

fn parse_reported_pid(line: &str) -> io::Result<u32> {
    line.trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected script output '{}'", line.trim()),
            )
        })
}

/// A synthetic process for hosts without the client installed
pub struct DemoProcess {
    pid: u32,
    alive: bool,
}

impl ProcessHandle for DemoProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<Option<String>> {
        Ok((!self.alive).then(|| "Demo process terminated".to_string()))
    }

    fn terminate_tree(&mut self) -> Result<()> {
        debug!("Demo: killed process {}", self.pid);
        self.alive = false;
        Ok(())
    }

    fn is_synthetic(&self) -> bool {
        true
    }
}

/// Spawner used with the demo installation; never starts anything
#[derive(Debug)]
pub struct DemoSpawner {
    next_pid: AtomicU32,
}

impl Default for DemoSpawner {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
        }
    }
}

impl Spawner for DemoSpawner {
    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn ProcessHandle>> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        info!(
            "Demo: launching {:?} as synthetic PID {}",
            invocation.program, pid
        );
        Ok(Box::new(DemoProcess { pid, alive: true }))
    }
}
