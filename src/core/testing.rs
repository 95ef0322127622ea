//! Test doubles for the OS seams

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use super::cloner::PackageManager;
use super::locator::PLAYER_EXECUTABLE;
use super::monitor::ProcessProbe;
use super::process::{Invocation, ProcessHandle, Spawner};
use super::resource::{ProcessSample, SystemMemory};

/// Lay out a packaged install under `root/WindowsApps` and return its directory
pub fn fake_package(root: &Path) -> PathBuf {
    let package = root
        .join("WindowsApps")
        .join("ROBLOXCORPORATION.ROBLOX_2.600.0_x64__55nm5eh3cm0pr");
    fs::create_dir_all(package.join("content")).unwrap();
    fs::create_dir_all(package.join("AppxMetadata")).unwrap();
    fs::write(
        package.join("AppxManifest.xml"),
        r#"<Package><Identity Name="ROBLOXCORPORATION.ROBLOX" Version="2.600.0.0" /></Package>"#,
    )
    .unwrap();
    fs::write(package.join("AppxSignature.p7x"), b"sig").unwrap();
    fs::write(package.join("AppxBlockMap.xml"), b"<BlockMap />").unwrap();
    fs::write(package.join("AppxMetadata").join("CodeIntegrity.cat"), b"cat").unwrap();
    fs::write(package.join("content").join("textures.pak"), b"pak").unwrap();
    fs::write(package.join(PLAYER_EXECUTABLE), b"").unwrap();
    package
}

/// Lay out a standard install under `root/Versions` and return the executable
pub fn fake_standard_install(root: &Path) -> PathBuf {
    let version = root.join("Versions").join("version-0123456789abcdef");
    fs::create_dir_all(&version).unwrap();
    let exe = version.join(PLAYER_EXECUTABLE);
    fs::write(&exe, b"").unwrap();
    exe
}

/// Package manager that records calls and fails on request
#[derive(Debug, Default)]
pub struct FakePackageManager {
    fail_register: bool,
    fail_unregister: bool,
    registered: Mutex<Vec<PathBuf>>,
    unregistered: Mutex<Vec<String>>,
}

impl FakePackageManager {
    pub fn failing_register() -> Self {
        Self {
            fail_register: true,
            ..Default::default()
        }
    }

    pub fn failing_unregister() -> Self {
        Self {
            fail_unregister: true,
            ..Default::default()
        }
    }

    pub fn registered(&self) -> Vec<PathBuf> {
        self.registered.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> Vec<String> {
        self.unregistered.lock().unwrap().clone()
    }
}

impl PackageManager for FakePackageManager {
    fn register(&self, manifest: &Path) -> Result<()> {
        self.registered.lock().unwrap().push(manifest.to_path_buf());
        if self.fail_register {
            anyhow::bail!("Deployment failed with HRESULT: 0x80073CF6");
        }
        Ok(())
    }

    fn unregister(&self, package_name: &str) -> Result<()> {
        self.unregistered.lock().unwrap().push(package_name.to_string());
        if self.fail_unregister {
            anyhow::bail!("Removal failed: package {} is in use", package_name);
        }
        Ok(())
    }
}

/// Handle whose exit is controlled by the test
pub struct FakeProcess {
    pid: u32,
    exited: Arc<AtomicBool>,
    fail_terminate: bool,
    terminate_delay: Duration,
    terminations: Arc<Mutex<Vec<u32>>>,
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<Option<String>> {
        Ok(self
            .exited
            .load(Ordering::SeqCst)
            .then(|| "Process exited with status: 0".to_string()))
    }

    fn terminate_tree(&mut self) -> Result<()> {
        if !self.terminate_delay.is_zero() {
            std::thread::sleep(self.terminate_delay);
        }
        self.terminations.lock().unwrap().push(self.pid);
        if self.fail_terminate {
            anyhow::bail!("Access is denied");
        }
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Spawner that records invocations and hands out distinct pids
#[derive(Debug)]
pub struct FakeSpawner {
    next_pid: AtomicU32,
    fail: bool,
    fail_terminate: bool,
    delay: Duration,
    terminate_delay: Duration,
    terminations: Arc<Mutex<Vec<u32>>>,
    invocations: Mutex<Vec<Invocation>>,
    exits: Mutex<HashMap<u32, Arc<AtomicBool>>>,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(5000),
            fail: false,
            fail_terminate: false,
            delay: Duration::ZERO,
            terminate_delay: Duration::ZERO,
            terminations: Arc::default(),
            invocations: Mutex::new(Vec::new()),
            exits: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeSpawner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Processes that refuse to die
    pub fn unkillable() -> Self {
        Self {
            fail_terminate: true,
            ..Default::default()
        }
    }

    /// Spawns take `delay`, widening the window for overlapping launches
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Kills take `delay`
    pub fn slow_to_terminate(delay: Duration) -> Self {
        Self {
            terminate_delay: delay,
            ..Default::default()
        }
    }

    /// Pids `terminate_tree` was called on, in order
    pub fn terminated(&self) -> Vec<u32> {
        self.terminations.lock().unwrap().clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn last_invocation(&self) -> Option<Invocation> {
        self.invocations.lock().unwrap().last().cloned()
    }

    /// Simulate the process exiting on its own
    pub fn exit(&self, pid: u32) {
        if let Some(flag) = self.exits.lock().unwrap().get(&pid) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn has_exited(&self, pid: u32) -> bool {
        self.exits
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn ProcessHandle>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.invocations.lock().unwrap().push(invocation.clone());
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::NotFound, "program not found"));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let exited = Arc::new(AtomicBool::new(false));
        self.exits.lock().unwrap().insert(pid, Arc::clone(&exited));
        Ok(Box::new(FakeProcess {
            pid,
            exited,
            fail_terminate: self.fail_terminate,
            terminate_delay: self.terminate_delay,
            terminations: Arc::clone(&self.terminations),
        }))
    }
}

/// Scripted process table entry
#[derive(Debug, Clone, Copy)]
pub enum FakeLiveness {
    Alive(ProcessSample),
    Fails,
    Hangs(Duration),
}

/// Process table with per-pid answers; unknown pids use the default
#[derive(Debug)]
pub struct FakeProbe {
    default: Option<FakeLiveness>,
    entries: Mutex<HashMap<u32, Option<FakeLiveness>>>,
    reclaimed: Mutex<Vec<u32>>,
}

impl FakeProbe {
    /// Every pid is alive unless told otherwise
    pub fn all_alive() -> Self {
        Self {
            default: Some(FakeLiveness::Alive(ProcessSample {
                cpu_percent: 5.0,
                memory_bytes: 512 * 1024 * 1024,
            })),
            entries: Mutex::new(HashMap::new()),
            reclaimed: Mutex::new(Vec::new()),
        }
    }

    /// Every pid is absent unless told otherwise
    pub fn empty() -> Self {
        Self {
            default: None,
            ..Self::all_alive()
        }
    }

    pub fn set(&self, pid: u32, liveness: FakeLiveness) {
        self.entries.lock().unwrap().insert(pid, Some(liveness));
    }

    /// Simulate the process disappearing from the table
    pub fn remove(&self, pid: u32) {
        self.entries.lock().unwrap().insert(pid, None);
    }

    pub fn reclaimed(&self) -> Vec<u32> {
        self.reclaimed.lock().unwrap().clone()
    }
}

impl ProcessProbe for FakeProbe {
    fn sample(&self, pid: u32) -> Result<Option<ProcessSample>> {
        let liveness = self
            .entries
            .lock()
            .unwrap()
            .get(&pid)
            .copied()
            .unwrap_or(self.default);
        match liveness {
            None => Ok(None),
            Some(FakeLiveness::Alive(sample)) => Ok(Some(sample)),
            Some(FakeLiveness::Fails) => anyhow::bail!("process table query failed"),
            Some(FakeLiveness::Hangs(duration)) => {
                std::thread::sleep(duration);
                Ok(None)
            }
        }
    }

    fn system_memory(&self) -> SystemMemory {
        SystemMemory {
            total_bytes: 16 * 1024 * 1024 * 1024,
            used_bytes: 8 * 1024 * 1024 * 1024,
        }
    }

    fn reclaim_memory(&self, pid: u32) -> Result<()> {
        self.reclaimed.lock().unwrap().push(pid);
        Ok(())
    }
}
