//! Orchestrator - Owns every tracked instance from launch to teardown

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bypass::{BypassGuard, SingletonBypass};
use super::cloner::{PackageCloner, PackageManager, SystemPackageManager};
use super::error::{OrchestratorError, Result, StepOutcome};
use super::instance::{IdGenerator, InstanceId, InstanceRecord, InstanceStatus, LaunchStrategy};
use super::launcher::{LaunchOptions, Launcher};
use super::locator::{Installations, Locator};
use super::monitor::{ProcessProbe, SysinfoProbe};
use super::process::{DemoSpawner, Spawner, SystemSpawner};
use super::registry::{lock_entry, Entry, Registry, SharedEntry};
use super::resource::{ResourceUsage, SystemMemory};
use super::settings::{Policies, Settings, SettingsPatch};
use crate::persistence::{events, Database, HistoryEvent};
use crate::platform;

/// Result of stopping one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopResult {
    pub success: bool,
    pub id: String,
    /// Teardown steps that degraded without failing the stop
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// What shutdown did, step by step
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub stopped: Vec<StopResult>,
    /// Ids whose stop returned an error
    pub failed: Vec<String>,
    pub bypass_release: StepOutcome,
    pub clone_root_removal: StepOutcome,
}

/// Working set trim result for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimResult {
    pub id: String,
    pub outcome: StepOutcome,
}

/// Aggregate numbers for a dashboard
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub instance_count: usize,
    pub running_count: usize,
    pub total_memory_bytes: u64,
    pub system_memory: SystemMemory,
    #[serde(flatten)]
    pub policies: Policies,
}

/// Readiness summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub platform: &'static str,
    pub ready: bool,
    pub demo: bool,
    pub standard_path: Option<PathBuf>,
    pub packaged_path: Option<PathBuf>,
    pub bypass_held: bool,
}

/// Builds an [`Orchestrator`]; every OS seam can be replaced
pub struct OrchestratorBuilder {
    settings: Settings,
    locator: Locator,
    installations: Option<Installations>,
    spawner: Option<Arc<dyn Spawner>>,
    probe: Option<Arc<dyn ProcessProbe>>,
    package_manager: Option<Arc<dyn PackageManager>>,
    database: Option<Arc<Database>>,
    singleton_bypass: bool,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            locator: Locator::system(),
            installations: None,
            spawner: None,
            probe: None,
            package_manager: None,
            database: None,
            singleton_bypass: true,
        }
    }
}

impl OrchestratorBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn locator(mut self, locator: Locator) -> Self {
        self.locator = locator;
        self
    }

    /// Skip discovery and use these installations
    pub fn installations(mut self, installations: Installations) -> Self {
        self.installations = Some(installations);
        self
    }

    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn package_manager(mut self, package_manager: Arc<dyn PackageManager>) -> Self {
        self.package_manager = Some(package_manager);
        self
    }

    pub fn database(mut self, database: Arc<Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Leave the singleton mutex and client configuration alone
    pub fn without_singleton_bypass(mut self) -> Self {
        self.singleton_bypass = false;
        self
    }

    /// Locate installations, start the singleton bypass and assemble the orchestrator
    pub fn build(self) -> Result<Orchestrator> {
        let mut settings = self.settings;
        settings.validate();

        let installations = match self.installations {
            Some(installations) => installations,
            None => self.locator.locate()?,
        };

        let spawner: Arc<dyn Spawner> = match self.spawner {
            Some(spawner) => spawner,
            None if installations.demo => {
                info!("Demo installation in use; instances will be synthetic");
                Arc::new(DemoSpawner::default())
            }
            None => Arc::new(SystemSpawner),
        };
        let probe: Arc<dyn ProcessProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(SysinfoProbe::new()),
        };
        let package_manager: Arc<dyn PackageManager> = match self.package_manager {
            Some(package_manager) => package_manager,
            None => Arc::new(SystemPackageManager),
        };

        let bypass = if self.singleton_bypass && !installations.demo {
            start_bypass(&settings)
        } else {
            debug!("Singleton bypass skipped");
            None
        };

        if let Some(ref db) = self.database {
            if let Err(e) = db.cleanup_history(settings.history_retention_days) {
                warn!("Failed to clean up instance history: {:#}", e);
            }
        }

        let cloner = Arc::new(PackageCloner::new(settings.get_clone_root(), package_manager));
        let launcher = Launcher::new(installations.clone(), Arc::clone(&cloner), spawner);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            "Orchestrator ready (standard: {}, packaged: {}, demo: {})",
            installations.standard_path.is_some(),
            installations.packaged_path.is_some(),
            installations.demo
        );

        Ok(Orchestrator {
            installations,
            launcher,
            cloner,
            probe,
            registry: Registry::default(),
            settings: RwLock::new(settings),
            ids: IdGenerator::default(),
            bypass: Mutex::new(bypass),
            database: self.database,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        })
    }
}

fn start_bypass(settings: &Settings) -> Option<BypassGuard> {
    if settings.apply_registry_tweaks {
        for tweak in SingletonBypass::apply_config_tweaks() {
            if let Some(detail) = tweak.outcome.detail() {
                debug!("Config tweak {} degraded: {}", tweak.name, detail);
            }
        }
    }
    if !settings.acquire_mutex {
        return None;
    }
    let guard = SingletonBypass::acquire(settings.bypass_timeout());
    if let Some(detail) = guard.outcome().detail() {
        warn!("Singleton bypass degraded: {}", detail);
    }
    Some(guard)
}

/// The explicitly owned orchestrator context
pub struct Orchestrator {
    installations: Installations,
    launcher: Launcher,
    cloner: Arc<PackageCloner>,
    probe: Arc<dyn ProcessProbe>,
    registry: Registry,
    settings: RwLock<Settings>,
    ids: IdGenerator,
    bypass: Mutex<Option<BypassGuard>>,
    database: Option<Arc<Database>>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Installation paths located at startup
    pub fn locate(&self) -> Installations {
        self.installations.clone()
    }

    /// Launch a new instance. A record exists only if a process was spawned.
    pub fn launch(&self, options: LaunchOptions) -> Result<InstanceRecord> {
        let reservation = match options.id.as_deref() {
            Some(raw) => self.registry.reserve(&InstanceId::parse(raw)?)?,
            None => loop {
                match self.registry.reserve(&self.ids.next()) {
                    Err(OrchestratorError::DuplicateId(_)) => continue,
                    other => break other?,
                }
            },
        };
        let id = reservation.id().clone();
        let fps_policy = self.read_settings()?.fps_policy;

        let launched = self.launcher.launch(&id, &options, &fps_policy)?;
        for warning in &launched.warnings {
            warn!("Instance {} launched with warning: {}", id, warning);
        }

        let pid = launched.handle.pid();
        let mut record = InstanceRecord::new(id.clone(), pid, launched.strategy, launched.target);
        record.clone_dir = launched.clone_dir;
        record.demo = launched.handle.is_synthetic();

        let record = reservation.insert(Entry {
            record,
            handle: Some(launched.handle),
            removed: false,
        })?;

        info!(
            "Instance {} launched via {} with PID {}",
            id, record.launch_strategy, pid
        );
        self.record_event(
            &id,
            events::LAUNCHED,
            Some(&format!("{} pid={}", record.launch_strategy, pid)),
        );
        Ok(record)
    }

    /// Kill an instance's process tree, tear down its clone and forget it
    pub fn stop(&self, id: &str) -> Result<StopResult> {
        let not_found = || OrchestratorError::NotFound(id.to_string());
        let id = InstanceId::parse(id).map_err(|_| not_found())?;
        let entry = self.registry.lookup(&id)?.ok_or_else(not_found)?;

        // Claim the entry under its lock, then run the slow OS steps without it
        let (record, handle, already_exited, stopped_now) = {
            let mut entry = lock_entry(&entry)?;
            if entry.removed {
                return Err(not_found());
            }
            entry.removed = true;
            let already_exited = entry.record.status == InstanceStatus::Stopped;
            let stopped_now = entry
                .record
                .mark_stopped(Some("Stopped by request".to_string()));
            let handle = entry.handle.take();
            (entry.record.clone(), handle, already_exited, stopped_now)
        };
        if stopped_now {
            self.record_event(&id, events::STOPPED, None);
        }

        info!(
            "Stopping instance {} (PID {}, up {}s)",
            id,
            record.os_process_id,
            record.uptime().num_seconds()
        );
        let mut warnings = Vec::new();
        match handle {
            // The pid may already belong to another process
            Some(mut handle) if already_exited => {
                debug!(
                    "Instance {} already exited; not signalling PID {}",
                    id, record.os_process_id
                );
                let _ = handle.try_exit();
            }
            Some(mut handle) => {
                if let Err(e) = handle.terminate_tree() {
                    warn!("Failed to kill instance {}: {:#}", id, e);
                    warnings.push(format!("Process termination failed: {:#}", e));
                }
            }
            None => {}
        }

        if record.launch_strategy == LaunchStrategy::PackagedClone {
            warnings.extend(self.cloner.unregister_clone(&id).details());
        }

        self.registry.remove(&id)?;
        self.record_event(&id, events::REMOVED, None);
        info!("Instance {} removed", id);

        Ok(StopResult {
            success: true,
            id: id.to_string(),
            warnings,
        })
    }

    /// Snapshots of every tracked instance
    pub fn list(&self) -> Result<Vec<InstanceRecord>> {
        self.registry.snapshots()
    }

    pub fn get(&self, id: &str) -> Result<InstanceRecord> {
        let not_found = || OrchestratorError::NotFound(id.to_string());
        let id = InstanceId::parse(id).map_err(|_| not_found())?;
        let entry = self.registry.lookup(&id)?.ok_or_else(not_found)?;
        let entry = lock_entry(&entry)?;
        if entry.removed {
            return Err(not_found());
        }
        Ok(entry.record.clone())
    }

    /// Run one monitor tick, then list
    pub async fn refresh(&self) -> Result<Vec<InstanceRecord>> {
        self.tick().await;
        self.list()
    }

    /// Observe every active instance once. Returns how many records changed status.
    pub async fn tick(&self) -> usize {
        let entries = match self.registry.entries() {
            Ok(entries) => entries,
            Err(e) => {
                error!("Monitor tick skipped: {}", e);
                return 0;
            }
        };
        let (timeout, policy) = match self.read_settings() {
            Ok(s) => (s.probe_timeout(), s.resource_policy),
            Err(e) => {
                error!("Monitor tick skipped: {}", e);
                return 0;
            }
        };

        let mut changed = 0;
        for entry in entries {
            let observed = self.observe(&entry, timeout).await;
            if observed.changed {
                changed += 1;
            }
            if let Some((id, pid, usage)) = observed.running {
                if policy.auto_reclaim && policy.is_over_budget(usage.memory_bytes) {
                    info!(
                        "Instance {} uses {} (budget {} MB); reclaiming",
                        id,
                        usage.memory_string(),
                        policy.max_memory_per_instance_mb
                    );
                    let outcome = self.reclaim_pid(pid, timeout).await;
                    if let Some(detail) = outcome.detail() {
                        warn!("Memory reclaim for {} degraded: {}", id, detail);
                    }
                }
            }
        }
        changed
    }

    async fn observe(&self, shared: &SharedEntry, timeout: Duration) -> Observation {
        let (id, pid) = {
            let Ok(mut entry) = lock_entry(shared) else {
                return Observation::default();
            };
            if entry.removed || !entry.record.status.is_active() {
                return Observation::default();
            }
            let id = entry.record.id.clone();
            let Some(handle) = entry.handle.as_mut() else {
                return Observation::default();
            };

            match handle.try_exit() {
                Ok(Some(reason)) => {
                    let changed = entry.record.mark_stopped(Some(reason));
                    drop(entry);
                    return self.transitioned(&id, InstanceStatus::Stopped, changed);
                }
                Err(e) => {
                    let changed = entry
                        .record
                        .mark_crashed(format!("Failed to poll process: {}", e));
                    drop(entry);
                    return self.transitioned(&id, InstanceStatus::Crashed, changed);
                }
                Ok(None) => {}
            }

            if entry.handle.as_ref().is_some_and(|h| h.is_synthetic()) {
                let changed = entry.record.mark_running(ResourceUsage::default());
                drop(entry);
                return self.transitioned(&id, InstanceStatus::Running, changed);
            }
            (id, entry.record.os_process_id)
        };

        // No lock is held while the process table is queried
        let probe = Arc::clone(&self.probe);
        let query = tokio::task::spawn_blocking(move || probe.sample(pid));
        let result = tokio::time::timeout(timeout, query).await;

        let Ok(mut entry) = lock_entry(shared) else {
            return Observation::default();
        };
        if entry.removed || !entry.record.status.is_active() {
            return Observation::default();
        }

        let (status, changed) = match result {
            Err(_) => {
                warn!(
                    "Process query for instance {} timed out after {:?}",
                    id, timeout
                );
                return Observation::default();
            }
            Ok(Err(e)) => {
                let changed = entry
                    .record
                    .mark_crashed(format!("Process query aborted: {}", e));
                (InstanceStatus::Crashed, changed)
            }
            Ok(Ok(Err(e))) => {
                let changed = entry
                    .record
                    .mark_crashed(format!("Failed to query process {}: {:#}", pid, e));
                (InstanceStatus::Crashed, changed)
            }
            Ok(Ok(Ok(None))) => {
                let changed = entry
                    .record
                    .mark_stopped(Some("Process no longer running".to_string()));
                (InstanceStatus::Stopped, changed)
            }
            Ok(Ok(Ok(Some(sample)))) => {
                let usage = ResourceUsage::from(sample);
                let changed = entry.record.mark_running(usage);
                drop(entry);
                let mut observation = self.transitioned(&id, InstanceStatus::Running, changed);
                observation.running = Some((id, pid, usage));
                return observation;
            }
        };
        drop(entry);
        self.transitioned(&id, status, changed)
    }

    fn transitioned(&self, id: &InstanceId, status: InstanceStatus, changed: bool) -> Observation {
        if changed {
            match status {
                InstanceStatus::Running => info!("Instance {} is running", id),
                InstanceStatus::Stopped => info!("Instance {} stopped", id),
                InstanceStatus::Crashed => warn!("Instance {} crashed", id),
                InstanceStatus::Launching => {}
            }
            let event = match status {
                InstanceStatus::Running => Some(events::RUNNING),
                InstanceStatus::Stopped => Some(events::STOPPED),
                InstanceStatus::Crashed => Some(events::CRASHED),
                InstanceStatus::Launching => None,
            };
            if let Some(event) = event {
                self.record_event(id, event, None);
            }
        }
        Observation {
            changed,
            running: None,
        }
    }

    /// Run [`Self::tick`] on the policy interval until shutdown
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Instance monitor started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let interval = orchestrator.monitor_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        orchestrator.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Instance monitor stopped");
        })
    }

    fn monitor_interval(&self) -> Duration {
        self.read_settings()
            .map(|s| s.monitor_interval())
            .unwrap_or_else(|_| Settings::default().monitor_interval())
    }

    /// Merge a partial policy update and persist the result
    pub fn update_settings(&self, patch: SettingsPatch) -> Result<Policies> {
        let (policies, snapshot) = {
            let mut settings = self
                .settings
                .write()
                .map_err(|_| OrchestratorError::LockPoisoned("Settings"))?;
            settings.apply(patch);
            (settings.policies(), settings.clone())
        };

        info!(
            "Settings updated (max frame rate {}, memory budget {} MB)",
            policies.fps_policy.max_frame_rate, policies.resource_policy.max_memory_per_instance_mb
        );
        if let Some(ref db) = self.database {
            if let Err(e) = db.save_settings(&snapshot) {
                warn!("Failed to persist settings: {:#}", e);
            }
        }
        Ok(policies)
    }

    pub fn settings(&self) -> Result<Settings> {
        self.read_settings()
    }

    fn read_settings(&self) -> Result<Settings> {
        Ok(self
            .settings
            .read()
            .map_err(|_| OrchestratorError::LockPoisoned("Settings"))?
            .clone())
    }

    /// Stop everything, release the bypass and remove the clone root. Safe to repeat.
    pub fn shutdown(&self) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already ran; repeating cleanup");
        } else {
            info!("Shutting down orchestrator...");
        }
        self.shutdown_tx.send_replace(true);

        let ids = self.registry.ids().unwrap_or_else(|e| {
            error!("Could not list instances for shutdown: {}", e);
            Vec::new()
        });

        let mut stopped = Vec::new();
        let mut failed = Vec::new();
        for id in ids {
            match self.stop(id.as_str()) {
                Ok(result) => stopped.push(result),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!("Failed to stop instance {} during shutdown: {}", id, e);
                    failed.push(id.to_string());
                }
            }
        }

        let bypass_release = match self.bypass.lock() {
            Ok(mut bypass) => bypass
                .take()
                .map(|mut guard| guard.release())
                .unwrap_or(StepOutcome::Succeeded),
            Err(_) => StepOutcome::Failed("Bypass lock poisoned".to_string()),
        };

        let clone_root_removal = self.cloner.remove_clone_root();
        if let Some(detail) = clone_root_removal.detail() {
            warn!("Failed to remove clone root: {}", detail);
        }

        info!("Shutdown complete ({} instances stopped)", stopped.len());
        ShutdownReport {
            stopped,
            failed,
            bypass_release,
            clone_root_removal,
        }
    }

    /// Run [`Self::shutdown`] on its own thread and wait at most `limit` for it.
    ///
    /// Returns `None` when teardown is still running at the deadline. The
    /// thread is left detached so process exit does not wait on it.
    pub async fn shutdown_within(self: &Arc<Self>, limit: Duration) -> Option<ShutdownReport> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let orchestrator = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("teardown".into())
            .spawn(move || {
                let _ = tx.send(orchestrator.shutdown());
            });
        if let Err(e) = spawned {
            error!("Failed to start teardown thread: {}", e);
            return None;
        }

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(_)) => {
                error!("Teardown thread exited without a report");
                None
            }
            Err(_) => {
                error!("Shutdown timed out after {:?}", limit);
                None
            }
        }
    }

    /// Trim one instance's working set
    pub fn reclaim(&self, id: &str) -> Result<ReclaimResult> {
        let record = self.get(id)?;
        let outcome = if record.demo {
            StepOutcome::Warned("Demo instances have no working set".to_string())
        } else if !record.status.is_active() {
            StepOutcome::Warned(format!("Instance is {}", record.status.label()))
        } else {
            StepOutcome::warn_on_err(
                self.probe
                    .reclaim_memory(record.os_process_id)
                    .map_err(|e| format!("{:#}", e)),
            )
        };
        Ok(ReclaimResult {
            id: record.id.to_string(),
            outcome,
        })
    }

    /// Trim every running instance's working set
    pub fn reclaim_all(&self) -> Result<Vec<ReclaimResult>> {
        self.list()?
            .into_iter()
            .filter(|r| r.status == InstanceStatus::Running)
            .map(|r| self.reclaim(r.id.as_str()))
            .filter(|r| !matches!(r, Err(e) if e.is_not_found()))
            .collect()
    }

    async fn reclaim_pid(&self, pid: u32, timeout: Duration) -> StepOutcome {
        let probe = Arc::clone(&self.probe);
        let trim = tokio::task::spawn_blocking(move || probe.reclaim_memory(pid));
        match tokio::time::timeout(timeout, trim).await {
            Ok(Ok(result)) => StepOutcome::warn_on_err(result.map_err(|e| format!("{:#}", e))),
            Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
            Err(_) => StepOutcome::Warned("Memory reclaim timed out".to_string()),
        }
    }

    pub fn stats(&self) -> Result<Stats> {
        let records = self.list()?;
        Ok(Stats {
            instance_count: records.len(),
            running_count: records
                .iter()
                .filter(|r| r.status == InstanceStatus::Running)
                .count(),
            total_memory_bytes: records.iter().map(|r| r.resource_usage.memory_bytes).sum(),
            system_memory: self.probe.system_memory(),
            policies: self.read_settings()?.policies(),
        })
    }

    pub fn health(&self) -> Health {
        Health {
            platform: platform::platform_name(),
            ready: self.installations.is_ready(),
            demo: self.installations.demo,
            standard_path: self.installations.standard_path.clone(),
            packaged_path: self.installations.packaged_path.clone(),
            bypass_held: self
                .bypass
                .lock()
                .map(|b| b.as_ref().is_some_and(BypassGuard::is_held))
                .unwrap_or(false),
        }
    }

    /// Lifecycle events recorded for an id, newest first
    pub fn history(&self, id: &str) -> Result<Vec<HistoryEvent>> {
        match self.database {
            Some(ref db) => Ok(db.get_instance_history(id)?),
            None => Ok(Vec::new()),
        }
    }

    fn record_event(&self, id: &InstanceId, event: &str, details: Option<&str>) {
        if let Some(ref db) = self.database {
            if let Err(e) = db.record_instance_event(id.as_str(), event, details) {
                warn!("Failed to record {} event for {}: {:#}", event, id, e);
            }
        }
    }
}

#[derive(Default)]
struct Observation {
    changed: bool,
    running: Option<(InstanceId, u32, ResourceUsage)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instance::LaunchMethod;
    use crate::core::resource::ProcessSample;
    use crate::core::testing::{
        fake_package, fake_standard_install, FakeLiveness, FakePackageManager, FakeProbe,
        FakeSpawner,
    };
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        tmp: TempDir,
        spawner: Arc<FakeSpawner>,
        probe: Arc<FakeProbe>,
        package_manager: Arc<FakePackageManager>,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness_with(
        spawner: FakeSpawner,
        probe: FakeProbe,
        package_manager: FakePackageManager,
        configure: impl FnOnce(&mut Settings),
    ) -> Harness {
        let tmp = TempDir::new().unwrap();
        let installations = Installations {
            standard_path: Some(fake_standard_install(tmp.path())),
            packaged_path: Some(fake_package(tmp.path())),
            demo: false,
        };
        let mut settings = Settings {
            data_directory: Some(tmp.path().join("data")),
            ..Settings::default()
        };
        configure(&mut settings);

        let database = Database::open_in_memory().unwrap();
        database.initialize().unwrap();

        let spawner = Arc::new(spawner);
        let probe = Arc::new(probe);
        let package_manager = Arc::new(package_manager);
        let orchestrator = Orchestrator::builder()
            .settings(settings)
            .installations(installations)
            .spawner(spawner.clone())
            .probe(probe.clone())
            .package_manager(package_manager.clone())
            .database(Arc::new(database))
            .without_singleton_bypass()
            .build()
            .unwrap();

        Harness {
            tmp,
            spawner,
            probe,
            package_manager,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn harness() -> Harness {
        harness_with(
            FakeSpawner::default(),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |_| {},
        )
    }

    fn direct() -> LaunchOptions {
        LaunchOptions::with_strategy(LaunchMethod::Direct)
    }

    #[test]
    fn launched_instance_is_listed_as_launching() {
        let h = harness();
        let record = h.orchestrator.launch(direct()).unwrap();

        let listed = h.orchestrator.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, record.id);
        assert_eq!(listed[0].status, InstanceStatus::Launching);
        assert!(record.id.as_str().starts_with("instance-"));
        assert_eq!(h.orchestrator.get(record.id.as_str()).unwrap().os_process_id, record.os_process_id);
    }

    #[tokio::test]
    async fn tick_marks_alive_instance_running_then_stopped() {
        let h = harness();
        let record = h.orchestrator.launch(direct()).unwrap();

        let listed = h.orchestrator.refresh().await.unwrap();
        assert_eq!(listed[0].status, InstanceStatus::Running);
        assert_eq!(listed[0].resource_usage.memory_bytes, 512 * 1024 * 1024);

        h.probe.remove(record.os_process_id);
        h.orchestrator.tick().await;
        let record = h.orchestrator.get(record.id.as_str()).unwrap();
        assert_eq!(record.status, InstanceStatus::Stopped);
        assert_eq!(record.resource_usage, ResourceUsage::default());
    }

    #[tokio::test]
    async fn exited_child_is_stopped_without_consulting_the_table() {
        let h = harness();
        let record = h.orchestrator.launch(direct()).unwrap();
        h.spawner.exit(record.os_process_id);

        assert_eq!(h.orchestrator.tick().await, 1);
        let record = h.orchestrator.get(record.id.as_str()).unwrap();
        assert_eq!(record.status, InstanceStatus::Stopped);
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn query_failure_marks_crashed_and_stays_listed() {
        let h = harness();
        let record = h.orchestrator.launch(direct()).unwrap();
        h.probe.set(record.os_process_id, FakeLiveness::Fails);

        h.orchestrator.tick().await;
        let listed = h.orchestrator.list().unwrap();
        assert_eq!(listed[0].status, InstanceStatus::Crashed);

        // Terminal: a later successful query does not revive it
        h.probe.set(
            record.os_process_id,
            FakeLiveness::Alive(ProcessSample::default()),
        );
        assert_eq!(h.orchestrator.tick().await, 0);
        assert_eq!(
            h.orchestrator.get(record.id.as_str()).unwrap().status,
            InstanceStatus::Crashed
        );

        assert!(h.orchestrator.stop(record.id.as_str()).unwrap().success);
        assert!(h.orchestrator.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hung_query_leaves_record_untouched() {
        let h = harness_with(
            FakeSpawner::default(),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |s| s.probe_timeout_ms = 100,
        );
        let record = h.orchestrator.launch(direct()).unwrap();
        h.probe.set(
            record.os_process_id,
            FakeLiveness::Hangs(Duration::from_millis(400)),
        );

        assert_eq!(h.orchestrator.tick().await, 0);
        assert_eq!(
            h.orchestrator.get(record.id.as_str()).unwrap().status,
            InstanceStatus::Launching
        );
    }

    #[test]
    fn stopping_packaged_clone_removes_directory_even_if_unregister_fails() {
        let h = harness_with(
            FakeSpawner::default(),
            FakeProbe::all_alive(),
            FakePackageManager::failing_unregister(),
            |_| {},
        );
        let record = h
            .orchestrator
            .launch(LaunchOptions::with_strategy(LaunchMethod::PackagedClone).id("alt1"))
            .unwrap();
        let clone_dir = record.clone_dir.clone().unwrap();
        assert!(clone_dir.is_dir());
        assert_eq!(h.package_manager.registered().len(), 1);

        let result = h.orchestrator.stop("alt1").unwrap();
        assert!(result.success);
        assert_eq!(result.id, "alt1");
        assert!(result.warnings.iter().any(|w| w.contains("unregistration")));
        assert!(!clone_dir.exists());
        assert_eq!(
            h.package_manager.unregistered(),
            vec!["ROBLOXCORPORATION.ROBLOX.alt1".to_string()]
        );
        assert!(h.orchestrator.list().unwrap().is_empty());
    }

    #[test]
    fn stopping_unknown_id_is_not_found_and_changes_nothing() {
        let h = harness();
        let record = h.orchestrator.launch(direct()).unwrap();

        let err = h.orchestrator.stop("nope").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.body().message, "Instance nope not found");
        assert!(h.orchestrator.stop("../etc").unwrap_err().is_not_found());

        let listed = h.orchestrator.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, record.id);
        assert!(!h.spawner.has_exited(record.os_process_id));
    }

    #[test]
    fn stop_kills_the_process_and_second_stop_is_not_found() {
        let h = harness();
        let record = h.orchestrator.launch(direct().id("alt2")).unwrap();

        h.orchestrator.stop("alt2").unwrap();
        assert!(h.spawner.has_exited(record.os_process_id));
        assert!(h.orchestrator.stop("alt2").unwrap_err().is_not_found());
        assert!(h.orchestrator.get("alt2").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn stop_does_not_signal_an_already_exited_process() {
        let h = harness();
        let record = h.orchestrator.launch(direct()).unwrap();
        h.spawner.exit(record.os_process_id);
        h.probe.remove(record.os_process_id);
        h.orchestrator.tick().await;

        let result = h.orchestrator.stop(record.id.as_str()).unwrap();
        assert!(result.success);
        assert!(h.spawner.terminated().is_empty());
    }

    #[test]
    fn record_lock_is_released_while_the_process_tree_is_killed() {
        let kill_time = Duration::from_millis(600);
        let h = harness_with(
            FakeSpawner::slow_to_terminate(kill_time),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |_| {},
        );
        h.orchestrator.launch(direct().id("alt6")).unwrap();

        std::thread::scope(|scope| {
            let stopping = scope.spawn(|| h.orchestrator.stop("alt6"));
            std::thread::sleep(Duration::from_millis(100));

            let started = std::time::Instant::now();
            assert!(h.orchestrator.get("alt6").unwrap_err().is_not_found());
            assert!(started.elapsed() < Duration::from_millis(300));

            assert!(stopping.join().unwrap().unwrap().success);
        });
        assert_eq!(h.spawner.terminated().len(), 1);
    }

    #[test]
    fn termination_failure_is_a_warning() {
        let h = harness_with(
            FakeSpawner::unkillable(),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |_| {},
        );
        h.orchestrator.launch(direct().id("alt3")).unwrap();

        let result = h.orchestrator.stop("alt3").unwrap();
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert!(h.orchestrator.list().unwrap().is_empty());
    }

    #[test]
    fn shutdown_twice_is_a_no_op_the_second_time() {
        let h = harness();
        h.orchestrator.launch(direct()).unwrap();
        h.orchestrator
            .launch(LaunchOptions::with_strategy(LaunchMethod::PackagedClone))
            .unwrap();
        let clone_root = h.orchestrator.settings().unwrap().get_clone_root();
        assert!(clone_root.is_dir());

        let first = h.orchestrator.shutdown();
        assert_eq!(first.stopped.len(), 2);
        assert!(first.failed.is_empty());
        assert_eq!(first.clone_root_removal, StepOutcome::Succeeded);
        assert!(!clone_root.exists());

        let second = h.orchestrator.shutdown();
        assert!(second.stopped.is_empty());
        assert!(second.failed.is_empty());
        assert_eq!(second.bypass_release, StepOutcome::Succeeded);
        assert_eq!(second.clone_root_removal, StepOutcome::Succeeded);
        assert!(h.orchestrator.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bounded_shutdown_returns_the_report() {
        let h = harness();
        h.orchestrator.launch(direct()).unwrap();

        let report = h
            .orchestrator
            .shutdown_within(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.stopped.len(), 1);
        assert!(h.orchestrator.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bounded_shutdown_gives_up_on_a_hung_teardown() {
        let h = harness_with(
            FakeSpawner::slow_to_terminate(Duration::from_secs(3)),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |_| {},
        );
        h.orchestrator.launch(direct()).unwrap();

        let started = std::time::Instant::now();
        let report = h
            .orchestrator
            .shutdown_within(Duration::from_millis(200))
            .await;
        assert!(report.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn shutdown_with_no_instances_is_safe() {
        let h = harness();
        let report = h.orchestrator.shutdown();
        assert!(report.stopped.is_empty());
        assert_eq!(report.clone_root_removal, StepOutcome::Succeeded);
    }

    #[test]
    fn settings_updates_merge_without_resetting() {
        let h = harness();
        let patch = |value| serde_json::from_value::<SettingsPatch>(value).unwrap();

        h.orchestrator
            .update_settings(patch(json!({ "fpsPolicy": { "maxFrameRate": 60 } })))
            .unwrap();
        let merged = h
            .orchestrator
            .update_settings(patch(json!({ "ramPolicy": { "autoReclaim": false } })))
            .unwrap();

        assert_eq!(merged.fps_policy.max_frame_rate, 60);
        assert!(!merged.resource_policy.auto_reclaim);
        let stats = h.orchestrator.stats().unwrap();
        assert_eq!(stats.policies, merged);
    }

    #[test]
    fn concurrent_launches_with_distinct_ids_both_succeed() {
        let h = harness_with(
            FakeSpawner::slow(Duration::from_millis(50)),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |_| {},
        );
        let orchestrator = &h.orchestrator;

        let (a, b) = std::thread::scope(|s| {
            let a = s.spawn(|| orchestrator.launch(direct().id("alt-a")));
            let b = s.spawn(|| orchestrator.launch(direct().id("alt-b")));
            (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
        });

        assert_ne!(a.os_process_id, b.os_process_id);
        let ids: Vec<_> = orchestrator
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"alt-a".to_string()));
        assert!(ids.contains(&"alt-b".to_string()));
    }

    #[test]
    fn concurrent_launches_with_the_same_id_admit_one() {
        let h = harness_with(
            FakeSpawner::slow(Duration::from_millis(50)),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |_| {},
        );
        let orchestrator = &h.orchestrator;

        let results = std::thread::scope(|s| {
            let a = s.spawn(|| orchestrator.launch(direct().id("same")));
            let b = s.spawn(|| orchestrator.launch(direct().id("same")));
            [a.join().unwrap(), b.join().unwrap()]
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(OrchestratorError::DuplicateId(_)))));
        assert_eq!(h.spawner.invocations().len(), 1);
        assert_eq!(orchestrator.list().unwrap().len(), 1);
    }

    #[test]
    fn failed_spawn_creates_no_record() {
        let h = harness_with(
            FakeSpawner::failing(),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |_| {},
        );
        let err = h.orchestrator.launch(direct().id("alt4")).unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn { .. }));
        assert!(h.orchestrator.list().unwrap().is_empty());

        // The id is free again
        assert!(matches!(
            h.orchestrator.launch(direct().id("alt4")),
            Err(OrchestratorError::Spawn { .. })
        ));
    }

    #[test]
    fn invalid_ids_are_rejected_before_spawning() {
        let h = harness();
        let err = h.orchestrator.launch(direct().id("a/../../b")).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidId(_)));
        assert!(h.spawner.invocations().is_empty());
    }

    #[test]
    fn direct_launch_through_orchestrator_embeds_place_id() {
        let h = harness();
        let record = h
            .orchestrator
            .launch(direct().target("https://www.roblox.com/games/123456/Obby"))
            .unwrap();

        assert_eq!(
            record.requested_target.unwrap().place_id.as_deref(),
            Some("123456")
        );
        let args = h.spawner.last_invocation().unwrap().args_lossy();
        assert!(args.iter().any(|a| a.contains("placeId=123456")));

        h.orchestrator.launch(direct()).unwrap();
        let args = h.spawner.last_invocation().unwrap().args_lossy();
        assert!(args.iter().all(|a| !a.contains("placeId")));
    }

    #[tokio::test]
    async fn over_budget_instances_are_reclaimed_when_enabled() {
        let h = harness_with(
            FakeSpawner::default(),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |s| s.resource_policy.max_memory_per_instance_mb = 256,
        );
        let record = h.orchestrator.launch(direct()).unwrap();

        h.orchestrator.tick().await;
        assert_eq!(h.probe.reclaimed(), vec![record.os_process_id]);

        h.orchestrator
            .update_settings(
                serde_json::from_value(json!({ "resourcePolicy": { "autoReclaim": false } }))
                    .unwrap(),
            )
            .unwrap();
        h.orchestrator.tick().await;
        assert_eq!(h.probe.reclaimed().len(), 1);

        let all = h.orchestrator.reclaim_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].outcome, StepOutcome::Succeeded);
        assert_eq!(h.probe.reclaimed().len(), 2);
    }

    #[tokio::test]
    async fn monitor_task_ticks_until_shutdown() {
        let h = harness_with(
            FakeSpawner::default(),
            FakeProbe::all_alive(),
            FakePackageManager::default(),
            |s| {
                s.fps_policy.poll_interval_ms = 100;
                s.resource_policy.poll_interval_ms = 100;
            },
        );
        let record = h.orchestrator.launch(direct()).unwrap();
        let monitor = h.orchestrator.spawn_monitor();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(
            h.orchestrator.get(record.id.as_str()).unwrap().status,
            InstanceStatus::Running
        );

        h.orchestrator.shutdown();
        tokio::time::timeout(Duration::from_secs(2), monitor)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn lifecycle_events_are_recorded() {
        let h = harness();
        h.orchestrator.launch(direct().id("alt5")).unwrap();
        h.orchestrator.tick().await;
        h.orchestrator.stop("alt5").unwrap();

        let kinds: Vec<_> = h
            .orchestrator
            .history("alt5")
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                events::REMOVED,
                events::STOPPED,
                events::RUNNING,
                events::LAUNCHED
            ]
        );
    }

    #[tokio::test]
    async fn demo_instances_run_without_touching_the_process_table() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::builder()
            .settings(Settings {
                data_directory: Some(tmp.path().to_path_buf()),
                ..Settings::default()
            })
            .installations(Installations::demo())
            .probe(Arc::new(FakeProbe::empty()))
            .without_singleton_bypass()
            .build()
            .unwrap();

        let record = orchestrator.launch(LaunchOptions::default()).unwrap();
        assert!(record.demo);
        let listed = orchestrator.refresh().await.unwrap();
        assert_eq!(listed[0].status, InstanceStatus::Running);

        let reclaim = orchestrator.reclaim(record.id.as_str()).unwrap();
        assert!(matches!(reclaim.outcome, StepOutcome::Warned(_)));
        assert!(orchestrator.health().demo);
        orchestrator.stop(record.id.as_str()).unwrap();
    }

    #[cfg(not(windows))]
    #[test]
    fn unowned_singleton_mutex_is_not_reported_held() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::builder()
            .settings(Settings {
                data_directory: Some(tmp.path().join("data")),
                ..Settings::default()
            })
            .installations(Installations {
                standard_path: Some(fake_standard_install(tmp.path())),
                packaged_path: None,
                demo: false,
            })
            .spawner(Arc::new(FakeSpawner::default()))
            .probe(Arc::new(FakeProbe::all_alive()))
            .package_manager(Arc::new(FakePackageManager::default()))
            .build()
            .unwrap();

        assert!(!orchestrator.health().bypass_held);
        orchestrator.shutdown();
        assert!(!orchestrator.health().bypass_held);
    }

    #[test]
    fn health_reports_located_paths() {
        let h = harness();
        let health = h.orchestrator.health();
        assert!(health.ready);
        assert!(!health.bypass_held);
        assert_eq!(health.standard_path, h.orchestrator.locate().standard_path);
        assert!(h.tmp.path().exists());
    }
}
