//! Launch strategies - Turns launch options into a spawned instance process

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::cloner::{self, PackageCloner};
use super::error::{OrchestratorError, Result, StepOutcome};
use super::instance::{InstanceId, LaunchMethod, LaunchStrategy, TargetResource};
use super::locator::Installations;
use super::process::{Invocation, ProcessHandle, Spawner};
use super::settings::FpsPolicy;

/// Flag that makes the player start as a standalone app
pub const APP_FLAG: &str = "--app";

/// Flag introducing the join script URL
pub const JOIN_FLAG: &str = "-j";

/// Environment variable carrying the instance id into the client
pub const INSTANCE_ID_ENV: &str = "ROBLOX_INSTANCE_ID";

/// Environment variable carrying the optional credential into the client
pub const CREDENTIAL_ENV: &str = "ROBLOX_AUTH_COOKIE";

/// Custom URI scheme registered by the client
pub const URI_SCHEME: &str = "roblox-player";

/// Client override file enabling the frame cap lift
pub const CLIENT_SETTINGS_FILE: &str = "ClientAppSettings.json";

const EXECUTABLE_ENV: &str = "MI_LAUNCH_EXECUTABLE";

#[cfg(windows)]
const ARGS_ENV: &str = "MI_LAUNCH_ARGS";

// The script text never changes; everything it launches arrives by environment.
#[cfg(windows)]
const LAUNCH_SCRIPT: &str = "$a = @(ConvertFrom-Json $env:MI_LAUNCH_ARGS); \
$p = Start-Process -FilePath $env:MI_LAUNCH_EXECUTABLE -ArgumentList $a -PassThru; \
Write-Output $p.Id";

#[cfg(not(windows))]
const LAUNCH_SCRIPT: &str =
    "\"$MI_LAUNCH_EXECUTABLE\" \"$@\" </dev/null >/dev/null 2>&1 & echo $!";

/// Caller-supplied launch request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchOptions {
    #[serde(alias = "instanceId")]
    pub id: Option<String>,
    #[serde(alias = "gameUrl")]
    pub target_url: Option<String>,
    #[serde(alias = "launchMethod")]
    pub strategy: LaunchMethod,
    #[serde(alias = "authCookie")]
    pub credential: Option<String>,
}

impl LaunchOptions {
    pub fn with_strategy(strategy: LaunchMethod) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn target(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Everything a successful launch produced
pub struct Launched {
    pub strategy: LaunchStrategy,
    pub handle: Box<dyn ProcessHandle>,
    pub target: Option<TargetResource>,
    pub clone_dir: Option<PathBuf>,
    /// Degraded steps that did not prevent the launch
    pub warnings: Vec<String>,
}

/// Pick the concrete strategy for `method` against the located installs
pub fn resolve_strategy(method: LaunchMethod, installs: &Installations) -> Result<LaunchStrategy> {
    let Some(strategy) = method.explicit() else {
        return if installs.standard_path.is_some() {
            Ok(LaunchStrategy::Direct)
        } else if installs.packaged_path.is_some() {
            Ok(LaunchStrategy::PackagedClone)
        } else {
            Err(OrchestratorError::NoLaunchMethod)
        };
    };

    match strategy {
        LaunchStrategy::Direct | LaunchStrategy::Scripted if installs.standard_path.is_none() => {
            Err(OrchestratorError::StandardInstallMissing(strategy))
        }
        LaunchStrategy::PackagedClone if installs.packaged_path.is_none() => {
            Err(OrchestratorError::PackagedInstallMissing)
        }
        _ => Ok(strategy),
    }
}

/// Join script URL for a place
pub fn place_launcher_url(place_id: &str) -> String {
    format!(
        "https://assetgame.roblox.com/game/PlaceLauncher.ashx?request=RequestGame&placeId={}&isPlayTogetherGame=false",
        place_id
    )
}

/// Arguments handed to the player executable
pub fn client_args(target: Option<&TargetResource>) -> Vec<String> {
    let mut args = vec![APP_FLAG.to_string()];
    if let Some(place_id) = target.and_then(|t| t.place_id.as_deref()) {
        args.push(JOIN_FLAG.to_string());
        args.push(place_launcher_url(place_id));
    }
    args
}

/// `roblox-player:` URI for an instance
pub fn player_uri(id: &InstanceId, target: Option<&TargetResource>, launch_time_ms: i64) -> String {
    let mut uri = format!("{}:1+launchmode:play", URI_SCHEME);
    if let Some(place_id) = target.and_then(|t| t.place_id.as_deref()) {
        uri.push_str("+placeId:");
        uri.push_str(place_id);
    }
    uri.push_str(&format!("+gameinfo:{}+launchtime:{}", id, launch_time_ms));
    uri
}

fn client_env(invocation: Invocation, id: &InstanceId, credential: Option<&str>) -> Invocation {
    let invocation = invocation.env(INSTANCE_ID_ENV, id.as_str());
    match credential {
        Some(credential) => invocation.env(CREDENTIAL_ENV, credential),
        None => invocation,
    }
}

/// Spawn the executable itself
pub fn direct_invocation(
    exe: &Path,
    id: &InstanceId,
    target: Option<&TargetResource>,
    credential: Option<&str>,
) -> Invocation {
    let mut invocation = Invocation::new(exe);
    if let Some(dir) = exe.parent() {
        invocation = invocation.current_dir(dir);
    }
    for arg in client_args(target) {
        invocation = invocation.arg(arg);
    }
    client_env(invocation, id, credential)
}

/// Start the executable through the script host, which reports the real pid
pub fn scripted_invocation(
    exe: &Path,
    id: &InstanceId,
    target: Option<&TargetResource>,
    credential: Option<&str>,
) -> Invocation {
    let args = client_args(target);

    #[cfg(windows)]
    let invocation = Invocation::new("powershell.exe")
        .arg("-NoProfile")
        .arg("-NonInteractive")
        .arg("-Command")
        .arg(LAUNCH_SCRIPT)
        .env(ARGS_ENV, serde_json::Value::from(args).to_string());

    #[cfg(not(windows))]
    let invocation = args.into_iter().fold(
        Invocation::new("sh")
            .arg("-c")
            .arg(LAUNCH_SCRIPT)
            .arg("multiinstance-launch"),
        |invocation, arg| invocation.arg(arg),
    );

    let invocation = invocation
        .env(EXECUTABLE_ENV, exe.to_string_lossy())
        .reporting_pid();
    client_env(invocation, id, credential)
}

/// Ask the OS shell to open `target`
pub fn shell_open_invocation(target: &str) -> Invocation {
    #[cfg(windows)]
    {
        Invocation::new("explorer.exe").arg(target)
    }
    #[cfg(not(windows))]
    {
        open::commands(target)
            .first()
            .map(Invocation::from_command)
            .unwrap_or_else(|| Invocation::new("xdg-open").arg(target))
    }
}

/// Write the client override lifting the frame cap next to the executable
pub fn write_frame_cap_override(version_dir: &Path, policy: &FpsPolicy) -> anyhow::Result<PathBuf> {
    let settings_dir = version_dir.join("ClientSettings");
    fs::create_dir_all(&settings_dir)
        .with_context(|| format!("Failed to create {}", settings_dir.display()))?;

    let path = settings_dir.join(CLIENT_SETTINGS_FILE);
    let body = serde_json::json!({ "DFIntTaskSchedulerTargetFps": policy.max_frame_rate });
    fs::write(&path, serde_json::to_string_pretty(&body)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Builds strategy-specific invocations and spawns them
pub struct Launcher {
    installations: Installations,
    cloner: Arc<PackageCloner>,
    spawner: Arc<dyn Spawner>,
}

impl Launcher {
    pub fn new(
        installations: Installations,
        cloner: Arc<PackageCloner>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            installations,
            cloner,
            spawner,
        }
    }

    pub fn installations(&self) -> &Installations {
        &self.installations
    }

    /// Launch one instance under `id`. No process means an error.
    pub fn launch(
        &self,
        id: &InstanceId,
        options: &LaunchOptions,
        fps_policy: &FpsPolicy,
    ) -> Result<Launched> {
        let strategy = resolve_strategy(options.strategy, &self.installations)?;
        let target = options.target_url.as_deref().map(TargetResource::parse);
        let credential = options.credential.as_deref();
        let mut warnings = Vec::new();

        info!("Launching instance {} via {}", id, strategy);

        let (invocation, clone_dir) = match strategy {
            LaunchStrategy::Direct | LaunchStrategy::Scripted => {
                let exe = self
                    .installations
                    .standard_path
                    .as_deref()
                    .ok_or(OrchestratorError::StandardInstallMissing(strategy))?;
                if let StepOutcome::Warned(w) = self.unlock_frame_cap(fps_policy) {
                    warnings.push(w);
                }
                let invocation = if strategy == LaunchStrategy::Direct {
                    direct_invocation(exe, id, target.as_ref(), credential)
                } else {
                    scripted_invocation(exe, id, target.as_ref(), credential)
                };
                (invocation, None)
            }
            LaunchStrategy::UriScheme => {
                let uri = player_uri(id, target.as_ref(), chrono::Utc::now().timestamp_millis());
                debug!("Opening {}", uri);
                (shell_open_invocation(&uri), None)
            }
            LaunchStrategy::PackagedClone => {
                let source = self
                    .installations
                    .packaged_path
                    .as_deref()
                    .ok_or(OrchestratorError::PackagedInstallMissing)?;
                let clone_dir = self.cloner.clone_package(source, id).map_err(|e| {
                    OrchestratorError::Clone {
                        id: id.to_string(),
                        reason: format!("{:#}", e),
                    }
                })?;
                if let StepOutcome::Warned(w) = self.cloner.register_clone(&clone_dir) {
                    warnings.push(format!("Package registration failed: {}", w));
                }
                (shell_open_invocation(&cloner::launch_alias(id)), Some(clone_dir))
            }
        };

        let handle = match self.spawner.spawn(&invocation) {
            Ok(handle) => handle,
            Err(source) => {
                warn!("Failed to spawn instance {}: {}", id, source);
                if clone_dir.is_some() {
                    for detail in self.cloner.unregister_clone(id).details() {
                        warn!("Cleanup after failed launch of {}: {}", id, detail);
                    }
                }
                return Err(OrchestratorError::Spawn { strategy, source });
            }
        };

        Ok(Launched {
            strategy,
            handle,
            target,
            clone_dir,
            warnings,
        })
    }

    fn unlock_frame_cap(&self, policy: &FpsPolicy) -> StepOutcome {
        if !policy.unlock_frame_cap || self.installations.demo {
            return StepOutcome::Succeeded;
        }
        let Some(version_dir) = self.installations.standard_version_dir() else {
            return StepOutcome::Succeeded;
        };
        match write_frame_cap_override(version_dir, policy) {
            Ok(path) => {
                debug!(
                    "Frame cap set to {} in {}",
                    policy.max_frame_rate,
                    path.display()
                );
                StepOutcome::Succeeded
            }
            Err(e) => {
                warn!("Could not unlock frame cap: {:#}", e);
                StepOutcome::Warned(format!("Frame cap override failed: {:#}", e))
            }
        }
    }
}
