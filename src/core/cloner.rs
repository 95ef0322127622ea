//! Package cloning - Copies the packaged install under a per-instance identity

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::error::StepOutcome;
use super::instance::InstanceId;
use super::locator::PACKAGE_PREFIX;
use crate::platform;

/// Manifest holding the package identity
pub const MANIFEST_FILE: &str = "AppxManifest.xml";

/// Integrity artifacts that reject a rewritten manifest
pub const SIGNATURE_ARTIFACTS: [&str; 3] = ["AppxSignature.p7x", "AppxBlockMap.xml", "AppxMetadata"];

/// Publisher hash suffix of the package family name
pub const PUBLISHER_ID: &str = "cw5n1h2txyewy";

/// Application id inside the package
pub const APPLICATION_ID: &str = "ROBLOX";

/// Instance-qualified package name, e.g. `ROBLOXCORPORATION.ROBLOX.instance-1`
pub fn package_name(id: &InstanceId) -> String {
    format!("{}.{}", PACKAGE_PREFIX, id)
}

/// Shell target that launches the clone's application entry
pub fn launch_alias(id: &InstanceId) -> String {
    format!(
        r"shell:appsFolder\{}_{}!{}",
        package_name(id),
        PUBLISHER_ID,
        APPLICATION_ID
    )
}

/// OS package manager seam
pub trait PackageManager: Send + Sync {
    /// Register an unpacked package from its manifest
    fn register(&self, manifest: &Path) -> Result<()>;
    /// Remove a registered package by name
    fn unregister(&self, package_name: &str) -> Result<()>;
}

/// PowerShell-backed package manager
#[derive(Debug, Default)]
pub struct SystemPackageManager;

const REGISTER_SCRIPT: &str = "Add-AppxPackage -Path $env:MI_MANIFEST_PATH -Register";
const UNREGISTER_SCRIPT: &str = "Get-AppxPackage -Name $env:MI_PACKAGE_NAME | Remove-AppxPackage";

impl PackageManager for SystemPackageManager {
    fn register(&self, manifest: &Path) -> Result<()> {
        let manifest = manifest.to_string_lossy();
        platform::run_script_host(REGISTER_SCRIPT, &[("MI_MANIFEST_PATH", manifest.as_ref())])
    }

    fn unregister(&self, package_name: &str) -> Result<()> {
        platform::run_script_host(UNREGISTER_SCRIPT, &[("MI_PACKAGE_NAME", package_name)])
    }
}

/// Outcome of tearing down one clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisterReport {
    pub package: StepOutcome,
    pub directory: StepOutcome,
}

impl UnregisterReport {
    /// Messages for every step that did not fully succeed
    pub fn details(&self) -> Vec<String> {
        let package = self
            .package
            .detail()
            .map(|d| format!("Package unregistration: {}", d));
        let directory = self
            .directory
            .detail()
            .map(|d| format!("Clone removal: {}", d));
        package.into_iter().chain(directory).collect()
    }
}

/// Produces and removes per-instance package clones under one root
pub struct PackageCloner {
    clone_root: PathBuf,
    package_manager: Arc<dyn PackageManager>,
}

impl PackageCloner {
    pub fn new(clone_root: PathBuf, package_manager: Arc<dyn PackageManager>) -> Self {
        Self {
            clone_root,
            package_manager,
        }
    }

    pub fn clone_root(&self) -> &Path {
        &self.clone_root
    }

    pub fn clone_dir(&self, id: &InstanceId) -> PathBuf {
        self.clone_root.join(id.as_str())
    }

    /// Copy `source` into a fresh per-instance directory and rewrite its identity
    pub fn clone_package(&self, source: &Path, id: &InstanceId) -> Result<PathBuf> {
        let clone_dir = self.clone_dir(id);
        info!(
            "Cloning package {} into {}",
            source.display(),
            clone_dir.display()
        );

        if !source.is_dir() {
            anyhow::bail!("Package directory not found: {}", source.display());
        }
        if clone_dir.exists() {
            debug!("Removing stale clone at {}", clone_dir.display());
            fs::remove_dir_all(&clone_dir)
                .with_context(|| format!("Failed to remove stale clone {}", clone_dir.display()))?;
        }

        let result = copy_dir(source, &clone_dir)
            .with_context(|| format!("Failed to copy {}", source.display()))
            .and_then(|()| rewrite_manifest(&clone_dir, id))
            .and_then(|()| strip_signature(&clone_dir));

        if let Err(e) = result {
            let _ = remove_dir_if_present(&clone_dir);
            return Err(e);
        }
        Ok(clone_dir)
    }

    /// Register the cloned manifest; a failure leaves the clone usable by other means
    pub fn register_clone(&self, clone_dir: &Path) -> StepOutcome {
        let manifest = clone_dir.join(MANIFEST_FILE);
        match self.package_manager.register(&manifest) {
            Ok(()) => {
                info!("Package clone registered: {}", manifest.display());
                StepOutcome::Succeeded
            }
            Err(e) => {
                warn!("Package clone registration failed: {:#}", e);
                StepOutcome::Warned(format!("{:#}", e))
            }
        }
    }

    /// Remove the clone's registration, then its directory. Both steps always run.
    pub fn unregister_clone(&self, id: &InstanceId) -> UnregisterReport {
        let name = package_name(id);
        let package = match self.package_manager.unregister(&name) {
            Ok(()) => {
                info!("Package clone {} unregistered", name);
                StepOutcome::Succeeded
            }
            Err(e) => {
                warn!("Package clone unregistration failed for {}: {:#}", name, e);
                StepOutcome::Warned(format!("{:#}", e))
            }
        };

        let clone_dir = self.clone_dir(id);
        let directory = match remove_dir_if_present(&clone_dir) {
            Ok(()) => StepOutcome::Succeeded,
            Err(e) => {
                warn!("Failed to remove clone {}: {}", clone_dir.display(), e);
                StepOutcome::Failed(e.to_string())
            }
        };

        UnregisterReport { package, directory }
    }

    /// Delete the whole clone root
    pub fn remove_clone_root(&self) -> StepOutcome {
        StepOutcome::fail_on_err(remove_dir_if_present(&self.clone_root))
    }
}

fn copy_dir(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir_all(destination)?;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = destination.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir(&src_path, &dest_path)?;
        } else {
            fs::copy(&src_path, &dest_path)?;
        }
    }
    Ok(())
}

fn rewrite_manifest(clone_dir: &Path, id: &InstanceId) -> Result<()> {
    let manifest_path = clone_dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        warn!("Clone has no {}; identity left unchanged", MANIFEST_FILE);
        return Ok(());
    }

    let manifest = fs::read_to_string(&manifest_path)
        .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
    let original = format!("Name=\"{}\"", PACKAGE_PREFIX);
    let rewritten = manifest.replace(&original, &format!("Name=\"{}\"", package_name(id)));
    fs::write(&manifest_path, rewritten)
        .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
    Ok(())
}

fn strip_signature(clone_dir: &Path) -> Result<()> {
    for artifact in SIGNATURE_ARTIFACTS {
        let path = clone_dir.join(artifact);
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else if path.exists() {
            fs::remove_file(&path)
        } else {
            continue;
        };
        result.with_context(|| format!("Failed to remove {}", path.display()))?;
        debug!("Removed {}", path.display());
    }
    Ok(())
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
