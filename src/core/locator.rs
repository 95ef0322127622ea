//! Installation discovery - Finds the standard and packaged Roblox installs

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{OrchestratorError, Result};

/// Executable shipped by both install types
pub const PLAYER_EXECUTABLE: &str = "RobloxPlayerBeta.exe";

/// Directory-name prefix of the packaged install
pub const PACKAGE_PREFIX: &str = "ROBLOXCORPORATION.ROBLOX";

/// Sentinel standard path used when no real installation exists
pub const DEMO_INSTALL_PATH: &str = "/demo/roblox";

/// Located installations, set once at startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Installations {
    /// Path to the standard install's executable
    pub standard_path: Option<PathBuf>,
    /// Path to the packaged install's package directory
    pub packaged_path: Option<PathBuf>,
    /// True when `standard_path` is the demo sentinel
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub demo: bool,
}

impl Installations {
    pub fn demo() -> Self {
        Self {
            standard_path: Some(PathBuf::from(DEMO_INSTALL_PATH)),
            packaged_path: None,
            demo: true,
        }
    }

    /// Version directory holding the standard executable
    pub fn standard_version_dir(&self) -> Option<&Path> {
        self.standard_path.as_deref().and_then(Path::parent)
    }

    pub fn is_ready(&self) -> bool {
        self.standard_path.is_some() || self.packaged_path.is_some()
    }
}

/// Probes well-known roots for installations
#[derive(Debug, Clone)]
pub struct Locator {
    /// `Versions` directories of the standard install, in probe order
    pub standard_roots: Vec<PathBuf>,
    /// Directories that may contain the packaged install
    pub packaged_roots: Vec<PathBuf>,
    /// Fall back to a demo installation instead of failing
    pub demo_fallback: bool,
}

impl Default for Locator {
    fn default() -> Self {
        Self::system()
    }
}

impl Locator {
    /// Roots used on a real host
    pub fn system() -> Self {
        let program_files_x86 = std::env::var_os("ProgramFiles(x86)")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Program Files (x86)"));
        let program_files = std::env::var_os("ProgramFiles")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
        let local_app_data = dirs::data_local_dir();

        let mut standard_roots = vec![
            program_files_x86.join("Roblox").join("Versions"),
            program_files.join("Roblox").join("Versions"),
        ];
        let mut packaged_roots = vec![program_files.join("WindowsApps")];
        if let Some(local) = local_app_data {
            standard_roots.push(local.join("Roblox").join("Versions"));
            packaged_roots.push(local.join("Packages"));
        }

        Self {
            standard_roots,
            packaged_roots,
            demo_fallback: !cfg!(windows),
        }
    }

    /// Locate installations; fails only when neither kind is found
    pub fn locate(&self) -> Result<Installations> {
        info!("Detecting Roblox installations...");

        let standard_path = self.standard_roots.iter().find_map(|r| probe_standard(r));
        if let Some(ref path) = standard_path {
            info!("Found standard install: {}", path.display());
        }

        let packaged_path = self.packaged_roots.iter().find_map(|r| probe_packaged(r));
        if let Some(ref path) = packaged_path {
            info!("Found packaged install: {}", path.display());
        }

        let installations = Installations {
            standard_path,
            packaged_path,
            demo: false,
        };
        if installations.is_ready() {
            return Ok(installations);
        }

        if self.demo_fallback {
            warn!(
                "No installation found on this host; using demo installation at {}",
                DEMO_INSTALL_PATH
            );
            Ok(Installations::demo())
        } else {
            Err(OrchestratorError::NoInstallation)
        }
    }
}

/// Pick the highest version directory under `root` holding the executable
fn probe_standard(root: &Path) -> Option<PathBuf> {
    let mut versions: Vec<PathBuf> = match std::fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(e) => {
            debug!("Skipping {}: {}", root.display(), e);
            return None;
        }
    };
    versions.sort();

    let latest = versions.pop()?;
    let exe = latest.join(PLAYER_EXECUTABLE);
    if exe.is_file() {
        Some(exe)
    } else {
        debug!("Latest version {} has no player executable", latest.display());
        None
    }
}

/// First package directory under `root` matching the package prefix
fn probe_packaged(root: &Path) -> Option<PathBuf> {
    let mut packages: Vec<PathBuf> = match std::fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(PACKAGE_PREFIX))
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(e) => {
            debug!("Skipping {}: {}", root.display(), e);
            return None;
        }
    };
    packages.sort();

    packages
        .into_iter()
        .find(|p| p.join(PLAYER_EXECUTABLE).is_file())
}
