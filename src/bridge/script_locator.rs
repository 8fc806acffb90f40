//! Finds worker scripts on disk.

use std::env;
use std::path::{Path, PathBuf};

use log::debug;

use super::error::BridgeError;

/// Overrides every other search location when set.
pub const SCRIPTS_DIR_ENV: &str = "AXIS_SCRIPTS_DIR";

const SCRIPTS_SUBDIR: &str = "python_scripts";

/// Ordered list of directories searched for worker scripts.
#[derive(Debug, Clone, Default)]
pub struct ScriptLocator {
    search_dirs: Vec<PathBuf>,
}

impl ScriptLocator {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(vec![dir.into()])
    }

    /// `$AXIS_SCRIPTS_DIR`, then next to the executable, then the working
    /// directory, then the platform install location.
    pub fn platform_default() -> Self {
        let mut dirs = Vec::new();

        if let Some(dir) = env::var_os(SCRIPTS_DIR_ENV) {
            dirs.push(PathBuf::from(dir));
        }

        if let Some(exe_dir) = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            dirs.push(exe_dir.join(SCRIPTS_SUBDIR));
            #[cfg(target_os = "macos")]
            dirs.push(exe_dir.join("../Resources").join(SCRIPTS_SUBDIR));
        }

        if let Ok(cwd) = env::current_dir() {
            dirs.push(cwd.join(SCRIPTS_SUBDIR));
        }

        #[cfg(target_os = "linux")]
        dirs.push(PathBuf::from("/usr/share/axis").join(SCRIPTS_SUBDIR));

        Self { search_dirs: dirs }
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Path of the first existing file called `name`.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, BridgeError> {
        for dir in &self.search_dirs {
            let candidate = dir.join(name);
            if candidate.is_file() {
                debug!("[LOCATOR] {name} -> {}", candidate.display());
                return Ok(candidate);
            }
        }

        Err(BridgeError::ScriptNotFound {
            name: name.to_string(),
            searched: self.search_dirs.clone(),
        })
    }
}
