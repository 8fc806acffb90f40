//! Bridge configuration, loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axis_bridge_types::StreamSettings;
use log::{info, warn, LevelFilter};
use serde::{Deserialize, Serialize};

use crate::bridge::broadcast::DEFAULT_CHANNEL_CAPACITY;
use crate::bridge::frame_assembler::DEFAULT_MAX_FRAME_BYTES;
use crate::bridge::process_registry::{default_interpreter, ProcessRegistry, SharedRegistry};
use crate::bridge::script_locator::{ScriptLocator, SCRIPTS_DIR_ENV};
use crate::bridge::stream_session::{SessionOptions, WorkerKind, DEFAULT_FRAME_QUEUE_CAPACITY};

/// Overrides `interpreter`. An empty value runs scripts directly.
pub const PYTHON_ENV: &str = "AXIS_PYTHON";

pub const DEFAULT_CONFIG_FILE: &str = "axis_bridge.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Searched before the platform script locations.
    pub scripts_dir: Option<PathBuf>,
    /// `null` runs scripts as executables.
    pub interpreter: Option<String>,
    pub worker: WorkerKind,
    pub stream: StreamSettings,
    pub max_frame_bytes: usize,
    /// `null` disables the per-probe timeout.
    pub probe_timeout_ms: Option<u64>,
    pub frame_queue_capacity: usize,
    pub graceful_shutdown_ms: u64,
    pub channel_capacity: usize,
    pub log_dir: String,
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scripts_dir: None,
            interpreter: default_interpreter(),
            worker: WorkerKind::default(),
            stream: StreamSettings::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            probe_timeout_ms: Some(10_000),
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            graceful_shutdown_ms: 2_000,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            log_dir: "logs".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(SCRIPTS_DIR_ENV).filter(|d| !d.is_empty()) {
            self.scripts_dir = Some(PathBuf::from(dir));
        }
        if let Some(python) = lookup(PYTHON_ENV) {
            self.interpreter = if python.is_empty() { None } else { Some(python) };
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Configured directory first, then the platform defaults.
    pub fn locator(&self) -> ScriptLocator {
        let mut dirs = Vec::new();
        if let Some(dir) = &self.scripts_dir {
            dirs.push(dir.clone());
        }
        for dir in ScriptLocator::platform_default().search_dirs() {
            if !dirs.contains(dir) {
                dirs.push(dir.clone());
            }
        }
        ScriptLocator::new(dirs)
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::new(ProcessRegistry::with_channel_capacity(
            self.locator(),
            self.channel_capacity,
        ))
    }

    pub fn probe_timeout(&self) -> Option<Duration> {
        self.probe_timeout_ms.map(Duration::from_millis)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            kind: self.worker,
            stream: self.stream,
            interpreter: self.interpreter.clone(),
            max_frame_bytes: self.max_frame_bytes,
            probe_timeout: self.probe_timeout(),
            frame_queue_capacity: self.frame_queue_capacity,
            graceful_shutdown: Duration::from_millis(self.graceful_shutdown_ms),
        }
    }

    /// Unknown level names fall back to `Info`.
    pub fn log_level(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }
}

/// Load the config at `path`, falling back to defaults when it is missing or
/// invalid, then apply environment overrides.
pub fn load_config(path: &Path) -> BridgeConfig {
    let mut config = match std::fs::read_to_string(path) {
        Ok(content) => match BridgeConfig::from_json(&content) {
            Ok(config) => {
                info!("[CONFIG] Loaded {}", path.display());
                config
            }
            Err(e) => {
                warn!("[CONFIG] Invalid {}: {e}, using defaults", path.display());
                BridgeConfig::default()
            }
        },
        Err(_) => BridgeConfig::default(),
    };
    config.apply_env_overrides();
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = BridgeConfig::from_json(
            r#"{"stream": {"width": 1280, "height": 720, "fps": 15}, "worker": "camera_controller"}"#,
        )
        .unwrap();
        assert_eq!(config.stream.width, 1280);
        assert_eq!(config.worker, WorkerKind::CameraController);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(config.interpreter, default_interpreter());
        assert_eq!(config.probe_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_nulls() {
        let config =
            BridgeConfig::from_json(r#"{"interpreter": null, "probe_timeout_ms": null}"#).unwrap();
        assert_eq!(config.interpreter, None);
        assert_eq!(config.probe_timeout(), None);
        assert_eq!(config.session_options().interpreter, None);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([(SCRIPTS_DIR_ENV, "/opt/axis/scripts"), (PYTHON_ENV, "")]);
        let mut config = BridgeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.scripts_dir, Some(PathBuf::from("/opt/axis/scripts")));
        assert_eq!(config.interpreter, None);
        assert_eq!(
            config.locator().search_dirs().first(),
            Some(&PathBuf::from("/opt/axis/scripts"))
        );
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let path = std::env::temp_dir().join(format!("axis-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "{ not json").unwrap();
        let config = load_config(&path);
        assert_eq!(config.stream, StreamSettings::default());
        assert_eq!(config.frame_queue_capacity, DEFAULT_FRAME_QUEUE_CAPACITY);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_log_level() {
        let mut config = BridgeConfig::default();
        assert_eq!(config.log_level(), LevelFilter::Info);
        config.log_level = "debug".to_string();
        assert_eq!(config.log_level(), LevelFilter::Debug);
        config.log_level = "loud".to_string();
        assert_eq!(config.log_level(), LevelFilter::Info);
    }
}
