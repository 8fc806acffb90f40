//! Helpers for tests that drive real worker processes through `sh`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use axis_bridge_types::WorkerEvent;

use super::broadcast::Subscription;
use super::demux::OutputProtocol;
use super::process_registry::WorkerSpec;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fresh, empty directory under the system temp dir.
pub(crate) fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("axis-bridge-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// [`WorkerSpec`] that runs `script` with `sh`.
pub(crate) fn sh_spec(script: &str, protocol: OutputProtocol) -> WorkerSpec {
    WorkerSpec::new(script, protocol).interpreter(Some("sh".to_string()))
}

/// Next event, failing the test instead of hanging.
pub(crate) async fn next_event(sub: &mut Subscription) -> Option<WorkerEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, sub.recv())
        .await
        .expect("timed out waiting for a worker event")
}
