use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the bridge to its callers.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("worker script {name:?} not found (searched {searched:?})")]
    ScriptNotFound { name: String, searched: Vec<PathBuf> },

    #[error("failed to spawn worker {id:?}: {source}")]
    SpawnFailure {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0:?} is not running")]
    NotRunning(String),

    #[error("stdin of worker {0:?} is closed")]
    StdinClosed(String),

    #[error("no camera device detected")]
    NoDevice,

    #[error("stream session is already streaming")]
    AlreadyStreaming,

    #[error("stream session is not streaming")]
    NotStreaming,
}

/// Per-frame failures. These never end a worker's stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame buffer overflow: {buffered} bytes without an end marker (limit {limit})")]
    Overflow { buffered: usize, limit: usize },

    #[error("invalid base64 frame payload: {0}")]
    InvalidPayload(String),
}
