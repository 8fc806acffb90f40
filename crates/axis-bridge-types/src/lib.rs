//! Types shared between the bridge and its consumers.
//!
//! Workers speak a line/marker protocol over stdout and accept newline
//! terminated commands on stdin. Everything a consumer sees is expressed
//! through [`WorkerEvent`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Raw frame bytes, shared between subscribers without copying.
pub type FrameData = Arc<[u8]>;

/// Camera hardware classes, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Raspberry Pi 5 camera driven through libcamera.
    RaspberryPi5,
    /// Legacy Raspberry Pi camera module (raspivid / v4l2).
    RaspberryPi,
    /// Generic USB webcam or other V4L2 device.
    Webcam,
}

impl DeviceClass {
    /// Order in which detection probes run.
    pub const PROBE_ORDER: [DeviceClass; 3] = [
        DeviceClass::RaspberryPi5,
        DeviceClass::RaspberryPi,
        DeviceClass::Webcam,
    ];

    /// Tag passed to worker scripts as `--type <tag>`.
    pub fn tag(self) -> &'static str {
        match self {
            DeviceClass::RaspberryPi5 => "raspberry5",
            DeviceClass::RaspberryPi => "raspberry",
            DeviceClass::Webcam => "webcam",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::PROBE_ORDER.into_iter().find(|c| c.tag() == tag)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A successful detection probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub device_class: DeviceClass,
    pub device_path: String,
}

/// Final state of a detection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DetectionOutcome {
    Found(DetectionResult),
    NotFound,
}

impl DetectionOutcome {
    pub fn found(&self) -> Option<&DetectionResult> {
        match self {
            DetectionOutcome::Found(result) => Some(result),
            DetectionOutcome::NotFound => None,
        }
    }
}

/// Answer to the `STATUS` command of the camera-controller worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub recording: bool,
    #[serde(default)]
    pub video_path: Option<String>,
    #[serde(default)]
    pub processed_path: Option<String>,
}

/// Status line payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StatusPayload {
    /// Free-text `STATUS:` payload.
    Message(String),
    /// JSON status object.
    Report(WorkerReport),
    RecordingSaved(String),
    ProcessedFile(String),
    /// Detection sentinel (`CAMERA_FOUND:<path>`).
    DeviceFound(String),
    /// Text line without any known prefix.
    Untagged(String),
    /// Looked like a JSON report but did not match the schema.
    Unparseable(String),
}

impl StatusPayload {
    /// Parse the remainder of a `STATUS:` line.
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim();

        if let Some(path) = payload.strip_prefix("RECORDING_SAVED:") {
            return StatusPayload::RecordingSaved(path.trim().to_string());
        }
        if let Some(path) = payload.strip_prefix("PROCESSED_FILE:") {
            return StatusPayload::ProcessedFile(path.trim().to_string());
        }
        if payload.starts_with('{') {
            return match serde_json::from_str::<WorkerReport>(payload) {
                Ok(report) => StatusPayload::Report(report),
                Err(_) => StatusPayload::Unparseable(payload.to_string()),
            };
        }

        StatusPayload::Message(payload.to_string())
    }
}

/// Everything a worker can tell its consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkerEvent {
    Status(StatusPayload),
    Frame(FrameData),
    ErrorLine(String),
    /// Exit code; `None` when the process was ended by a signal.
    Exited(Option<i32>),
}

impl WorkerEvent {
    pub fn is_frame(&self) -> bool {
        matches!(self, WorkerEvent::Frame(_))
    }

    /// Device path carried by a detection sentinel, if this is one.
    pub fn device_found(&self) -> Option<&str> {
        match self {
            WorkerEvent::Status(StatusPayload::DeviceFound(path)) => Some(path),
            _ => None,
        }
    }
}

/// Commands a worker accepts on stdin, one per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    /// Ask the worker to shut down.
    Exit,
    StartRecording { name: Option<String> },
    StopRecording,
    /// Ask for a `STATUS:{json}` report.
    Status,
}

impl WorkerCommand {
    /// Wire form, without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            WorkerCommand::Exit => "EXIT".to_string(),
            WorkerCommand::StartRecording { name: Some(name) } => {
                format!("START_RECORDING:{name}")
            }
            WorkerCommand::StartRecording { name: None } => "START_RECORDING".to_string(),
            WorkerCommand::StopRecording => "STOP_RECORDING".to_string(),
            WorkerCommand::Status => "STATUS".to_string(),
        }
    }
}

/// Capture parameters handed to the streaming worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}
