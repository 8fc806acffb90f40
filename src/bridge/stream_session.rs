//! Client handle for one camera stream.
//!
//! Detects the camera on first use, starts the streaming worker and hands
//! the caller a frame-only view of its events. Status and error events are
//! logged; callers that want them use [`StreamSession::subscribe_events`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axis_bridge_types::{
    DetectionOutcome, DetectionResult, FrameData, StatusPayload, StreamSettings, WorkerCommand,
    WorkerEvent,
};
use futures_util::Stream;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

use super::broadcast::Subscription;
use super::demux::OutputProtocol;
use super::detection::{DetectionStateMachine, Probe, DEFAULT_PROBE_TIMEOUT};
use super::error::BridgeError;
use super::frame_assembler::DEFAULT_MAX_FRAME_BYTES;
use super::process_registry::{
    default_interpreter, SharedRegistry, ShutdownPolicy, WorkerSpec, WorkerStream,
};

/// Line-tagged streaming worker.
pub const STREAM_CAMERA_SCRIPT: &str = "stream_camera.py";
/// Raw-binary worker that also records on command.
pub const CAMERA_CONTROLLER_SCRIPT: &str = "camera_controller.py";

/// Frames held for a slow consumer before new ones are dropped.
pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 2;

/// Which streaming worker a session drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    #[default]
    StreamCamera,
    CameraController,
}

impl WorkerKind {
    /// Registry id of the worker.
    pub fn worker_id(self) -> &'static str {
        match self {
            WorkerKind::StreamCamera => "stream_camera",
            WorkerKind::CameraController => "camera_controller",
        }
    }

    /// The stream worker is told which device to open; the controller
    /// picks its own.
    pub fn needs_device(self) -> bool {
        matches!(self, WorkerKind::StreamCamera)
    }

    pub fn spec(self, options: &SessionOptions, device: Option<&DetectionResult>) -> WorkerSpec {
        let spec = match self {
            WorkerKind::StreamCamera => {
                let mut spec = WorkerSpec::new(STREAM_CAMERA_SCRIPT, OutputProtocol::LineTagged);
                if let Some(device) = device {
                    spec = spec
                        .args(["--camera_path", device.device_path.as_str()])
                        .args(["--type", device.device_class.tag()]);
                }
                spec.args([
                    "--width".to_string(),
                    options.stream.width.to_string(),
                    "--height".to_string(),
                    options.stream.height.to_string(),
                    "--fps".to_string(),
                    options.stream.fps.to_string(),
                ])
            }
            WorkerKind::CameraController => {
                WorkerSpec::new(CAMERA_CONTROLLER_SCRIPT, OutputProtocol::RawBinary)
                    .args(["--mode", "stream"])
                    .shutdown(ShutdownPolicy::Graceful {
                        command: WorkerCommand::Exit,
                        grace: options.graceful_shutdown,
                    })
            }
        };
        spec.interpreter(options.interpreter.clone())
            .max_frame_bytes(options.max_frame_bytes)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub kind: WorkerKind,
    pub stream: StreamSettings,
    pub interpreter: Option<String>,
    pub max_frame_bytes: usize,
    pub probe_timeout: Option<Duration>,
    pub frame_queue_capacity: usize,
    /// Grace period after `EXIT` for workers with a graceful shutdown.
    pub graceful_shutdown: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            kind: WorkerKind::default(),
            stream: StreamSettings::default(),
            interpreter: default_interpreter(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            probe_timeout: Some(DEFAULT_PROBE_TIMEOUT),
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            graceful_shutdown: Duration::from_secs(2),
        }
    }
}

/// Frame-only view of a running stream.
#[derive(Debug)]
pub struct FrameStream {
    rx: mpsc::Receiver<FrameData>,
}

impl FrameStream {
    /// Next frame, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<FrameData> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = FrameData> {
        let mut frames = self;
        async_stream::stream! {
            while let Some(frame) = frames.next().await {
                yield frame;
            }
        }
    }
}

struct ActiveStream {
    worker_id: &'static str,
    worker: WorkerStream,
    /// Spawned by this session. A worker the session only attached to is
    /// left running on stop.
    owned: bool,
    forwarder: JoinHandle<()>,
}

impl ActiveStream {
    /// False once the worker has exited, whoever stopped it.
    fn is_live(&self) -> bool {
        !self.worker.is_closed()
    }
}

/// Shared reference to a session.
pub type SharedStreamSession = Arc<StreamSession>;

pub struct StreamSession {
    id: String,
    registry: SharedRegistry,
    options: SessionOptions,
    /// Overrides the standard detection probes.
    probes: Option<Vec<Probe>>,
    device: TokioMutex<Option<DetectionResult>>,
    active: TokioMutex<Option<ActiveStream>>,
    dropped_frames: Arc<AtomicU64>,
}

impl StreamSession {
    pub fn new(registry: SharedRegistry, options: SessionOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            registry,
            options,
            probes: None,
            device: TokioMutex::new(None),
            active: TokioMutex::new(None),
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Skip detection and use `device`.
    pub fn with_device(mut self, device: DetectionResult) -> Self {
        self.device = TokioMutex::new(Some(device));
        self
    }

    pub fn with_probes(mut self, probes: Vec<Probe>) -> Self {
        self.probes = Some(probes);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Frames lost because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub async fn is_streaming(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(ActiveStream::is_live)
    }

    /// Cached detection result, running detection once if there is none.
    pub async fn detect(&self) -> Result<DetectionResult, BridgeError> {
        let mut device = self.device.lock().await;
        if let Some(found) = device.as_ref() {
            return Ok(found.clone());
        }

        let machine = match &self.probes {
            Some(probes) => DetectionStateMachine::new(self.registry.clone(), probes.clone()),
            None => {
                DetectionStateMachine::standard(self.registry.clone(), self.options.interpreter.clone())
            }
        };
        match machine.with_probe_timeout(self.options.probe_timeout).run().await {
            DetectionOutcome::Found(found) => {
                *device = Some(found.clone());
                Ok(found)
            }
            DetectionOutcome::NotFound => Err(BridgeError::NoDevice),
        }
    }

    /// Drop the cached detection result so the next start probes again.
    pub async fn forget_device(&self) {
        *self.device.lock().await = None;
    }

    /// Start streaming and return the frame view.
    ///
    /// A previous stream whose worker has since exited is replaced.
    pub async fn start(&self) -> Result<FrameStream, BridgeError> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(ActiveStream::is_live) {
            return Err(BridgeError::AlreadyStreaming);
        }
        if let Some(ended) = active.take() {
            info!(
                "[SESSION] {}: {} exited on its own, starting again",
                self.id, ended.worker_id
            );
            ended.forwarder.abort();
        }

        let kind = self.options.kind;
        let device = if kind.needs_device() {
            Some(self.detect().await?)
        } else {
            None
        };

        let worker_id = kind.worker_id();
        let outcome = self
            .registry
            .start(worker_id, &kind.spec(&self.options, device.as_ref()));
        let owned = if outcome.is_already_running() {
            info!("[SESSION] {}: attaching to running {worker_id}", self.id);
            false
        } else if outcome.is_failed() {
            warn!("[SESSION] {}: {worker_id} failed to start", self.id);
            false
        } else {
            info!("[SESSION] {}: started {worker_id}", self.id);
            true
        };

        let (worker, subscription) = outcome.into_parts();
        let (frame_tx, frame_rx) = mpsc::channel(self.options.frame_queue_capacity.max(1));
        let forwarder = tokio::spawn(forward_frames(
            self.id.clone(),
            subscription,
            frame_tx,
            self.dropped_frames.clone(),
        ));

        *active = Some(ActiveStream {
            worker_id,
            worker,
            owned,
            forwarder,
        });
        Ok(FrameStream { rx: frame_rx })
    }

    /// Stop the worker and the session's subscription. Returns `false` when
    /// there was nothing to stop.
    ///
    /// Only a worker this session spawned is stopped; one it attached to
    /// keeps running for whoever started it.
    pub async fn stop(&self) -> bool {
        let Some(active) = self.active.lock().await.take() else {
            debug!("[SESSION] {}: stop requested, not streaming", self.id);
            return false;
        };

        if !active.owned {
            info!(
                "[SESSION] {}: detaching from {}, left running",
                self.id, active.worker_id
            );
        } else if active.is_live() {
            self.registry.stop(active.worker_id).await;
        }
        active.forwarder.abort();
        let _ = active.forwarder.await;
        info!(
            "[SESSION] {}: stopped {} ({} frames dropped)",
            self.id,
            active.worker_id,
            self.dropped_frames()
        );
        true
    }

    /// All events of the running worker, not just frames.
    pub async fn subscribe_events(&self) -> Result<Subscription, BridgeError> {
        let worker_id = self.active_worker().await?;
        self.registry
            .subscribe(worker_id)
            .ok_or_else(|| BridgeError::NotRunning(worker_id.to_string()))
    }

    pub async fn start_recording(&self, name: Option<String>) -> Result<(), BridgeError> {
        self.send(WorkerCommand::StartRecording { name }).await
    }

    pub async fn stop_recording(&self) -> Result<(), BridgeError> {
        self.send(WorkerCommand::StopRecording).await
    }

    /// Ask the worker for a status report; it arrives as a `Status` event.
    pub async fn request_status(&self) -> Result<(), BridgeError> {
        self.send(WorkerCommand::Status).await
    }

    async fn send(&self, command: WorkerCommand) -> Result<(), BridgeError> {
        let worker_id = self.active_worker().await?;
        self.registry.send_command(worker_id, &command)
    }

    async fn active_worker(&self) -> Result<&'static str, BridgeError> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|a| a.is_live())
            .map(|a| a.worker_id)
            .ok_or(BridgeError::NotStreaming)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.forwarder.abort();
        }
    }
}

async fn forward_frames(
    session: String,
    mut subscription: Subscription,
    frame_tx: mpsc::Sender<FrameData>,
    dropped: Arc<AtomicU64>,
) {
    while let Some(event) = subscription.recv().await {
        match event {
            WorkerEvent::Frame(frame) => match frame_tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total % 100 == 1 {
                        debug!("[SESSION] {session}: consumer behind, {total} frames dropped");
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("[SESSION] {session}: frame consumer gone");
                    break;
                }
            },
            WorkerEvent::Status(status) => log_status(&session, &status),
            WorkerEvent::ErrorLine(line) => warn!("[SESSION] {session}: {line}"),
            WorkerEvent::Exited(code) => info!("[SESSION] {session}: worker exited ({code:?})"),
        }
    }
}

fn log_status(session: &str, status: &StatusPayload) {
    match status {
        StatusPayload::RecordingSaved(path) => info!("[SESSION] {session}: recording saved to {path}"),
        StatusPayload::ProcessedFile(path) => info!("[SESSION] {session}: processed file {path}"),
        StatusPayload::Unparseable(raw) => warn!("[SESSION] {session}: unparseable status {raw}"),
        other => debug!("[SESSION] {session}: {other:?}"),
    }
}
