//! Camera detection by sequential probing.
//!
//! One short-lived `detect_camera` worker per device class, most specific
//! class first. Probes never overlap so two of them cannot contend for the
//! same physical device.

use std::time::Duration;

use axis_bridge_types::{
    DetectionOutcome, DetectionResult, DeviceClass, StatusPayload, WorkerEvent,
};
use log::{debug, info, warn};

use super::broadcast::Subscription;
use super::demux::OutputProtocol;
use super::process_registry::{SharedRegistry, WorkerSpec};

/// Detection worker script.
pub const DETECT_SCRIPT: &str = "detect_camera.py";

/// Default limit on how long a single probe may run.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One detection attempt for one device class.
#[derive(Debug, Clone)]
pub struct Probe {
    pub device_class: DeviceClass,
    pub spec: WorkerSpec,
}

impl Probe {
    pub fn new(device_class: DeviceClass, spec: WorkerSpec) -> Self {
        Self { device_class, spec }
    }

    /// `detect_camera.py --type <tag>`.
    pub fn detect_camera(device_class: DeviceClass, interpreter: Option<String>) -> Self {
        let spec = WorkerSpec::new(DETECT_SCRIPT, OutputProtocol::LineTagged)
            .args(["--type", device_class.tag()])
            .interpreter(interpreter);
        Self::new(device_class, spec)
    }

    fn worker_id(&self) -> String {
        format!("detect-{}", self.device_class.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionState {
    /// Next probe to run, by index.
    Probing(usize),
    Found(DetectionResult),
    NotFound,
}

impl DetectionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DetectionState::Probing(_))
    }
}

pub struct DetectionStateMachine {
    registry: SharedRegistry,
    probes: Vec<Probe>,
    probe_timeout: Option<Duration>,
    state: DetectionState,
}

impl DetectionStateMachine {
    pub fn new(registry: SharedRegistry, probes: Vec<Probe>) -> Self {
        let state = if probes.is_empty() {
            DetectionState::NotFound
        } else {
            DetectionState::Probing(0)
        };
        Self {
            registry,
            probes,
            probe_timeout: Some(DEFAULT_PROBE_TIMEOUT),
            state,
        }
    }

    /// The `detect_camera` probes in [`DeviceClass::PROBE_ORDER`].
    pub fn standard(registry: SharedRegistry, interpreter: Option<String>) -> Self {
        let probes = DeviceClass::PROBE_ORDER
            .into_iter()
            .map(|class| Probe::detect_camera(class, interpreter.clone()))
            .collect();
        Self::new(registry, probes)
    }

    /// `None` lets a probe run until its worker exits.
    pub fn with_probe_timeout(mut self, probe_timeout: Option<Duration>) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn state(&self) -> &DetectionState {
        &self.state
    }

    /// Run the current probe and advance. No-op once terminal.
    pub async fn step(&mut self) -> &DetectionState {
        let DetectionState::Probing(index) = self.state else {
            return &self.state;
        };
        let Some(probe) = self.probes.get(index) else {
            self.state = DetectionState::NotFound;
            return &self.state;
        };

        self.state = match self.run_probe(probe).await {
            Some(device_path) => {
                info!("[DETECT] Found {} camera at {device_path}", probe.device_class);
                DetectionState::Found(DetectionResult {
                    device_class: probe.device_class,
                    device_path,
                })
            }
            None if index + 1 < self.probes.len() => DetectionState::Probing(index + 1),
            None => {
                info!("[DETECT] No camera found after {} probes", self.probes.len());
                DetectionState::NotFound
            }
        };
        &self.state
    }

    /// Run probes until one succeeds or all have failed.
    pub async fn run(mut self) -> DetectionOutcome {
        while !self.state.is_terminal() {
            self.step().await;
        }
        match self.state {
            DetectionState::Found(result) => DetectionOutcome::Found(result),
            _ => DetectionOutcome::NotFound,
        }
    }

    async fn run_probe(&self, probe: &Probe) -> Option<String> {
        let id = probe.worker_id();
        info!("[DETECT] Probing for {} camera", probe.device_class);

        let mut subscription = self.registry.start(&id, &probe.spec).into_subscription();
        let found = match self.probe_timeout {
            Some(limit) => match tokio::time::timeout(limit, scan_for_device(&mut subscription)).await {
                Ok(found) => found,
                Err(_) => {
                    warn!("[DETECT] {} probe timed out after {limit:?}", probe.device_class);
                    None
                }
            },
            None => scan_for_device(&mut subscription).await,
        };

        // The probe usually exits by itself; this catches the ones that don't.
        subscription.cancel();
        self.registry.stop(&id).await;
        found
    }
}

async fn scan_for_device(subscription: &mut Subscription) -> Option<String> {
    while let Some(event) = subscription.recv().await {
        if let Some(path) = event.device_found() {
            return Some(path.to_string());
        }
        match event {
            WorkerEvent::ErrorLine(line) => debug!("[DETECT] probe error: {line}"),
            WorkerEvent::Status(StatusPayload::Untagged(line)) => debug!("[DETECT] {line}"),
            WorkerEvent::Exited(code) => debug!("[DETECT] probe exited ({code:?})"),
            _ => {}
        }
    }
    None
}
