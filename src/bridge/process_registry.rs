//! Named worker process lifecycle management.
//!
//! Each worker runs as a child process with piped stdio. Per worker:
//! - Supervisor task: reads stdout through the protocol decoder, merges
//!   stderr lines, publishes events, reaps the child
//! - Stderr reader task: forwards stderr lines to the supervisor
//! - Stdin writer task: writes command lines queued by the registry
//!
//! The live-worker map is the only state shared between callers and
//! supervisors; it is never locked across an await.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use axis_bridge_types::{WorkerCommand, WorkerEvent};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::broadcast::{BroadcastChannel, Subscription, DEFAULT_CHANNEL_CAPACITY};
use super::demux::{OutputDecoder, OutputProtocol};
use super::error::BridgeError;
use super::frame_assembler::DEFAULT_MAX_FRAME_BYTES;
use super::script_locator::ScriptLocator;

/// Size of a single stdout read.
const READ_CHUNK: usize = 4096;

/// How long a terminated worker gets before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How a worker is asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Terminate straight away.
    Immediate,
    /// Send `command` on stdin and keep reading output; terminate if the
    /// worker is still alive after `grace`.
    Graceful {
        command: WorkerCommand,
        grace: Duration,
    },
}

/// Interpreter used for worker scripts unless a [`WorkerSpec`] overrides it.
pub fn default_interpreter() -> Option<String> {
    if cfg!(windows) {
        Some("python".to_string())
    } else {
        Some("python3".to_string())
    }
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Script file name, resolved through the [`ScriptLocator`].
    pub script: String,
    pub args: Vec<String>,
    /// Program that runs the script; `None` executes the script directly.
    pub interpreter: Option<String>,
    pub protocol: OutputProtocol,
    pub shutdown: ShutdownPolicy,
    pub max_frame_bytes: usize,
}

impl WorkerSpec {
    pub fn new(script: impl Into<String>, protocol: OutputProtocol) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            interpreter: default_interpreter(),
            protocol,
            shutdown: ShutdownPolicy::Immediate,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn interpreter(mut self, interpreter: Option<String>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownPolicy) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

/// Lifecycle of a worker. `Exited` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Exited(Option<i32>),
}

/// Consumer-facing handle to one worker's events.
#[derive(Debug, Clone)]
pub struct WorkerStream {
    id: String,
    channel: BroadcastChannel,
    state: Arc<Mutex<WorkerState>>,
}

impl WorkerStream {
    fn new(id: &str, capacity: usize) -> Self {
        Self {
            id: id.to_string(),
            channel: BroadcastChannel::new(capacity),
            state: Arc::new(Mutex::new(WorkerState::Starting)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attach a subscription that sees events from now on.
    pub fn subscribe(&self) -> Subscription {
        self.channel.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Final `Exited` event, then close. Runs once per stream.
    fn finish(&self, code: Option<i32>) {
        self.set_state(WorkerState::Exited(code));
        self.channel.emit(WorkerEvent::Exited(code));
        self.channel.close();
    }
}

/// Result of [`ProcessRegistry::start`]. Every variant carries a subscription
/// attached before the worker could produce anything.
#[derive(Debug)]
pub enum StartOutcome {
    Spawned(WorkerStream, Subscription),
    /// The id was live; this is its existing stream.
    AlreadyRunning(WorkerStream, Subscription),
    /// Locating or spawning failed. The stream holds a single `ErrorLine`
    /// and is already closed.
    Failed(WorkerStream, Subscription),
}

impl StartOutcome {
    pub fn stream(&self) -> &WorkerStream {
        match self {
            StartOutcome::Spawned(stream, _)
            | StartOutcome::AlreadyRunning(stream, _)
            | StartOutcome::Failed(stream, _) => stream,
        }
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, StartOutcome::AlreadyRunning(..))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StartOutcome::Failed(..))
    }

    pub fn into_parts(self) -> (WorkerStream, Subscription) {
        match self {
            StartOutcome::Spawned(stream, sub)
            | StartOutcome::AlreadyRunning(stream, sub)
            | StartOutcome::Failed(stream, sub) => (stream, sub),
        }
    }

    pub fn into_subscription(self) -> Subscription {
        self.into_parts().1
    }
}

struct WorkerEntry {
    generation: u64,
    stream: WorkerStream,
    pid: Option<u32>,
    cmd_tx: mpsc::UnboundedSender<String>,
    kill_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WorkerEntry {
    /// Signal the supervisor and wait until the stream is closed.
    async fn shutdown(mut self) {
        let id = self.stream.id().to_string();
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("[REGISTRY] Supervisor for {id} failed: {e}");
            }
        }
        // No-op when the supervisor already closed it
        if self.stream.channel.close() {
            warn!("[REGISTRY] Closed stream of {id} without an exit event");
        }
    }
}

type WorkerMap = Mutex<HashMap<String, WorkerEntry>>;

/// Shared reference to the registry.
pub type SharedRegistry = Arc<ProcessRegistry>;

/// Owns every running worker. At most one live worker per id.
pub struct ProcessRegistry {
    workers: Arc<WorkerMap>,
    locator: ScriptLocator,
    next_generation: AtomicU64,
    channel_capacity: usize,
}

impl ProcessRegistry {
    pub fn new(locator: ScriptLocator) -> Self {
        Self::with_channel_capacity(locator, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(locator: ScriptLocator, channel_capacity: usize) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            locator,
            next_generation: AtomicU64::new(1),
            channel_capacity,
        }
    }

    pub fn locator(&self) -> &ScriptLocator {
        &self.locator
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<String, WorkerEntry>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start worker `id`, or attach to it if it is already running.
    ///
    /// Returns once the process is spawned; it does not wait for output.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, id: &str, spec: &WorkerSpec) -> StartOutcome {
        let mut workers = self.lock_workers();

        if let Some(entry) = workers.get(id) {
            debug!("[REGISTRY] Worker {id} already running, attaching");
            let subscription = entry.stream.subscribe();
            return StartOutcome::AlreadyRunning(entry.stream.clone(), subscription);
        }

        let stream = WorkerStream::new(id, self.channel_capacity);
        let subscription = stream.subscribe();

        let script = match self.locator.resolve(&spec.script) {
            Ok(script) => script,
            Err(e) => return fail(stream, subscription, &e),
        };

        let mut child = match build_command(&script, spec).spawn() {
            Ok(child) => child,
            Err(source) => {
                let e = BridgeError::SpawnFailure {
                    id: id.to_string(),
                    source,
                };
                return fail(stream, subscription, &e);
            }
        };

        let pid = child.id();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        info!(
            "[REGISTRY] Started worker {id} (pid={pid:?}): {} {}",
            script.display(),
            spec.args.join(" ")
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(stdin_writer_task(id.to_string(), cmd_rx, stdin));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        stream.set_state(WorkerState::Running);

        let supervisor = Supervisor {
            id: id.to_string(),
            generation,
            child,
            decoder: spec.protocol.decoder(spec.max_frame_bytes),
            stream: stream.clone(),
            workers: Arc::downgrade(&self.workers),
            shutdown: spec.shutdown.clone(),
            cmd_tx: cmd_tx.clone(),
        };
        let task = tokio::spawn(supervisor.run(kill_rx));

        workers.insert(
            id.to_string(),
            WorkerEntry {
                generation,
                stream: stream.clone(),
                pid,
                cmd_tx,
                kill_tx: Some(kill_tx),
                task: Some(task),
            },
        );

        StartOutcome::Spawned(stream, subscription)
    }

    /// Stop worker `id` and wait for its stream to close.
    /// Returns `false` when it was not running.
    pub async fn stop(&self, id: &str) -> bool {
        let entry = self.lock_workers().remove(id);
        match entry {
            Some(entry) => {
                info!("[REGISTRY] Stopping worker {id}");
                entry.shutdown().await;
                true
            }
            None => {
                debug!("[REGISTRY] Stop requested for {id}, not running");
                false
            }
        }
    }

    /// Stop every tracked worker. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let entries: Vec<WorkerEntry> = self.lock_workers().drain().map(|(_, e)| e).collect();
        let count = entries.len();
        if count > 0 {
            info!("[REGISTRY] Stopping {count} workers");
        }
        join_all(entries.into_iter().map(WorkerEntry::shutdown)).await;
        count
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock_workers().contains_key(id)
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_workers().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.lock_workers().get(id).and_then(|e| e.pid)
    }

    /// Existing stream of a live worker.
    pub fn stream(&self, id: &str) -> Option<WorkerStream> {
        self.lock_workers().get(id).map(|e| e.stream.clone())
    }

    /// Attach to a live worker's future events.
    pub fn subscribe(&self, id: &str) -> Option<Subscription> {
        self.lock_workers().get(id).map(|e| e.stream.subscribe())
    }

    /// Queue a command line for the worker's stdin.
    pub fn send_command(&self, id: &str, command: &WorkerCommand) -> Result<(), BridgeError> {
        let workers = self.lock_workers();
        let entry = workers
            .get(id)
            .ok_or_else(|| BridgeError::NotRunning(id.to_string()))?;
        debug!("[REGISTRY] -> {id}: {}", command.to_line());
        entry
            .cmd_tx
            .send(command.to_line())
            .map_err(|_| BridgeError::StdinClosed(id.to_string()))
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        // Dropping the entries drops their kill senders, which terminates
        // each supervised child.
        let workers = self.lock_workers();
        if !workers.is_empty() {
            info!("[REGISTRY] Dropping registry with {} live workers", workers.len());
        }
    }
}

fn fail(stream: WorkerStream, subscription: Subscription, err: &BridgeError) -> StartOutcome {
    error!("[REGISTRY] {err}");
    stream.channel.emit(WorkerEvent::ErrorLine(err.to_string()));
    stream.set_state(WorkerState::Exited(None));
    stream.channel.close();
    StartOutcome::Failed(stream, subscription)
}

fn build_command(script: &Path, spec: &WorkerSpec) -> Command {
    let script = std::path::absolute(script).unwrap_or_else(|_| script.to_path_buf());

    let mut cmd = match &spec.interpreter {
        Some(interpreter) => {
            let mut cmd = Command::new(interpreter);
            cmd.arg(&script);
            cmd
        }
        None => Command::new(&script),
    };

    cmd.args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = script.parent() {
        cmd.current_dir(dir);
    }

    cmd
}

/// Reader side of one worker. Sole owner of the decoder and the producer
/// side of the worker's channel.
struct Supervisor {
    id: String,
    generation: u64,
    child: Child,
    decoder: Box<dyn OutputDecoder>,
    stream: WorkerStream,
    workers: Weak<WorkerMap>,
    shutdown: ShutdownPolicy,
    cmd_tx: mpsc::UnboundedSender<String>,
}

/// How far a supervised worker has got in being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopStage {
    Running,
    /// Shutdown command sent; output is still read until the grace period ends.
    Draining,
    /// Termination signal sent.
    Terminating,
    /// Killed outright; remaining output is discarded.
    Killed,
}

impl Supervisor {
    async fn run(mut self, mut kill_rx: oneshot::Receiver<()>) {
        let mut stdout = self.child.stdout.take();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<String>();
        if let Some(stderr) = self.child.stderr.take() {
            tokio::spawn(stderr_reader_task(stderr, err_tx));
        } else {
            drop(err_tx);
        }

        let mut buf = vec![0u8; READ_CHUNK];
        let mut stdout_open = stdout.is_some();
        let mut stderr_open = true;
        let mut stage = StopStage::Running;
        let mut deadline: Option<Instant> = None;

        // A stopping worker is still read so it never blocks on a full pipe
        while stdout_open || stderr_open {
            tokio::select! {
                _ = &mut kill_rx, if stage == StopStage::Running => {
                    (stage, deadline) = self.begin_stop();
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    (stage, deadline) = self.escalate(stage);
                    if stage == StopStage::Killed {
                        break;
                    }
                }
                read = read_chunk(&mut stdout, &mut buf), if stdout_open => match read {
                    Ok(0) => {
                        stdout_open = false;
                        let events = self.decoder.finish();
                        self.publish(events);
                    }
                    Ok(n) => {
                        let events = self.decoder.decode(&buf[..n]);
                        self.publish(events);
                    }
                    Err(e) => {
                        warn!("[REGISTRY] Worker {} stdout read error: {e}", self.id);
                        stdout_open = false;
                    }
                },
                line = err_rx.recv(), if stderr_open => match line {
                    Some(line) => {
                        debug!("[{}] {line}", self.id);
                        self.stream.channel.emit(WorkerEvent::ErrorLine(line));
                    }
                    None => stderr_open = false,
                },
            }
        }

        let code = loop {
            tokio::select! {
                status = self.child.wait() => break exit_code(status),
                _ = &mut kill_rx, if stage == StopStage::Running => {
                    (stage, deadline) = self.begin_stop();
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    (stage, deadline) = self.escalate(stage);
                }
            }
        };

        self.deregister();
        info!("[REGISTRY] Worker {} exited (code={code:?})", self.id);
        self.stream.finish(code);
    }

    fn publish(&self, events: Vec<WorkerEvent>) {
        for event in events {
            self.stream.channel.emit(event);
        }
    }

    /// Remove this worker's entry unless it was already replaced or stopped.
    fn deregister(&self) {
        let Some(workers) = self.workers.upgrade() else {
            return;
        };
        let mut workers = workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers
            .get(&self.id)
            .is_some_and(|e| e.generation == self.generation)
        {
            workers.remove(&self.id);
        }
    }

    fn begin_stop(&mut self) -> (StopStage, Option<Instant>) {
        if let ShutdownPolicy::Graceful { command, grace } = &self.shutdown {
            if self.cmd_tx.send(command.to_line()).is_ok() {
                debug!(
                    "[REGISTRY] Sent {} to {}, waiting up to {grace:?}",
                    command.to_line(),
                    self.id
                );
                return (StopStage::Draining, Some(Instant::now() + *grace));
            }
        }
        signal_terminate(&mut self.child);
        (StopStage::Terminating, Some(Instant::now() + TERMINATE_GRACE))
    }

    fn escalate(&mut self, stage: StopStage) -> (StopStage, Option<Instant>) {
        if stage == StopStage::Draining {
            warn!(
                "[REGISTRY] Worker {} still running after shutdown command, terminating",
                self.id
            );
            signal_terminate(&mut self.child);
            return (StopStage::Terminating, Some(Instant::now() + TERMINATE_GRACE));
        }
        warn!("[REGISTRY] Worker {} ignored termination, killing", self.id);
        let _ = self.child.start_kill();
        (StopStage::Killed, None)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn read_chunk(stdout: &mut Option<ChildStdout>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stdout {
        Some(out) => out.read(buf).await,
        None => Ok(0),
    }
}

fn exit_code(status: std::io::Result<ExitStatus>) -> Option<i32> {
    match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("[REGISTRY] Failed to reap worker: {e}");
            None
        }
    }
}

#[cfg(not(windows))]
fn signal_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child and has not been reaped yet, so it
        // cannot have been recycled.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(windows)]
fn signal_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// Writes queued command lines to the worker's stdin.
async fn stdin_writer_task(
    id: String,
    mut cmd_rx: mpsc::UnboundedReceiver<String>,
    mut stdin: ChildStdin,
) {
    while let Some(line) = cmd_rx.recv().await {
        if stdin.write_all(format!("{line}\n").as_bytes()).await.is_err() {
            warn!("[REGISTRY] Failed to write to {id} stdin");
            break;
        }
        if stdin.flush().await.is_err() {
            warn!("[REGISTRY] Failed to flush {id} stdin");
            break;
        }
    }
    debug!("[REGISTRY] Stdin writer for {id} exiting");
}

/// Forwards non-empty stderr lines to the supervisor.
async fn stderr_reader_task(stderr: ChildStderr, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("[REGISTRY] Worker stderr read error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::test_support::{next_event, scratch_dir, sh_spec, write_script};
    use axis_bridge_types::StatusPayload;

    async fn collect(sub: &mut Subscription) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = next_event(sub).await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = scratch_dir();
        write_script(&dir, "sleeper.sh", "exec sleep 30\n");
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));
        let spec = sh_spec("sleeper.sh", OutputProtocol::LineTagged);

        let first = registry.start("sleeper", &spec);
        assert!(matches!(first, StartOutcome::Spawned(..)));
        let pid = registry.pid("sleeper");
        assert!(pid.is_some());

        let second = registry.start("sleeper", &spec);
        assert!(second.is_already_running());
        assert_eq!(registry.pid("sleeper"), pid);
        assert_eq!(registry.running_ids(), vec!["sleeper".to_string()]);

        let (_, mut sub_a) = first.into_parts();
        let mut sub_b = second.into_subscription();

        assert!(registry.stop("sleeper").await);
        assert!(!registry.is_running("sleeper"));

        let events_a = collect(&mut sub_a).await;
        let events_b = collect(&mut sub_b).await;
        assert_eq!(events_a, events_b);
        assert_eq!(
            events_a.iter().filter(|e| matches!(e, WorkerEvent::Exited(_))).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_repeated_stop_closes_once() {
        let dir = scratch_dir();
        write_script(&dir, "sleeper.sh", "exec sleep 30\n");
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));

        let (stream, mut sub) = registry
            .start("cam", &sh_spec("sleeper.sh", OutputProtocol::RawBinary))
            .into_parts();

        assert!(registry.stop("cam").await);
        assert!(!registry.stop("cam").await);
        assert!(!registry.stop("cam").await);

        assert!(stream.is_closed());
        assert!(matches!(stream.state(), WorkerState::Exited(_)));
        assert!(matches!(next_event(&mut sub).await, Some(WorkerEvent::Exited(_))));
        assert_eq!(next_event(&mut sub).await, None);
        assert_eq!(next_event(&mut sub).await, None);
    }

    #[tokio::test]
    async fn test_missing_script_yields_single_error() {
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(scratch_dir()));
        let outcome = registry.start("detect", &sh_spec("nope.sh", OutputProtocol::LineTagged));
        assert!(outcome.is_failed());

        let (stream, mut sub) = outcome.into_parts();
        let events = collect(&mut sub).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::ErrorLine(msg) if msg.contains("nope.sh")));
        assert!(stream.is_closed());
        assert!(!registry.is_running("detect"));
    }

    #[tokio::test]
    async fn test_spawn_failure_yields_single_error() {
        let dir = scratch_dir();
        write_script(&dir, "ok.sh", "echo hi\n");
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));
        let spec = sh_spec("ok.sh", OutputProtocol::LineTagged)
            .interpreter(Some("/definitely/not/an/interpreter".to_string()));

        let mut sub = registry.start("ok", &spec).into_subscription();
        let events = collect(&mut sub).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], WorkerEvent::ErrorLine(_)));
    }

    #[tokio::test]
    async fn test_natural_exit_events_and_cleanup() {
        let dir = scratch_dir();
        write_script(
            &dir,
            "talker.sh",
            "echo 'STATUS:hello'\necho 'ERROR:bad lens'\nexit 3\n",
        );
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));

        let mut sub = registry
            .start("talker", &sh_spec("talker.sh", OutputProtocol::LineTagged))
            .into_subscription();
        let events = collect(&mut sub).await;
        assert_eq!(
            events,
            vec![
                WorkerEvent::Status(StatusPayload::Message("hello".to_string())),
                WorkerEvent::ErrorLine("bad lens".to_string()),
                WorkerEvent::Exited(Some(3)),
            ]
        );
        // Deregistered before the stream closed
        assert!(!registry.is_running("talker"));
        assert!(!registry.stop("talker").await);

        // Same id can be started again
        let again = registry.start("talker", &sh_spec("talker.sh", OutputProtocol::LineTagged));
        assert!(matches!(again, StartOutcome::Spawned(..)));
    }

    #[tokio::test]
    async fn test_raw_binary_worker_frames() {
        let dir = scratch_dir();
        write_script(
            &dir,
            "jpeg.sh",
            "printf 'STATUS:ready\\n'\nprintf '\\377\\330abc\\377\\331'\nprintf '\\377\\330def\\377\\331'\n",
        );
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));

        let mut sub = registry
            .start("jpeg", &sh_spec("jpeg.sh", OutputProtocol::RawBinary))
            .into_subscription();
        let events = collect(&mut sub).await;
        assert_eq!(
            events,
            vec![
                WorkerEvent::Status(StatusPayload::Message("ready".to_string())),
                WorkerEvent::Frame(b"\xFF\xD8abc\xFF\xD9".as_slice().into()),
                WorkerEvent::Frame(b"\xFF\xD8def\xFF\xD9".as_slice().into()),
                WorkerEvent::Exited(Some(0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_stderr_lines_become_error_events() {
        let dir = scratch_dir();
        write_script(&dir, "noisy.sh", "echo 'FPS: 29.97' >&2\n");
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));

        let mut sub = registry
            .start("noisy", &sh_spec("noisy.sh", OutputProtocol::LineTagged))
            .into_subscription();
        let events = collect(&mut sub).await;
        assert_eq!(
            events,
            vec![
                WorkerEvent::ErrorLine("FPS: 29.97".to_string()),
                WorkerEvent::Exited(Some(0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_command_reaches_stdin() {
        let dir = scratch_dir();
        write_script(&dir, "echoer.sh", "read line\necho \"STATUS:got $line\"\n");
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));

        let mut sub = registry
            .start("echoer", &sh_spec("echoer.sh", OutputProtocol::LineTagged))
            .into_subscription();
        registry
            .send_command("echoer", &WorkerCommand::StartRecording { name: Some("take2".into()) })
            .unwrap();

        assert_eq!(
            next_event(&mut sub).await,
            Some(WorkerEvent::Status(StatusPayload::Message(
                "got START_RECORDING:take2".to_string()
            )))
        );
        assert_eq!(next_event(&mut sub).await, Some(WorkerEvent::Exited(Some(0))));

        assert!(matches!(
            registry.send_command("echoer", &WorkerCommand::Status),
            Err(BridgeError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_sends_exit_first() {
        let dir = scratch_dir();
        write_script(
            &dir,
            "controller.sh",
            "while read line; do\n  if [ \"$line\" = \"EXIT\" ]; then\n    echo 'STATUS:bye'\n    exit 0\n  fi\ndone\n",
        );
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));
        let spec = sh_spec("controller.sh", OutputProtocol::RawBinary).shutdown(
            ShutdownPolicy::Graceful {
                command: WorkerCommand::Exit,
                grace: Duration::from_secs(5),
            },
        );

        let mut sub = registry.start("controller", &spec).into_subscription();
        assert!(registry.stop("controller").await);

        let events = collect(&mut sub).await;
        assert_eq!(
            events,
            vec![
                WorkerEvent::Status(StatusPayload::Message("bye".to_string())),
                WorkerEvent::Exited(Some(0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_graceful_shutdown_reads_large_output() {
        let dir = scratch_dir();
        write_script(
            &dir,
            "recorder.sh",
            "while read line; do\n  if [ \"$line\" = \"EXIT\" ]; then\n    head -c 300000 /dev/zero | tr '\\0' 'a'\n    echo\n    echo 'STATUS:RECORDING_SAVED:/v/a.mp4'\n    exit 0\n  fi\ndone\n",
        );
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));
        let spec = sh_spec("recorder.sh", OutputProtocol::RawBinary).shutdown(
            ShutdownPolicy::Graceful {
                command: WorkerCommand::Exit,
                grace: Duration::from_secs(5),
            },
        );

        let mut sub = registry.start("recorder", &spec).into_subscription();
        assert!(registry.stop("recorder").await);

        // More than a pipe buffer is written after EXIT; the worker must
        // still finish on its own
        let events = collect(&mut sub).await;
        assert_eq!(
            events,
            vec![
                WorkerEvent::Status(StatusPayload::RecordingSaved("/v/a.mp4".to_string())),
                WorkerEvent::Exited(Some(0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_all() {
        let dir = scratch_dir();
        write_script(&dir, "sleeper.sh", "exec sleep 30\n");
        let registry = ProcessRegistry::new(ScriptLocator::with_dir(&dir));
        let spec = sh_spec("sleeper.sh", OutputProtocol::LineTagged);

        let mut subs = vec![
            registry.start("a", &spec).into_subscription(),
            registry.start("b", &spec).into_subscription(),
        ];
        assert_eq!(registry.stop_all().await, 2);
        assert!(registry.running_ids().is_empty());
        assert_eq!(registry.stop_all().await, 0);

        for sub in &mut subs {
            assert!(matches!(next_event(sub).await, Some(WorkerEvent::Exited(_))));
            assert_eq!(next_event(sub).await, None);
        }
    }
}
