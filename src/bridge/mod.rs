//! External-process camera bridge.
//!
//! Workers are separate processes (usually Python scripts) that talk to the
//! camera hardware and write status lines and frames to stdout. The bridge
//! launches and tracks them, turns their output into [`WorkerEvent`]s and
//! fans those out to any number of subscribers.
//!
//! [`WorkerEvent`]: axis_bridge_types::WorkerEvent

pub mod broadcast;
pub mod demux;
pub mod detection;
pub mod error;
pub mod frame_assembler;
pub mod process_registry;
pub mod script_locator;
pub mod stream_session;

#[cfg(test)]
pub(crate) mod test_support;

pub use broadcast::{BroadcastChannel, Subscription};
pub use demux::{OutputDecoder, OutputProtocol};
pub use detection::{DetectionState, DetectionStateMachine, Probe};
pub use error::{BridgeError, FrameError};
pub use frame_assembler::FrameAssembler;
pub use process_registry::{
    ProcessRegistry, SharedRegistry, ShutdownPolicy, StartOutcome, WorkerSpec, WorkerState,
    WorkerStream,
};
pub use script_locator::ScriptLocator;
pub use stream_session::{FrameStream, SessionOptions, SharedStreamSession, StreamSession, WorkerKind};
