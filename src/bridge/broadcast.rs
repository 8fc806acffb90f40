//! Per-worker fan-out of [`WorkerEvent`]s.

use std::sync::{Arc, Mutex, PoisonError};

use axis_bridge_types::WorkerEvent;
use futures_util::Stream;
use log::warn;
use tokio::sync::broadcast::{self, error::RecvError};

/// Events buffered per subscriber before a slow one starts losing them.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Multi-consumer event stream with close-once semantics.
///
/// Cloning yields another handle to the same channel. Subscribers only see
/// events emitted after they attach; a slow subscriber skips events rather
/// than holding up the producer or its peers.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    sender: Arc<Mutex<Option<broadcast::Sender<WorkerEvent>>>>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Deliver `event` to every attached subscription. Returns how many
    /// subscriptions it reached; zero after close.
    pub fn emit(&self, event: WorkerEvent) -> usize {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Close the channel. Only the first call has an effect and returns `true`.
    pub fn close(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Attach a new subscription. After close, the subscription is already
    /// finished and yields nothing.
    pub fn subscribe(&self) -> Subscription {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };
        Subscription {
            rx: Some(rx),
            lagged: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// One consumer's view of a [`BroadcastChannel`].
#[derive(Debug)]
pub struct Subscription {
    rx: Option<broadcast::Receiver<WorkerEvent>>,
    lagged: u64,
}

impl Subscription {
    /// Next event, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    warn!("[BROADCAST] Subscriber lagged by {n} events");
                    self.lagged += n;
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// True once `recv` has reported the end of the stream.
    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }

    /// Events skipped because this subscriber fell behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Detach from the channel.
    pub fn cancel(self) {}

    pub fn into_stream(self) -> impl Stream<Item = WorkerEvent> {
        let mut sub = self;
        async_stream::stream! {
            while let Some(event) = sub.recv().await {
                yield event;
            }
        }
    }
}
