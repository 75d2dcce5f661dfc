use std::sync::{Arc, RwLock};
use common::{InitSegment, MediaSegment, StreamMetadata};
use tokio::sync::mpsc;

/// Classification carried by outward error events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; the session continues best-effort
    Decode,
    /// Seek requested on a stream without a keyframe index
    NotSeekable,
    /// Byte source failure
    Loader,
    /// Offload worker or its channel failed
    Worker,
    /// Presentation sink reported a failure
    Sink,
}

/// Events published by the transmuxer
#[derive(Debug, Clone, PartialEq)]
pub enum TransmuxEvent {
    MediaSegmentInit(InitSegment),
    MediaSegment(MediaSegment),
    Metadata(StreamMetadata),
    DemuxError { kind: String, info: String },
    Error { kind: ErrorKind, detail: String },
}

/// Events published by the player to the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Metadata(StreamMetadata),
    IngestionPaused { position: f64, buffered_end: Option<f64> },
    IngestionResumed { position: f64 },
    SeekCompleted { requested: f64, actual: f64 },
    Error { kind: ErrorKind, detail: String },
}

/// Receiver side of a subscription
pub trait EventHandler<E>: Send + Sync {
    fn handle_event(&self, event: &E);
}

impl<E, F> EventHandler<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn handle_event(&self, event: &E) {
        self(event)
    }
}

/// Forwards every event into an unbounded channel
pub struct ChannelHandler<E> {
    sender: mpsc::UnboundedSender<E>,
}

impl<E> ChannelHandler<E> {
    pub fn new(sender: mpsc::UnboundedSender<E>) -> Self {
        Self { sender }
    }
}

impl<E: Clone + Send> EventHandler<E> for ChannelHandler<E> {
    fn handle_event(&self, event: &E) {
        // Receiver gone means the subscriber shut down; nothing to deliver to
        let _ = self.sender.send(event.clone());
    }
}

/// Synchronous publish/subscribe point owned by a component.
///
/// Handlers run in subscription order on the publishing task.
pub struct EventEmitter<E> {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler<E>>>>>,
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<E>>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.push(handler);
    }

    pub fn clear(&self) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.clear();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn emit(&self, event: E) {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner()).clone();
        for handler in handlers {
            handler.handle_event(&event);
        }
    }
}
