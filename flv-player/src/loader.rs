use std::path::{Path, PathBuf};
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use common::Keyframe;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::errors::LoaderError;

/// A run of source bytes as delivered by a loader
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub data: Bytes,
    /// Absolute source offset of `data[0]`
    pub byte_start: u64,
    /// Set on the first chunk after a keyframe seek
    pub keyframe: Option<Keyframe>,
}

/// What a loader reports on its channel
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    Chunk(Chunk),
    /// Source exhausted
    Complete,
    /// Fetch failed; no further chunks follow
    Failed(String),
}

pub type LoaderSender = mpsc::Sender<LoaderEvent>;

/// Byte source positioned and throttled by the transmuxer
pub trait Loader: Send {
    /// Start fetching from the beginning of the source
    fn open(&mut self) -> Result<(), LoaderError>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Restart fetching at `byte_offset`.
    ///
    /// Unless `reset` is set the first chunk delivered afterwards carries the
    /// keyframe at (`time_ms`, `byte_offset`) so the codec can resynchronise.
    fn seek(&mut self, byte_offset: u64, reset: bool, time_ms: u64) -> Result<(), LoaderError>;

    /// Stop fetching; no events are delivered afterwards
    fn destroy(&mut self);

    fn is_paused(&self) -> bool;
}

/// Constructs loaders bound to a session's configuration
pub trait LoaderFactory: Send + Sync {
    fn create(&self, config: &SessionConfig, events: LoaderSender) -> Result<Box<dyn Loader>, LoaderError>;
}

/// Resolve a `file://` URL or plain path to a filesystem path
pub fn resolve_source_path(source_url: &str) -> Result<PathBuf, LoaderError> {
    if let Some(rest) = source_url.strip_prefix("file://") {
        return Ok(PathBuf::from(rest));
    }
    if let Some((scheme, _)) = source_url.split_once("://") {
        return Err(LoaderError::UnsupportedScheme {
            url: format!("{}://", scheme),
        });
    }
    if source_url.is_empty() {
        return Err(LoaderError::SourceNotFound { path: String::new() });
    }
    Ok(PathBuf::from(source_url))
}

/// Reads a local file in fixed-size chunks on a background task
pub struct FileLoader {
    path: PathBuf,
    chunk_size: usize,
    events: LoaderSender,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FileLoader {
    pub fn new(path: PathBuf, chunk_size: usize, events: LoaderSender) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            path,
            chunk_size,
            events,
            paused,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn start_at(&mut self, offset: u64, keyframe: Option<Keyframe>) -> Result<(), LoaderError> {
        if self.cancel.is_cancelled() {
            return Err(LoaderError::Destroyed);
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }

        let reader = ChunkReader {
            path: self.path.clone(),
            chunk_size: self.chunk_size,
            events: self.events.clone(),
            paused: self.paused.subscribe(),
            cancel: self.cancel.child_token(),
        };

        debug!("File loader starting at byte {} ({:?})", offset, self.path);
        self.task = Some(tokio::spawn(reader.run(offset, keyframe)));
        Ok(())
    }
}

impl Loader for FileLoader {
    fn open(&mut self) -> Result<(), LoaderError> {
        info!("Opening {:?}", self.path);
        self.start_at(0, None)
    }

    fn pause(&mut self) {
        self.paused.send_replace(true);
    }

    fn resume(&mut self) {
        self.paused.send_replace(false);
    }

    fn seek(&mut self, byte_offset: u64, reset: bool, time_ms: u64) -> Result<(), LoaderError> {
        let keyframe = (!reset).then(|| Keyframe::new(time_ms, byte_offset));
        self.start_at(byte_offset, keyframe)
    }

    fn destroy(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

impl Drop for FileLoader {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct ChunkReader {
    path: PathBuf,
    chunk_size: usize,
    events: LoaderSender,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl ChunkReader {
    async fn run(mut self, offset: u64, keyframe: Option<Keyframe>) {
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = self.read_from(offset, keyframe) => outcome,
        };

        let last = match outcome {
            Ok(()) => LoaderEvent::Complete,
            Err(e) => {
                warn!("File loader failed on {:?}: {}", self.path, e);
                LoaderEvent::Failed(e.to_string())
            }
        };
        let _ = self.events.send(last).await;
    }

    /// A missing source or an offset past its end is reported as `Failed`
    async fn read_from(&mut self, offset: u64, mut keyframe: Option<Keyframe>) -> Result<(), LoaderError> {
        let mut file = File::open(&self.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoaderError::SourceNotFound {
                path: self.path.display().to_string(),
            },
            _ => LoaderError::Io(e),
        })?;
        let size = file.metadata().await?.len();
        if offset > size {
            return Err(LoaderError::SeekBeyondEnd { offset, size });
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut position = offset;
        loop {
            self.wait_while_paused().await;

            let mut buf = BytesMut::zeroed(self.chunk_size);
            let n = file.read(&mut buf).await?;
            if n == 0 {
                debug!("File loader reached end at byte {}", position);
                return Ok(());
            }
            buf.truncate(n);

            let chunk = Chunk {
                data: buf.freeze(),
                byte_start: position,
                keyframe: keyframe.take(),
            };
            position += n as u64;

            if self.events.send(LoaderEvent::Chunk(chunk)).await.is_err() {
                // Session dropped its receiver
                return Ok(());
            }
        }
    }

    async fn wait_while_paused(&mut self) {
        loop {
            let paused = *self.paused.borrow_and_update();
            if !paused || self.paused.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Creates a `FileLoader` for the configured source
#[derive(Debug, Default, Clone)]
pub struct FileLoaderFactory;

impl LoaderFactory for FileLoaderFactory {
    fn create(&self, config: &SessionConfig, events: LoaderSender) -> Result<Box<dyn Loader>, LoaderError> {
        let path = resolve_source_path(&config.source_url)?;
        Ok(Box::new(FileLoader::new(path, config.chunk_size, events)))
    }
}

/// A live loader plus its event channel and the bytes the codec has not yet consumed.
///
/// Destroying a session drops its receiver, so chunks still in flight from the
/// old loader can never reach the codec.
pub(crate) struct LoaderSession {
    loader: Box<dyn Loader>,
    events: mpsc::Receiver<LoaderEvent>,
    stash: BytesMut,
    stash_start: u64,
    closed: bool,
}

impl LoaderSession {
    fn create(factory: &Arc<dyn LoaderFactory>, config: &SessionConfig) -> Result<Self, LoaderError> {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let loader = factory.create(config, tx)?;
        Ok(Self {
            loader,
            events: rx,
            stash: BytesMut::new(),
            stash_start: 0,
            closed: false,
        })
    }

    /// New loader reading from the start of the source
    pub(crate) fn open(factory: &Arc<dyn LoaderFactory>, config: &SessionConfig) -> Result<Self, LoaderError> {
        let mut session = Self::create(factory, config)?;
        session.loader.open()?;
        Ok(session)
    }

    /// New loader positioned at `keyframe`
    pub(crate) fn open_at(
        factory: &Arc<dyn LoaderFactory>,
        config: &SessionConfig,
        keyframe: Keyframe,
    ) -> Result<Self, LoaderError> {
        let mut session = Self::create(factory, config)?;
        session.loader.seek(keyframe.byte_offset, false, keyframe.time_ms)?;
        Ok(session)
    }

    pub(crate) fn loader_mut(&mut self) -> &mut dyn Loader {
        self.loader.as_mut()
    }

    /// Next loader event; `None` once the loader hung up
    pub(crate) async fn next_event(&mut self) -> Option<LoaderEvent> {
        if self.closed {
            return None;
        }
        let event = self.events.recv().await;
        if event.is_none() {
            self.closed = true;
        }
        event
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Prepend stashed bytes to `chunk`, yielding the codec input and its start offset.
    ///
    /// A keyframe-tagged chunk starts a new byte run, so any stash is dropped.
    pub(crate) fn take_input(&mut self, chunk: Chunk) -> (Bytes, u64, Option<Keyframe>) {
        if chunk.keyframe.is_some() || self.stash.is_empty() {
            self.stash.clear();
            return (chunk.data, chunk.byte_start, chunk.keyframe);
        }

        self.stash.extend_from_slice(&chunk.data);
        (self.stash.split().freeze(), self.stash_start, None)
    }

    /// Keep `input[consumed..]` for the next call
    pub(crate) fn retain_unconsumed(&mut self, input: &Bytes, start: u64, consumed: usize) {
        let consumed = consumed.min(input.len());
        if consumed < input.len() {
            self.stash.extend_from_slice(&input[consumed..]);
            self.stash_start = start + consumed as u64;
        }
    }

    pub(crate) fn stashed(&self) -> usize {
        self.stash.len()
    }

    pub(crate) fn discard_stash(&mut self) {
        self.stash.clear();
    }

    pub(crate) fn destroy(mut self) {
        self.loader.destroy();
        self.events.close();
    }
}
