use std::sync::Arc;

use bytes::Bytes;
use common::{InitSegment, Keyframe, MediaSegment, PipedChunk, ProtocolError, StreamMetadata, TrackType, WorkerCommand, WorkerResponse};
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, CodecFactory, CodecOutput};
use crate::config::SessionConfig;
use crate::errors::{CodecError, TransmuxError};
use crate::events::{ErrorKind, EventEmitter, EventHandler, TransmuxEvent};
use crate::loader::{Chunk, LoaderEvent, LoaderFactory, LoaderSession};
use crate::worker::WorkerProxy;

/// Unconsumed bytes beyond this are dropped as undecodable
pub(crate) const MAX_STASH_BYTES: usize = 16 * 1024 * 1024;

/// Something the transmuxer must react to
#[derive(Debug)]
pub enum Arrival {
    Loader(LoaderEvent),
    Worker(Result<WorkerResponse, ProtocolError>),
}

enum Mode {
    Inline {
        session: Option<LoaderSession>,
        codec: Option<Box<dyn Codec>>,
    },
    Offload(Option<WorkerProxy>),
}

/// Routes codec output into transmuxer events
struct EmitOutput<'a> {
    events: &'a EventEmitter<TransmuxEvent>,
    metadata: &'a mut Option<StreamMetadata>,
}

impl CodecOutput for EmitOutput<'_> {
    fn on_init_segment(&mut self, video: Option<Bytes>, audio: Option<Bytes>) {
        if let Some(data) = video {
            self.events.emit(TransmuxEvent::MediaSegmentInit(InitSegment {
                track: TrackType::Video,
                data,
            }));
        }
        if let Some(data) = audio {
            self.events.emit(TransmuxEvent::MediaSegmentInit(InitSegment {
                track: TrackType::Audio,
                data,
            }));
        }
    }

    fn on_media_segment(&mut self, track: TrackType, timestamp_ms: u64, data: Bytes) {
        self.events.emit(TransmuxEvent::MediaSegment(MediaSegment {
            track,
            timestamp_ms,
            data,
        }));
    }

    fn on_error(&mut self, error: CodecError) {
        emit_codec_error(self.events, &error);
    }

    fn on_metadata(&mut self, metadata: StreamMetadata) {
        record_metadata(self.metadata, &metadata);
        self.events.emit(TransmuxEvent::Metadata(metadata));
    }
}

fn emit_codec_error(events: &EventEmitter<TransmuxEvent>, error: &CodecError) {
    error!("Demux error: {}", error);
    let kind = match error {
        CodecError::InvalidHeader { .. } => "FormatUnsupported",
        CodecError::MalformedTag { .. } => "FormatError",
        CodecError::Amf { .. } => "MetadataError",
    };
    events.emit(TransmuxEvent::DemuxError {
        kind: kind.to_string(),
        info: error.to_string(),
    });
}

/// The first metadata seen is kept for seeking
fn record_metadata(slot: &mut Option<StreamMetadata>, metadata: &StreamMetadata) {
    if slot.is_none() {
        info!(
            "Stream metadata: duration {}s, keyframe index: {}",
            metadata.duration, metadata.has_keyframes_index
        );
        *slot = Some(metadata.clone());
    } else {
        debug!("Ignoring repeated metadata for seeking");
    }
}

/// Pipeline orchestrator: owns the loader and codec (directly, or through the
/// offload worker) and republishes codec output as [`TransmuxEvent`]s.
pub struct Transmuxer {
    config: SessionConfig,
    loader_factory: Arc<dyn LoaderFactory>,
    codec_factory: Arc<dyn CodecFactory>,
    mode: Mode,
    metadata: Option<StreamMetadata>,
    /// Raised for every loader session opened on the worker; older segments are dropped
    generation: u64,
    events: EventEmitter<TransmuxEvent>,
}

impl Transmuxer {
    /// Create a transmuxer for one session.
    ///
    /// With `offload_worker` set the worker task is spawned here, so this must
    /// run inside a Tokio runtime.
    pub fn new(
        config: SessionConfig,
        loader_factory: Arc<dyn LoaderFactory>,
        codec_factory: Arc<dyn CodecFactory>,
    ) -> Result<Self, TransmuxError> {
        let mode = if config.offload_worker {
            let mut proxy = WorkerProxy::spawn(config.clone(), loader_factory.clone(), codec_factory.clone());
            proxy.post(&WorkerCommand::Init)?;
            Mode::Offload(Some(proxy))
        } else {
            Mode::Inline {
                session: None,
                codec: None,
            }
        };

        Ok(Self {
            config,
            loader_factory,
            codec_factory,
            mode,
            metadata: None,
            generation: 0,
            events: EventEmitter::new(),
        })
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<TransmuxEvent>>) {
        self.events.subscribe(handler);
    }

    pub fn is_offloaded(&self) -> bool {
        matches!(self.mode, Mode::Offload(_))
    }

    /// First metadata reported by the codec
    pub fn metadata(&self) -> Option<&StreamMetadata> {
        self.metadata.as_ref()
    }

    pub fn is_seekable(&self) -> bool {
        self.metadata.as_ref().and_then(StreamMetadata::seekable_index).is_some()
    }

    /// Nearest keyframe at or below `target_ms`, clamped to the index bounds
    pub fn nearest_keyframe(&self, target_ms: u64) -> Option<Keyframe> {
        self.metadata.as_ref()?.seekable_index()?.nearest(target_ms)
    }

    fn proxy_mut(&mut self) -> Result<&mut WorkerProxy, TransmuxError> {
        match &mut self.mode {
            Mode::Offload(Some(proxy)) => Ok(proxy),
            _ => Err(TransmuxError::NoActiveSession),
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn emit_error(&self, kind: ErrorKind, detail: String) {
        self.events.emit(TransmuxEvent::Error { kind, detail });
    }

    /// Start fetching the configured source from the beginning
    pub fn load_source(&mut self) -> Result<(), TransmuxError> {
        info!("Loading source {}", self.config.source_url);
        match &mut self.mode {
            Mode::Inline { session, .. } => {
                if let Some(old) = session.take() {
                    old.destroy();
                }
                *session = Some(LoaderSession::open(&self.loader_factory, &self.config)?);
                Ok(())
            }
            Mode::Offload(_) => {
                let generation = self.next_generation();
                self.proxy_mut()?.post(&WorkerCommand::LoadSource { generation })
            }
        }
    }

    /// Feed loader bytes to the codec and return how many it consumed.
    ///
    /// A keyframe repositions the codec before decoding. The codec is created
    /// on first use. When offloaded the bytes are handed to the worker, which
    /// keeps its own leftovers, so the whole chunk counts as consumed.
    pub fn on_chunk_arrival(&mut self, data: &[u8], byte_start: u64, keyframe: Option<Keyframe>) -> usize {
        match &mut self.mode {
            Mode::Inline { codec, .. } => {
                let codec = codec.get_or_insert_with(|| self.codec_factory.create());
                if let Some(keyframe) = &keyframe {
                    codec.seek(keyframe);
                }
                let mut output = EmitOutput {
                    events: &self.events,
                    metadata: &mut self.metadata,
                };
                codec.set_input(data, &mut output)
            }
            Mode::Offload(_) => {
                let command = WorkerCommand::Pipe {
                    source: PipedChunk {
                        data: Bytes::copy_from_slice(data),
                        byte_start,
                        keyframe,
                    },
                };
                match self.proxy_mut().and_then(|proxy| proxy.post(&command)) {
                    Ok(()) => data.len(),
                    Err(e) => {
                        self.emit_error(ErrorKind::Worker, e.to_string());
                        0
                    }
                }
            }
        }
    }

    fn feed_chunk(&mut self, chunk: Chunk) {
        let Mode::Inline { session: Some(session), .. } = &mut self.mode else {
            return;
        };
        let (input, start, keyframe) = session.take_input(chunk);

        let consumed = self.on_chunk_arrival(&input, start, keyframe);

        let Mode::Inline { session: Some(session), .. } = &mut self.mode else {
            return;
        };
        session.retain_unconsumed(&input, start, consumed);
        if session.stashed() > MAX_STASH_BYTES {
            session.discard_stash();
            self.events.emit(TransmuxEvent::DemuxError {
                kind: "FormatError".to_string(),
                info: format!("no decodable unit in {} buffered bytes", MAX_STASH_BYTES),
            });
        }
    }

    /// Wait for the next loader or worker message.
    ///
    /// Pends forever when there is no live session, so it can sit in a
    /// `select!` alongside other sources.
    pub async fn next_arrival(&mut self) -> Arrival {
        match &mut self.mode {
            Mode::Inline { session: Some(session), .. } if !session.is_closed() => {
                if let Some(event) = session.next_event().await {
                    return Arrival::Loader(event);
                }
                debug!("Loader channel closed");
            }
            Mode::Offload(Some(proxy)) if !proxy.is_closed() => {
                if let Some(response) = proxy.recv().await {
                    return Arrival::Worker(response);
                }
                warn!("Worker channel closed");
            }
            _ => {}
        }
        std::future::pending().await
    }

    pub fn handle_arrival(&mut self, arrival: Arrival) {
        match arrival {
            Arrival::Loader(LoaderEvent::Chunk(chunk)) => self.feed_chunk(chunk),
            Arrival::Loader(LoaderEvent::Complete) => info!("Source fully loaded"),
            Arrival::Loader(LoaderEvent::Failed(detail)) => {
                error!("Loader failed: {}", detail);
                self.emit_error(ErrorKind::Loader, detail);
            }
            Arrival::Worker(Ok(response)) => self.handle_worker_response(response),
            Arrival::Worker(Err(e)) => {
                error!("Worker message rejected: {}", e);
                self.emit_error(ErrorKind::Worker, e.to_string());
            }
        }
    }

    fn handle_worker_response(&mut self, response: WorkerResponse) {
        match response {
            WorkerResponse::PipeCallback { source } => debug!("Worker consumed {} piped bytes", source),
            WorkerResponse::MediaSegmentInit { source } => self.events.emit(TransmuxEvent::MediaSegmentInit(source)),
            WorkerResponse::MediaSegment { source, generation } => {
                if generation < self.generation {
                    debug!(
                        "Dropping {}ms segment from superseded loader session {}",
                        source.timestamp_ms, generation
                    );
                    return;
                }
                self.events.emit(TransmuxEvent::MediaSegment(source))
            }
            WorkerResponse::Metadata { source } => {
                record_metadata(&mut self.metadata, &source);
                self.events.emit(TransmuxEvent::Metadata(source));
            }
            WorkerResponse::DemuxError { source } => self.events.emit(TransmuxEvent::DemuxError {
                kind: "FormatError".to_string(),
                info: source,
            }),
            WorkerResponse::Error { source } => self.emit_error(ErrorKind::Worker, source),
        }
    }

    /// Reposition the source at `keyframe`.
    ///
    /// The current loader is destroyed before its replacement is created and
    /// positioned; the codec is kept and resynchronised by the first chunk.
    /// Returns false, after emitting an error event, when the stream has no
    /// keyframe index or the new loader cannot start.
    pub fn seek_by_keyframe(&mut self, keyframe: Keyframe) -> bool {
        if !self.is_seekable() {
            warn!("Seek requested on a stream without keyframe index");
            self.emit_error(ErrorKind::NotSeekable, TransmuxError::NotSeekable.to_string());
            return false;
        }

        info!(
            "Seeking to keyframe {}ms at byte {}",
            keyframe.time_ms, keyframe.byte_offset
        );

        let result = match &mut self.mode {
            Mode::Inline { session, .. } => {
                if let Some(old) = session.take() {
                    old.destroy();
                }
                LoaderSession::open_at(&self.loader_factory, &self.config, keyframe)
                    .map(|new| *session = Some(new))
                    .map_err(TransmuxError::from)
            }
            Mode::Offload(_) => {
                let generation = self.next_generation();
                self.proxy_mut().and_then(|proxy| {
                    proxy.post(&WorkerCommand::Seek {
                        source: keyframe,
                        generation,
                    })
                })
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("Seek failed: {}", e);
                self.emit_error(ErrorKind::Loader, e.to_string());
                false
            }
        }
    }

    pub fn pause(&mut self) -> Result<(), TransmuxError> {
        match &mut self.mode {
            Mode::Inline { session: Some(session), .. } => {
                session.loader_mut().pause();
                Ok(())
            }
            Mode::Inline { session: None, .. } => Err(TransmuxError::NoActiveSession),
            Mode::Offload(_) => self.proxy_mut()?.post(&WorkerCommand::Pause),
        }
    }

    pub fn resume(&mut self) -> Result<(), TransmuxError> {
        match &mut self.mode {
            Mode::Inline { session: Some(session), .. } => {
                session.loader_mut().resume();
                Ok(())
            }
            Mode::Inline { session: None, .. } => Err(TransmuxError::NoActiveSession),
            Mode::Offload(_) => self.proxy_mut()?.post(&WorkerCommand::Resume),
        }
    }

    /// Restart the source from the beginning with a fresh loader
    pub fn refresh(&mut self) -> Result<(), TransmuxError> {
        info!("Refreshing source");
        match &mut self.mode {
            Mode::Inline { session, codec } => {
                if let Some(mut old) = session.take() {
                    old.loader_mut().pause();
                    old.destroy();
                }
                // The new session starts at the file header
                if let Some(codec) = codec.as_mut() {
                    codec.seek(&Keyframe::new(0, 0));
                }
                *session = Some(LoaderSession::open(&self.loader_factory, &self.config)?);
                Ok(())
            }
            Mode::Offload(_) => {
                let generation = self.next_generation();
                self.proxy_mut()?.post(&WorkerCommand::Refresh { generation })
            }
        }
    }

    /// Tear down loader, codec or worker; the transmuxer returns to its
    /// pre-`load_source` state.
    pub fn destroy(&mut self) {
        match &mut self.mode {
            Mode::Inline { session, codec } => {
                if let Some(old) = session.take() {
                    old.destroy();
                }
                *codec = None;
            }
            Mode::Offload(proxy) => {
                if let Some(mut proxy) = proxy.take() {
                    if let Err(e) = proxy.post(&WorkerCommand::Destroy) {
                        debug!("Worker already gone: {}", e);
                    }
                    proxy.terminate();
                }
            }
        }
        debug!("Transmuxer destroyed");
    }
}

impl Drop for Transmuxer {
    fn drop(&mut self) {
        self.destroy();
    }
}
