//! Offload worker: runs the loader and codec on a separate task and talks to
//! the transmuxer only through serialized messages.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use common::{
    decode, encode, InitSegment, Keyframe, MediaSegment, PipedChunk, ProtocolError, SequenceCounter,
    StreamMetadata, TrackType, WorkerCommand, WorkerResponse,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, CodecFactory, CodecOutput};
use crate::config::SessionConfig;
use crate::errors::{CodecError, TransmuxError};
use crate::loader::{LoaderEvent, LoaderFactory, LoaderSession};
use crate::transmuxer::MAX_STASH_BYTES;

type Frame = Vec<u8>;

/// Transmuxer-side handle to a running worker
pub struct WorkerProxy {
    commands: mpsc::UnboundedSender<Frame>,
    responses: mpsc::UnboundedReceiver<Frame>,
    outgoing: SequenceCounter,
    incoming: SequenceCounter,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl WorkerProxy {
    /// Spawn the worker task. Must be called inside a Tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        loader_factory: Arc<dyn LoaderFactory>,
        codec_factory: Arc<dyn CodecFactory>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let worker = TransmuxWorker {
            config,
            loader_factory,
            codec_factory,
            session: None,
            codec: None,
            generation: 0,
            pipe_stash: BytesMut::new(),
            pipe_start: 0,
            responses: response_tx,
            outgoing: SequenceCounter::new(),
            incoming: SequenceCounter::new(),
        };

        info!("Starting transmux worker");
        let task = tokio::spawn(worker.run(command_rx));

        Self {
            commands: command_tx,
            responses: response_rx,
            outgoing: SequenceCounter::new(),
            incoming: SequenceCounter::new(),
            task: Some(task),
            closed: false,
        }
    }

    pub fn post(&mut self, command: &WorkerCommand) -> Result<(), TransmuxError> {
        let frame = encode(self.outgoing.next_outgoing(), command)?;
        self.commands.send(frame).map_err(|_| TransmuxError::Worker {
            message: "worker is not running".to_string(),
        })
    }

    /// Next response; `None` once the worker has exited
    pub async fn recv(&mut self) -> Option<Result<WorkerResponse, ProtocolError>> {
        if self.closed {
            return None;
        }
        let Some(frame) = self.responses.recv().await else {
            self.closed = true;
            return None;
        };

        let result = decode::<WorkerResponse>(&frame).and_then(|message| {
            self.incoming.accept(message.sequence_number)?;
            Ok(message.body)
        });
        Some(result)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop the worker task without waiting for pending commands
    pub fn terminate(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Transmux worker terminated");
        }
    }
}

impl Drop for WorkerProxy {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Codec output collected as worker responses, in emission order
struct ResponseOutput {
    generation: u64,
    responses: Vec<WorkerResponse>,
}

impl CodecOutput for ResponseOutput {
    fn on_init_segment(&mut self, video: Option<Bytes>, audio: Option<Bytes>) {
        let tracks = [(TrackType::Video, video), (TrackType::Audio, audio)];
        for (track, data) in tracks {
            if let Some(data) = data {
                self.responses.push(WorkerResponse::MediaSegmentInit {
                    source: InitSegment { track, data },
                });
            }
        }
    }

    fn on_media_segment(&mut self, track: TrackType, timestamp_ms: u64, data: Bytes) {
        self.responses.push(WorkerResponse::MediaSegment {
            source: MediaSegment {
                track,
                timestamp_ms,
                data,
            },
            generation: self.generation,
        });
    }

    fn on_error(&mut self, error: CodecError) {
        self.responses.push(WorkerResponse::DemuxError {
            source: error.to_string(),
        });
    }

    fn on_metadata(&mut self, metadata: StreamMetadata) {
        self.responses.push(WorkerResponse::Metadata { source: metadata });
    }
}

struct TransmuxWorker {
    config: SessionConfig,
    loader_factory: Arc<dyn LoaderFactory>,
    codec_factory: Arc<dyn CodecFactory>,
    session: Option<LoaderSession>,
    codec: Option<Box<dyn Codec>>,
    /// Generation of the current loader session
    generation: u64,
    /// Leftovers from piped chunks
    pipe_stash: BytesMut,
    pipe_start: u64,
    responses: mpsc::UnboundedSender<Frame>,
    outgoing: SequenceCounter,
    incoming: SequenceCounter,
}

impl TransmuxWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Frame>) {
        loop {
            tokio::select! {
                frame = commands.recv() => {
                    let Some(frame) = frame else {
                        debug!("Command channel closed");
                        break;
                    };
                    if !self.handle_frame(&frame) {
                        break;
                    }
                }
                Some(event) = Self::next_loader_event(&mut self.session) => {
                    if !self.handle_loader_event(event) {
                        break;
                    }
                }
            }
        }

        self.teardown();
        info!("Transmux worker stopped");
    }

    async fn next_loader_event(session: &mut Option<LoaderSession>) -> Option<LoaderEvent> {
        match session {
            Some(session) if !session.is_closed() => session.next_event().await,
            _ => std::future::pending().await,
        }
    }

    /// Returns false when the worker should stop
    fn respond(&mut self, response: WorkerResponse) -> bool {
        let frame = match encode(self.outgoing.next_outgoing(), &response) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode worker response: {}", e);
                return true;
            }
        };
        self.responses.send(frame).is_ok()
    }

    fn respond_all(&mut self, responses: Vec<WorkerResponse>) -> bool {
        responses.into_iter().all(|r| self.respond(r))
    }

    fn handle_frame(&mut self, frame: &[u8]) -> bool {
        let command = decode::<WorkerCommand>(frame).and_then(|message| {
            self.incoming.accept(message.sequence_number)?;
            Ok(message.body)
        });

        match command {
            Ok(command) => self.handle_command(command),
            Err(e) => {
                warn!("Rejected worker command: {}", e);
                self.respond(WorkerResponse::Error { source: e.to_string() })
            }
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::Init => {
                self.codec = Some(self.codec_factory.create());
                true
            }
            WorkerCommand::LoadSource { generation } => {
                self.generation = generation;
                self.restart(None)
            }
            WorkerCommand::Seek { source, generation } => {
                self.generation = generation;
                self.restart(Some(source))
            }
            WorkerCommand::Pipe { source } => {
                let consumed = self.feed_piped(source);
                self.respond(WorkerResponse::PipeCallback { source: consumed })
            }
            WorkerCommand::Pause => {
                if let Some(session) = self.session.as_mut() {
                    session.loader_mut().pause();
                }
                true
            }
            WorkerCommand::Resume => {
                if let Some(session) = self.session.as_mut() {
                    session.loader_mut().resume();
                }
                true
            }
            WorkerCommand::Refresh { generation } => {
                if let Some(session) = self.session.as_mut() {
                    session.loader_mut().pause();
                }
                // The new session starts at the file header
                if let Some(codec) = self.codec.as_mut() {
                    codec.seek(&Keyframe::new(0, 0));
                }
                self.generation = generation;
                self.restart(None)
            }
            WorkerCommand::Destroy => false,
        }
    }

    /// Replace the loader session, destroying the old one first
    fn restart(&mut self, keyframe: Option<Keyframe>) -> bool {
        if let Some(old) = self.session.take() {
            old.destroy();
        }

        let opened = match keyframe {
            Some(keyframe) => LoaderSession::open_at(&self.loader_factory, &self.config, keyframe),
            None => LoaderSession::open(&self.loader_factory, &self.config),
        };

        match opened {
            Ok(session) => {
                self.session = Some(session);
                true
            }
            Err(e) => {
                error!("Worker loader failed to start: {}", e);
                self.respond(WorkerResponse::Error { source: e.to_string() })
            }
        }
    }

    fn decode_input(&mut self, data: &[u8], keyframe: Option<Keyframe>) -> (usize, Vec<WorkerResponse>) {
        let codec = self.codec.get_or_insert_with(|| self.codec_factory.create());
        if let Some(keyframe) = &keyframe {
            codec.seek(keyframe);
        }
        let mut output = ResponseOutput {
            generation: self.generation,
            responses: Vec::new(),
        };
        let consumed = codec.set_input(data, &mut output);
        (consumed, output.responses)
    }

    fn feed_piped(&mut self, chunk: PipedChunk) -> usize {
        let (input, start) = if chunk.keyframe.is_some() || self.pipe_stash.is_empty() {
            self.pipe_stash.clear();
            (chunk.data, chunk.byte_start)
        } else {
            self.pipe_stash.extend_from_slice(&chunk.data);
            (self.pipe_stash.split().freeze(), self.pipe_start)
        };

        let (consumed, responses) = self.decode_input(&input, chunk.keyframe);
        if consumed < input.len() {
            self.pipe_stash.extend_from_slice(&input[consumed..]);
            self.pipe_start = start + consumed as u64;
        }
        if self.pipe_stash.len() > MAX_STASH_BYTES {
            self.pipe_stash.clear();
        }
        self.respond_all(responses);
        consumed
    }

    fn handle_loader_event(&mut self, event: LoaderEvent) -> bool {
        match event {
            LoaderEvent::Chunk(chunk) => {
                let Some(session) = self.session.as_mut() else {
                    return true;
                };
                let (input, start, keyframe) = session.take_input(chunk);
                let (consumed, mut responses) = self.decode_input(&input, keyframe);

                if let Some(session) = self.session.as_mut() {
                    session.retain_unconsumed(&input, start, consumed);
                    if session.stashed() > MAX_STASH_BYTES {
                        session.discard_stash();
                        responses.push(WorkerResponse::DemuxError {
                            source: format!("no decodable unit in {} buffered bytes", MAX_STASH_BYTES),
                        });
                    }
                }
                self.respond_all(responses)
            }
            LoaderEvent::Complete => {
                info!("Worker source fully loaded");
                true
            }
            LoaderEvent::Failed(detail) => self.respond(WorkerResponse::Error { source: detail }),
        }
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.destroy();
        }
        self.codec = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FlvCodecFactory;
    use crate::test_support::*;
    use std::time::Duration;

    fn proxy(loaders: &RecordingLoaderFactory) -> WorkerProxy {
        WorkerProxy::spawn(
            SessionConfig::with_source("clip.flv"),
            Arc::new(loaders.clone()),
            Arc::new(FlvCodecFactory),
        )
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    async fn next(proxy: &mut WorkerProxy) -> WorkerResponse {
        tokio::time::timeout(Duration::from_secs(2), proxy.recv())
            .await
            .expect("worker response timed out")
            .expect("worker exited")
            .expect("bad worker frame")
    }

    #[tokio::test]
    async fn test_worker_demuxes_loader_bytes() {
        let loaders = RecordingLoaderFactory::new();
        let mut proxy = proxy(&loaders);
        proxy.post(&WorkerCommand::Init).unwrap();
        proxy.post(&WorkerCommand::LoadSource { generation: 1 }).unwrap();
        wait_until(|| loaders.created() == 1).await;

        let flv = FlvBuilder::indexed_clip(2000, 500, 1000);
        loaders.push(&flv, 0, None).await;

        assert!(matches!(next(&mut proxy).await, WorkerResponse::Metadata { .. }));
        assert!(matches!(next(&mut proxy).await, WorkerResponse::MediaSegmentInit { .. }));
        for expected in [0, 500, 1000, 1500] {
            match next(&mut proxy).await {
                WorkerResponse::MediaSegment { source, generation } => {
                    assert_eq!(source.timestamp_ms, expected);
                    assert_eq!(generation, 1);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_piped_bytes_report_consumed_length() {
        let loaders = RecordingLoaderFactory::new();
        let mut proxy = proxy(&loaders);
        proxy.post(&WorkerCommand::Init).unwrap();

        let flv = FlvBuilder::new().video(0, true, b"frame").build();
        let pipe = |data: &[u8], byte_start: u64| WorkerCommand::Pipe {
            source: PipedChunk {
                data: Bytes::copy_from_slice(data),
                byte_start,
                keyframe: None,
            },
        };

        proxy.post(&pipe(&flv[..20], 0)).unwrap();
        assert_eq!(next(&mut proxy).await, WorkerResponse::PipeCallback { source: FLV_HEADER_LEN });

        // The unconsumed tail is kept by the worker and completed by the next pipe
        proxy.post(&pipe(&flv[20..], 20)).unwrap();
        assert!(matches!(next(&mut proxy).await, WorkerResponse::MediaSegment { .. }));
        assert_eq!(
            next(&mut proxy).await,
            WorkerResponse::PipeCallback {
                source: flv.len() - FLV_HEADER_LEN
            }
        );
        assert_eq!(loaders.created(), 0);
    }

    #[tokio::test]
    async fn test_seek_replaces_loader_in_order() {
        let loaders = RecordingLoaderFactory::new();
        let mut proxy = proxy(&loaders);
        proxy.post(&WorkerCommand::LoadSource { generation: 1 }).unwrap();
        wait_until(|| loaders.created() == 1).await;

        proxy.post(&WorkerCommand::Pause).unwrap();
        proxy
            .post(&WorkerCommand::Seek {
                source: Keyframe::new(4000, 900),
                generation: 2,
            })
            .unwrap();
        wait_until(|| loaders.created() == 2).await;

        assert_eq!(
            loaders.calls(),
            vec![
                LoaderCall::Create(0),
                LoaderCall::Open(0),
                LoaderCall::Pause(0),
                LoaderCall::Destroy(0),
                LoaderCall::Create(1),
                LoaderCall::Seek {
                    id: 1,
                    byte_offset: 900,
                    time_ms: 4000
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_stops_worker_and_loader() {
        let loaders = RecordingLoaderFactory::new();
        let mut proxy = proxy(&loaders);
        proxy.post(&WorkerCommand::LoadSource { generation: 1 }).unwrap();
        proxy.post(&WorkerCommand::Destroy).unwrap();

        let end = tokio::time::timeout(Duration::from_secs(2), proxy.recv()).await.unwrap();
        assert!(end.is_none());
        assert!(proxy.is_closed());
        assert!(loaders.calls().contains(&LoaderCall::Destroy(0)));
        assert!(proxy.post(&WorkerCommand::Resume).is_err());
    }

    #[tokio::test]
    async fn test_loader_start_failure_is_reported() {
        let loaders = RecordingLoaderFactory::new();
        loaders.fail_next_creates(1);
        let mut proxy = proxy(&loaders);
        proxy.post(&WorkerCommand::LoadSource { generation: 1 }).unwrap();

        assert!(matches!(next(&mut proxy).await, WorkerResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_offloaded_transmuxer_end_to_end() {
        use crate::events::TransmuxEvent;
        use crate::transmuxer::Transmuxer;

        let loaders = RecordingLoaderFactory::new();
        let mut config = SessionConfig::with_source("clip.flv");
        config.offload_worker = true;
        let mut t = Transmuxer::new(config, Arc::new(loaders.clone()), Arc::new(FlvCodecFactory)).unwrap();
        assert!(t.is_offloaded());

        let (handler, mut rx) = collector();
        t.subscribe(handler);
        t.load_source().unwrap();
        wait_until(|| loaders.created() == 1).await;

        let flv = FlvBuilder::indexed_clip(4000, 500, 2000);
        loaders.push(&flv, 0, None).await;

        // metadata, init, eight frames
        for _ in 0..10 {
            let arrival = tokio::time::timeout(Duration::from_secs(2), t.next_arrival()).await.unwrap();
            t.handle_arrival(arrival);
        }
        let events = drain(&mut rx);
        assert!(matches!(events[0], TransmuxEvent::Metadata(_)));
        assert_eq!(events.len(), 10);

        let keyframe = t.nearest_keyframe(2500).unwrap();
        assert_eq!(keyframe.time_ms, 2000);
        assert!(t.seek_by_keyframe(keyframe));
        wait_until(|| loaders.created() == 2).await;
        assert_eq!(loaders.calls()[2], LoaderCall::Destroy(0));

        t.destroy();
    }

    #[tokio::test]
    async fn test_offloaded_seek_drops_superseded_segments() {
        use crate::events::TransmuxEvent;
        use crate::transmuxer::Transmuxer;

        let loaders = RecordingLoaderFactory::new();
        let mut config = SessionConfig::with_source("clip.flv");
        config.offload_worker = true;
        let mut t = Transmuxer::new(config, Arc::new(loaders.clone()), Arc::new(FlvCodecFactory)).unwrap();
        let (handler, mut rx) = collector();
        t.subscribe(handler);
        t.load_source().unwrap();
        wait_until(|| loaders.created() == 1).await;

        let flv = FlvBuilder::indexed_clip(4000, 500, 2000);
        loaders.push(&flv, 0, None).await;

        // Only the metadata is taken; init and eight frames stay queued
        let arrival = tokio::time::timeout(Duration::from_secs(2), t.next_arrival()).await.unwrap();
        t.handle_arrival(arrival);
        assert!(matches!(drain(&mut rx).as_slice(), [TransmuxEvent::Metadata(_)]));

        let keyframe = t.nearest_keyframe(2500).unwrap();
        assert!(t.seek_by_keyframe(keyframe));
        wait_until(|| loaders.created() == 2).await;
        let at = keyframe.byte_offset as usize;
        loaders.push(&flv[at..], at as u64, Some(keyframe)).await;

        // init, eight superseded frames, four frames from the keyframe on
        for _ in 0..13 {
            let arrival = tokio::time::timeout(Duration::from_secs(2), t.next_arrival()).await.unwrap();
            t.handle_arrival(arrival);
        }
        let timestamps: Vec<u64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                TransmuxEvent::MediaSegment(m) => Some(m.timestamp_ms),
                _ => None,
            })
            .collect();
        assert_eq!(timestamps, vec![2000, 2500, 3000, 3500]);

        t.destroy();
    }
}
