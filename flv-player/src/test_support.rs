//! Fixtures shared by the unit and integration test modules

use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes};
use common::{BufferedRanges, InitSegment, MediaSegment, StreamMetadata, TimeRange, TrackType};
use tokio::sync::mpsc;

use crate::codec::amf::encode;
use crate::codec::CodecOutput;
use crate::config::SessionConfig;
use crate::errors::{CodecError, LoaderError};
use crate::loader::{Chunk, Loader, LoaderEvent, LoaderFactory, LoaderSender};
use crate::sink::{PresentationSink, SinkEvent, SinkNotifier};

pub const FLV_HEADER_LEN: usize = 13;

/// Writes FLV byte streams tag by tag
#[derive(Debug, Default, Clone)]
pub struct FlvBuilder {
    tags: Vec<u8>,
}

impl FlvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_tag(mut self, tag_type: u8, timestamp_ms: u32, body: &[u8]) -> Self {
        let ts = timestamp_ms.to_be_bytes();
        let len = (body.len() as u32).to_be_bytes();
        self.tags.put_u8(tag_type);
        self.tags.put_slice(&len[1..]);
        self.tags.put_slice(&[ts[1], ts[2], ts[3], ts[0]]);
        self.tags.put_slice(&[0, 0, 0]);
        self.tags.put_slice(body);
        self.tags.put_u32(11 + body.len() as u32);
        self
    }

    /// `onMetaData`; an empty `times` leaves out the keyframe index
    pub fn metadata(self, duration: f64, times: &[f64], positions: &[u64]) -> Self {
        let mut body = Vec::new();
        encode::string(&mut body, "onMetaData");
        encode::ecma_start(&mut body, 2);
        encode::key(&mut body, "duration");
        encode::number(&mut body, duration);
        if !times.is_empty() {
            let positions: Vec<f64> = positions.iter().map(|p| *p as f64).collect();
            encode::key(&mut body, "keyframes");
            encode::object_start(&mut body);
            encode::key(&mut body, "times");
            encode::numbers(&mut body, times);
            encode::key(&mut body, "filepositions");
            encode::numbers(&mut body, &positions);
            encode::object_end(&mut body);
        }
        encode::object_end(&mut body);
        self.raw_tag(18, 0, &body)
    }

    pub fn video_config(self, config: &[u8]) -> Self {
        let mut body = vec![0x17, 0, 0, 0, 0];
        body.extend_from_slice(config);
        self.raw_tag(9, 0, &body)
    }

    pub fn audio_config(self, config: &[u8]) -> Self {
        let mut body = vec![0xAF, 0];
        body.extend_from_slice(config);
        self.raw_tag(8, 0, &body)
    }

    pub fn video(self, timestamp_ms: u32, keyframe: bool, payload: &[u8]) -> Self {
        let frame_type = if keyframe { 0x10 } else { 0x20 };
        let mut body = vec![frame_type | 7, 1, 0, 0, 0];
        body.extend_from_slice(payload);
        self.raw_tag(9, timestamp_ms, &body)
    }

    pub fn audio(self, timestamp_ms: u32, payload: &[u8]) -> Self {
        let mut body = vec![0xAF, 1];
        body.extend_from_slice(payload);
        self.raw_tag(8, timestamp_ms, &body)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FLV_HEADER_LEN + self.tags.len());
        out.put_slice(b"FLV");
        out.put_u8(1);
        out.put_u8(0x05);
        out.put_u32(9);
        out.put_u32(0);
        out.put_slice(&self.tags);
        out
    }

    /// Byte offset of every tag in a built stream
    pub fn tag_offsets(flv: &[u8]) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut pos = FLV_HEADER_LEN;
        while pos + 11 <= flv.len() {
            offsets.push(pos);
            let len = u32::from_be_bytes([0, flv[pos + 1], flv[pos + 2], flv[pos + 3]]) as usize;
            pos += 11 + len + 4;
        }
        offsets
    }

    /// A video-only clip whose metadata indexes every keyframe at its real byte offset
    pub fn indexed_clip(duration_ms: u32, frame_ms: u32, keyframe_every_ms: u32) -> Vec<u8> {
        let frames: Vec<(u32, bool)> = (0..duration_ms / frame_ms)
            .map(|i| {
                let ts = i * frame_ms;
                (ts, ts % keyframe_every_ms == 0)
            })
            .collect();
        let key_times: Vec<f64> = frames
            .iter()
            .filter(|(_, key)| *key)
            .map(|(ts, _)| *ts as f64 / 1000.0)
            .collect();

        let assemble = |positions: &[u64]| {
            let mut builder = FlvBuilder::new()
                .metadata(duration_ms as f64 / 1000.0, &key_times, positions)
                .video_config(b"avcC");
            for (ts, key) in &frames {
                builder = builder.video(*ts, *key, &ts.to_be_bytes());
            }
            builder.build()
        };

        // Offsets do not change the metadata length, so a placeholder pass locates the tags
        let placeholders = vec![0u64; key_times.len()];
        let draft = assemble(placeholders.as_slice());
        let offsets = Self::tag_offsets(&draft);
        let positions: Vec<u64> = frames
            .iter()
            .zip(offsets.iter().skip(2))
            .filter(|((_, key), _)| *key)
            .map(|(_, offset)| *offset as u64)
            .collect();
        assemble(positions.as_slice())
    }
}

/// Collects codec output in arrival order
#[derive(Debug, Default)]
pub struct CollectedOutput {
    pub init_segments: Vec<(Option<Bytes>, Option<Bytes>)>,
    pub media_segments: Vec<(TrackType, u64, Bytes)>,
    pub errors: Vec<CodecError>,
    pub metadata: Vec<StreamMetadata>,
}

impl CodecOutput for CollectedOutput {
    fn on_init_segment(&mut self, video: Option<Bytes>, audio: Option<Bytes>) {
        self.init_segments.push((video, audio));
    }

    fn on_media_segment(&mut self, track: TrackType, timestamp_ms: u64, data: Bytes) {
        self.media_segments.push((track, timestamp_ms, data));
    }

    fn on_error(&mut self, error: CodecError) {
        self.errors.push(error);
    }

    fn on_metadata(&mut self, metadata: StreamMetadata) {
        self.metadata.push(metadata);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoaderCall {
    Create(usize),
    Open(usize),
    Pause(usize),
    Resume(usize),
    Seek { id: usize, byte_offset: u64, time_ms: u64 },
    Destroy(usize),
}

/// Loader factory whose loaders only record calls; tests push chunks by hand
#[derive(Clone, Default)]
pub struct RecordingLoaderFactory {
    pub calls: Arc<Mutex<Vec<LoaderCall>>>,
    senders: Arc<Mutex<Vec<LoaderSender>>>,
    /// Number of upcoming `create` calls that fail
    fail_creates: Arc<Mutex<usize>>,
}

impl RecordingLoaderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_creates(&self, count: usize) {
        *self.fail_creates.lock().unwrap() = count;
    }

    pub fn calls(&self) -> Vec<LoaderCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    pub fn count(&self, pred: impl Fn(&LoaderCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    /// Deliver bytes through the most recently created loader
    pub async fn push(&self, data: &[u8], byte_start: u64, keyframe: Option<common::Keyframe>) {
        let sender = self.senders.lock().unwrap().last().cloned().expect("no loader created");
        let chunk = Chunk {
            data: Bytes::copy_from_slice(data),
            byte_start,
            keyframe,
        };
        sender.send(LoaderEvent::Chunk(chunk)).await.unwrap();
    }

    pub async fn push_event(&self, event: LoaderEvent) {
        let sender = self.senders.lock().unwrap().last().cloned().expect("no loader created");
        sender.send(event).await.unwrap();
    }
}

struct RecordingLoader {
    id: usize,
    calls: Arc<Mutex<Vec<LoaderCall>>>,
    paused: bool,
}

impl RecordingLoader {
    fn record(&self, call: LoaderCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Loader for RecordingLoader {
    fn open(&mut self) -> Result<(), LoaderError> {
        self.record(LoaderCall::Open(self.id));
        Ok(())
    }

    fn pause(&mut self) {
        self.paused = true;
        self.record(LoaderCall::Pause(self.id));
    }

    fn resume(&mut self) {
        self.paused = false;
        self.record(LoaderCall::Resume(self.id));
    }

    fn seek(&mut self, byte_offset: u64, _reset: bool, time_ms: u64) -> Result<(), LoaderError> {
        self.record(LoaderCall::Seek {
            id: self.id,
            byte_offset,
            time_ms,
        });
        Ok(())
    }

    fn destroy(&mut self) {
        self.record(LoaderCall::Destroy(self.id));
    }

    fn is_paused(&self) -> bool {
        self.paused
    }
}

impl LoaderFactory for RecordingLoaderFactory {
    fn create(&self, _config: &SessionConfig, events: LoaderSender) -> Result<Box<dyn Loader>, LoaderError> {
        let mut failing = self.fail_creates.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(LoaderError::SourceNotFound {
                path: "unavailable".to_string(),
            });
        }
        let mut senders = self.senders.lock().unwrap();
        let id = senders.len();
        senders.push(events);
        self.calls.lock().unwrap().push(LoaderCall::Create(id));
        Ok(Box::new(RecordingLoader {
            id,
            calls: self.calls.clone(),
            paused: false,
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Init,
    AppendInit,
    AppendMedia(u64),
    SetCurrentTime(f64),
    Seek(f64),
    Resume,
    Play,
    Pause,
    Destroy,
}

#[derive(Default)]
pub struct ScriptedSinkState {
    pub calls: Vec<SinkCall>,
    pub buffered: Vec<(f64, f64)>,
    pub position: f64,
}

/// Sink with test-controlled buffered ranges and position.
///
/// Position writes are echoed as `Seeking`, like a media element would.
#[derive(Clone, Default)]
pub struct ScriptedSink {
    pub state: Arc<Mutex<ScriptedSinkState>>,
    notifier: Arc<Mutex<Option<SinkNotifier>>>,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_buffered(&self, ranges: Vec<(f64, f64)>) {
        self.state.lock().unwrap().buffered = ranges;
    }

    pub fn set_position(&self, seconds: f64) {
        self.state.lock().unwrap().position = seconds;
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn position_writes(&self) -> Vec<f64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::SetCurrentTime(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn notify(&self, event: SinkEvent) {
        if let Some(notifier) = self.notifier.lock().unwrap().as_ref() {
            notifier.notify(event);
        }
    }

    fn record(&self, call: SinkCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl PresentationSink for ScriptedSink {
    fn attach(&mut self, notifier: SinkNotifier) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    fn init(&mut self, _metadata: &StreamMetadata) {
        self.record(SinkCall::Init);
    }

    fn append_init(&mut self, _segment: InitSegment) {
        self.record(SinkCall::AppendInit);
    }

    fn append_media(&mut self, segment: MediaSegment) {
        self.record(SinkCall::AppendMedia(segment.timestamp_ms));
    }

    fn buffered(&self) -> BufferedRanges {
        let state = self.state.lock().unwrap();
        BufferedRanges::new(state.buffered.iter().map(|(s, e)| TimeRange::new(*s, *e)).collect())
    }

    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().position
    }

    fn set_current_time(&mut self, seconds: f64) {
        self.record(SinkCall::SetCurrentTime(seconds));
        self.state.lock().unwrap().position = seconds;
        self.notify(SinkEvent::Seeking(seconds));
    }

    fn seek(&mut self, seconds: f64) {
        self.record(SinkCall::Seek(seconds));
        self.state.lock().unwrap().buffered.clear();
    }

    fn resume(&mut self) {
        self.record(SinkCall::Resume);
    }

    fn play(&mut self) {
        self.record(SinkCall::Play);
    }

    fn pause(&mut self) {
        self.record(SinkCall::Pause);
    }

    fn destroy(&mut self) {
        self.record(SinkCall::Destroy);
    }
}

/// Collects events from an emitter subscription
pub fn collector<E: Clone + Send + 'static>() -> (
    Arc<dyn crate::events::EventHandler<E>>,
    mpsc::UnboundedReceiver<E>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(crate::events::ChannelHandler::new(tx)), rx)
}

pub fn drain<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> Vec<E> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
