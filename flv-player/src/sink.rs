use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use common::{BufferedRanges, InitSegment, MediaSegment, StreamMetadata, TimeRange, TrackType};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Notifications raised by a presentation sink
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// An append finished and the buffered ranges may have changed
    UpdateEnd,
    /// The sink cannot accept more data right now
    BufferFull,
    Error(String),
    /// Enough data is buffered to start playback
    CanPlay,
    /// The playback position was changed to this many seconds
    Seeking(f64),
}

/// Handle a sink uses to report events back to the player
#[derive(Debug, Clone)]
pub struct SinkNotifier {
    sender: mpsc::UnboundedSender<SinkEvent>,
}

impl SinkNotifier {
    pub fn new(sender: mpsc::UnboundedSender<SinkEvent>) -> Self {
        Self { sender }
    }

    pub fn notify(&self, event: SinkEvent) {
        let _ = self.sender.send(event);
    }
}

/// Presentation surface fed by the player.
///
/// Every position write through [`PresentationSink::set_current_time`] must be
/// reported back as [`SinkEvent::Seeking`], the same way user-initiated
/// position changes are.
pub trait PresentationSink: Send {
    fn attach(&mut self, notifier: SinkNotifier);

    /// Stream metadata is known
    fn init(&mut self, metadata: &StreamMetadata);

    fn append_init(&mut self, segment: InitSegment);

    fn append_media(&mut self, segment: MediaSegment);

    fn buffered(&self) -> BufferedRanges;

    /// Playback position in seconds
    fn current_time(&self) -> f64;

    fn set_current_time(&mut self, seconds: f64);

    /// Drop buffered content and restart appends at `seconds`
    fn seek(&mut self, seconds: f64);

    /// Continue appending after ingestion resumes
    fn resume(&mut self) {}

    fn play(&mut self);

    fn pause(&mut self);

    fn destroy(&mut self);
}

/// Frame duration assumed when extending a buffered range past the last sample
const DEFAULT_SAMPLE_DURATION: f64 = 0.04;

/// Samples closer than this join the same range
const DEFAULT_GAP_TOLERANCE: f64 = 0.5;

#[derive(Debug)]
struct SimulatedState {
    ranges: Vec<TimeRange>,
    position: f64,
    playing: bool,
    initialized: HashSet<TrackType>,
    metadata: Option<StreamMetadata>,
    appended: u64,
    can_play_sent: bool,
    destroyed: bool,
}

/// In-memory sink with a simulated playback clock.
///
/// Buffered ranges are derived from appended media timestamps. Playback only
/// advances through buffered content, like a media element that stalls at the
/// end of a range.
#[derive(Debug, Clone)]
pub struct SimulatedSink {
    state: Arc<Mutex<SimulatedState>>,
    notifier: Option<SinkNotifier>,
    sample_duration: f64,
    gap_tolerance: f64,
}

impl Default for SimulatedSink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedState {
                ranges: Vec::new(),
                position: 0.0,
                playing: false,
                initialized: HashSet::new(),
                metadata: None,
                appended: 0,
                can_play_sent: false,
                destroyed: false,
            })),
            notifier: None,
            sample_duration: DEFAULT_SAMPLE_DURATION,
            gap_tolerance: DEFAULT_GAP_TOLERANCE,
        }
    }

    /// Handle for driving the playback clock from outside the player
    pub fn clock(&self) -> SimulatedClock {
        SimulatedClock {
            state: self.state.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn notify(&self, event: SinkEvent) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(event);
        }
    }

    fn insert_range(ranges: &mut Vec<TimeRange>, range: TimeRange, tolerance: f64) {
        ranges.push(range);
        ranges.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
        for r in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end + tolerance => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        *ranges = merged;
    }
}

impl PresentationSink for SimulatedSink {
    fn attach(&mut self, notifier: SinkNotifier) {
        self.notifier = Some(notifier);
    }

    fn init(&mut self, metadata: &StreamMetadata) {
        debug!("Sink initialised: duration {}s", metadata.duration);
        self.lock().metadata = Some(metadata.clone());
    }

    fn append_init(&mut self, segment: InitSegment) {
        self.lock().initialized.insert(segment.track);
        self.notify(SinkEvent::UpdateEnd);
    }

    fn append_media(&mut self, segment: MediaSegment) {
        let start = segment.timestamp_ms as f64 / 1000.0;
        let event = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            if !state.initialized.contains(&segment.track) {
                warn!("{} media at {}s arrived before its init segment", segment.track, start);
                Some(SinkEvent::Error(format!("{} media before init segment", segment.track)))
            } else {
                Self::insert_range(
                    &mut state.ranges,
                    TimeRange::new(start, start + self.sample_duration),
                    self.gap_tolerance,
                );
                state.appended += 1;
                if !state.can_play_sent && state.ranges.iter().any(|r| r.contains(state.position)) {
                    state.can_play_sent = true;
                    None
                } else {
                    Some(SinkEvent::UpdateEnd)
                }
            }
        };

        match event {
            Some(event) => self.notify(event),
            None => {
                self.notify(SinkEvent::UpdateEnd);
                self.notify(SinkEvent::CanPlay);
            }
        }
    }

    fn buffered(&self) -> BufferedRanges {
        BufferedRanges::new(self.lock().ranges.clone())
    }

    fn current_time(&self) -> f64 {
        self.lock().position
    }

    fn set_current_time(&mut self, seconds: f64) {
        self.lock().position = seconds;
        self.notify(SinkEvent::Seeking(seconds));
    }

    fn seek(&mut self, seconds: f64) {
        debug!("Sink discarding buffered content, restarting at {}s", seconds);
        let mut state = self.lock();
        state.ranges.clear();
        state.can_play_sent = false;
    }

    fn play(&mut self) {
        self.lock().playing = true;
    }

    fn pause(&mut self) {
        self.lock().playing = false;
    }

    fn destroy(&mut self) {
        let mut state = self.lock();
        state.destroyed = true;
        state.playing = false;
        state.ranges.clear();
    }
}

/// Drives a [`SimulatedSink`]'s playback position
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedClock {
    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Advance playback by `seconds`, stopping at the end of the current range.
    ///
    /// Returns the new position.
    pub fn advance(&self, seconds: f64) -> f64 {
        let mut state = self.lock();
        if !state.playing {
            return state.position;
        }
        let position = state.position;
        if let Some(range) = state.ranges.iter().find(|r| r.contains(position)).copied() {
            state.position = (position + seconds).min(range.end);
        }
        state.position
    }

    pub fn position(&self) -> f64 {
        self.lock().position
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn appended_segments(&self) -> u64 {
        self.lock().appended
    }

    pub fn duration(&self) -> Option<f64> {
        self.lock().metadata.as_ref().map(|m| m.duration)
    }

    pub fn buffered(&self) -> BufferedRanges {
        BufferedRanges::new(self.lock().ranges.clone())
    }
}
