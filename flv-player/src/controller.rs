use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use common::{BufferedRanges, StreamMetadata};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecFactory, FlvCodecFactory};
use crate::config::SessionConfig;
use crate::errors::PlayerError;
use crate::events::{ChannelHandler, ErrorKind, EventEmitter, EventHandler, PlayerEvent, TransmuxEvent};
use crate::loader::{FileLoaderFactory, LoaderFactory};
use crate::sink::{PresentationSink, SinkEvent, SinkNotifier};
use crate::transmuxer::{Arrival, Transmuxer};

/// Backpressure state of the ingestion pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionState {
    /// Loader running, buffer allowed to grow
    Flowing,
    /// Loader paused; the drain poll decides when to resume
    PausedAwaitingDrain,
    /// A seek is being processed; outside position writes are refused
    Seeking,
}

/// Who asked for a seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeekOrigin {
    /// API call; the sink position still has to be written
    Request,
    /// The sink already moved there
    Sink,
}

/// Unechoed position writes kept for matching
const MAX_PENDING_WRITES: usize = 8;

/// Snapshot of the player for callers outside its task
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub state: IngestionState,
    pub position: f64,
    pub buffered: BufferedRanges,
    pub metadata: Option<StreamMetadata>,
}

/// Seconds to the millisecond scale of the keyframe index, floored and
/// clamped at zero
pub fn seconds_to_ms(seconds: f64) -> u64 {
    if seconds.is_nan() || seconds <= 0.0 {
        return 0;
    }
    (seconds * 1000.0).floor() as u64
}

/// Periodic drain check, cancelled on drop
struct DrainPoll {
    generation: u64,
    task: JoinHandle<()>,
}

impl Drop for DrainPoll {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Couples a transmuxer to a presentation sink.
///
/// Forwards segments to the sink, suspends ingestion once enough is buffered
/// ahead of the playback position and resumes it after the buffer drains.
/// Seeks inside buffered content stay in the sink; anything else restarts the
/// loader at the nearest keyframe.
pub struct Player {
    config: SessionConfig,
    loader_factory: Arc<dyn LoaderFactory>,
    codec_factory: Arc<dyn CodecFactory>,
    transmuxer: Option<Transmuxer>,
    sink: Box<dyn PresentationSink>,
    state: IngestionState,
    poll: Option<DrainPoll>,
    poll_generation: u64,
    /// Position writes made by the player whose `Seeking` echo is still due
    pending_writes: VecDeque<f64>,
    metadata: Option<StreamMetadata>,
    events: EventEmitter<PlayerEvent>,
    transmux_tx: mpsc::UnboundedSender<TransmuxEvent>,
    transmux_rx: mpsc::UnboundedReceiver<TransmuxEvent>,
    sink_rx: mpsc::UnboundedReceiver<SinkEvent>,
    poll_tx: mpsc::UnboundedSender<u64>,
    poll_rx: mpsc::UnboundedReceiver<u64>,
}

impl Player {
    pub fn new(
        config: SessionConfig,
        loader_factory: Arc<dyn LoaderFactory>,
        codec_factory: Arc<dyn CodecFactory>,
        mut sink: Box<dyn PresentationSink>,
    ) -> Result<Self, PlayerError> {
        config.validate()?;

        let (transmux_tx, transmux_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        sink.attach(SinkNotifier::new(sink_tx));

        Ok(Self {
            config,
            loader_factory,
            codec_factory,
            transmuxer: None,
            sink,
            state: IngestionState::Flowing,
            poll: None,
            poll_generation: 0,
            pending_writes: VecDeque::new(),
            metadata: None,
            events: EventEmitter::new(),
            transmux_tx,
            transmux_rx,
            sink_rx,
            poll_tx,
            poll_rx,
        })
    }

    /// Player reading local files through the FLV codec
    pub fn with_file_source(config: SessionConfig, sink: Box<dyn PresentationSink>) -> Result<Self, PlayerError> {
        Self::new(config, Arc::new(FileLoaderFactory), Arc::new(FlvCodecFactory), sink)
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<PlayerEvent>>) {
        self.events.subscribe(handler);
    }

    pub fn state(&self) -> IngestionState {
        self.state
    }

    pub fn metadata(&self) -> Option<&StreamMetadata> {
        self.metadata.as_ref()
    }

    pub fn status(&self) -> PlayerStatus {
        PlayerStatus {
            state: self.state,
            position: self.sink.current_time(),
            buffered: self.sink.buffered(),
            metadata: self.metadata.clone(),
        }
    }

    /// Generation of the running drain poll
    pub fn active_poll(&self) -> Option<u64> {
        self.poll.as_ref().map(|p| p.generation)
    }

    /// Create the transmuxer and start loading the source
    pub fn load(&mut self) -> Result<(), PlayerError> {
        if let Some(mut old) = self.transmuxer.take() {
            old.destroy();
        }
        self.cancel_poll();
        self.state = IngestionState::Flowing;

        let mut transmuxer = Transmuxer::new(
            self.config.clone(),
            self.loader_factory.clone(),
            self.codec_factory.clone(),
        )?;
        transmuxer.subscribe(Arc::new(ChannelHandler::new(self.transmux_tx.clone())));
        transmuxer.load_source()?;
        self.transmuxer = Some(transmuxer);
        Ok(())
    }

    pub fn handle_transmux_event(&mut self, event: TransmuxEvent) {
        match event {
            TransmuxEvent::MediaSegmentInit(segment) => self.sink.append_init(segment),
            TransmuxEvent::MediaSegment(segment) => self.sink.append_media(segment),
            TransmuxEvent::Metadata(metadata) => {
                if self.metadata.is_some() {
                    debug!("Ignoring repeated metadata");
                    return;
                }
                self.sink.init(&metadata);
                self.metadata = Some(metadata.clone());
                self.events.emit(PlayerEvent::Metadata(metadata));
            }
            TransmuxEvent::DemuxError { kind, info } => {
                warn!("Demux error {}: {}", kind, info);
                self.events.emit(PlayerEvent::Error {
                    kind: ErrorKind::Decode,
                    detail: format!("{}: {}", kind, info),
                });
            }
            TransmuxEvent::Error { kind, detail } => {
                error!("Transmux error ({:?}): {}", kind, detail);
                self.events.emit(PlayerEvent::Error { kind, detail });
            }
        }
    }

    pub fn handle_sink_event(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::UpdateEnd => self.on_buffer_update(),
            SinkEvent::BufferFull => {
                info!("Sink buffer full");
                self.pause_ingestion();
            }
            SinkEvent::Error(detail) => {
                error!("Sink error: {}", detail);
                if let Some(transmuxer) = self.transmuxer.as_mut() {
                    if let Err(e) = transmuxer.pause() {
                        debug!("Nothing to pause: {}", e);
                    }
                }
                self.events.emit(PlayerEvent::Error {
                    kind: ErrorKind::Sink,
                    detail,
                });
            }
            SinkEvent::CanPlay => {
                if self.config.is_live && self.config.autoplay {
                    info!("Autoplay");
                    self.sink.play();
                }
            }
            SinkEvent::Seeking(position) => {
                if self.absorb_echo(position) {
                    debug!("Absorbed position write echo at {}s", position);
                    return;
                }
                if let Err(e) = self.reconcile(position, SeekOrigin::Sink) {
                    warn!("Seek to {}s failed: {}", position, e);
                }
            }
        }
    }

    /// Suspend ingestion once the range holding the position reaches
    /// `lazy_load_max_duration` beyond it. Live sessions never suspend.
    pub fn on_buffer_update(&mut self) {
        if self.config.is_live || self.transmuxer.is_none() {
            return;
        }

        let position = self.sink.current_time();
        let Some(range) = self.sink.buffered().range_containing(position) else {
            return;
        };

        if range.end >= position + self.config.lazy_load_max_duration && self.poll.is_none() {
            debug!(
                "Buffered to {}s at position {}s, suspending ingestion",
                range.end, position
            );
            self.pause_ingestion();
        }
    }

    /// Drain check; ticks from a cancelled poll are ignored
    pub fn on_poll_tick(&mut self, generation: u64) {
        if self.active_poll() != Some(generation) {
            debug!("Ignoring stale poll tick {}", generation);
            return;
        }

        let position = self.sink.current_time();
        // No range at the position counts as drained
        let drained = match self.sink.buffered().range_containing(position) {
            Some(range) => position >= range.end - self.config.lazy_load_recover_duration,
            None => true,
        };

        if drained {
            self.resume_ingestion();
        }
    }

    /// Pause the loader and start the drain poll. Idempotent.
    pub fn pause_ingestion(&mut self) {
        if self.poll.is_some() {
            return;
        }
        if let Some(transmuxer) = self.transmuxer.as_mut() {
            if let Err(e) = transmuxer.pause() {
                warn!("Failed to pause transmuxer: {}", e);
            }
        }
        self.start_poll();
        self.state = IngestionState::PausedAwaitingDrain;

        let position = self.sink.current_time();
        let buffered_end = self.sink.buffered().range_containing(position).map(|r| r.end);
        info!("Ingestion paused at {}s", position);
        self.events.emit(PlayerEvent::IngestionPaused { position, buffered_end });
    }

    /// Stop the drain poll and resume the loader. Idempotent.
    pub fn resume_ingestion(&mut self) {
        if self.poll.is_none() {
            return;
        }
        self.cancel_poll();
        if let Some(transmuxer) = self.transmuxer.as_mut() {
            if let Err(e) = transmuxer.resume() {
                warn!("Failed to resume transmuxer: {}", e);
            }
        }
        self.sink.resume();
        self.state = IngestionState::Flowing;

        let position = self.sink.current_time();
        info!("Ingestion resumed at {}s", position);
        self.events.emit(PlayerEvent::IngestionResumed { position });
    }

    fn start_poll(&mut self) {
        self.poll_generation += 1;
        let generation = self.poll_generation;
        let ticks = self.poll_tx.clone();
        let period = self.config.poll_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                if ticks.send(generation).is_err() {
                    break;
                }
            }
        });

        self.poll = Some(DrainPoll { generation, task });
    }

    fn cancel_poll(&mut self) {
        if self.poll.take().is_some() {
            debug!("Drain poll cancelled");
        }
    }

    fn write_position(&mut self, seconds: f64) {
        if self.pending_writes.len() == MAX_PENDING_WRITES {
            self.pending_writes.pop_front();
        }
        self.pending_writes.push_back(seconds);
        self.sink.set_current_time(seconds);
    }

    /// True when `position` echoes one of the player's own writes. Older
    /// writes are dropped with it since the sink echoes in order.
    fn absorb_echo(&mut self, position: f64) -> bool {
        let Some(index) = self
            .pending_writes
            .iter()
            .position(|written| (written - position).abs() < 1e-6)
        else {
            return false;
        };
        self.pending_writes.drain(..=index);
        true
    }

    /// Move playback to `seconds` and return the position actually used.
    ///
    /// A non-finite target means the current position.
    pub fn seek(&mut self, seconds: f64) -> Result<f64, PlayerError> {
        self.reconcile(seconds, SeekOrigin::Request)
    }

    fn reconcile(&mut self, seconds: f64, origin: SeekOrigin) -> Result<f64, PlayerError> {
        self.state = IngestionState::Seeking;
        let result = self.seek_locked(seconds, origin);
        self.state = if self.poll.is_some() {
            IngestionState::PausedAwaitingDrain
        } else {
            IngestionState::Flowing
        };
        result
    }

    fn seek_locked(&mut self, seconds: f64, origin: SeekOrigin) -> Result<f64, PlayerError> {
        let target = if seconds.is_finite() {
            seconds.max(0.0)
        } else {
            self.sink.current_time()
        };

        let transmuxer = self.transmuxer.as_mut().ok_or(PlayerError::NoActiveSession)?;

        if self.sink.buffered().contains(target) {
            if self.config.always_snap_to_keyframe {
                if let Some(keyframe) = transmuxer.nearest_keyframe(seconds_to_ms(target)) {
                    let snapped = keyframe.time_secs();
                    debug!("Snapping buffered seek {}s to keyframe {}s", target, snapped);
                    self.write_position(snapped);
                    return Ok(snapped);
                }
            }
            debug!("Seek to {}s served from buffer", target);
            if origin == SeekOrigin::Request {
                self.write_position(target);
            }
            return Ok(target);
        }

        let Some(keyframe) = transmuxer.nearest_keyframe(seconds_to_ms(target)) else {
            warn!("Cannot seek to {}s: stream has no keyframe index", target);
            self.events.emit(PlayerEvent::Error {
                kind: ErrorKind::NotSeekable,
                detail: format!("no keyframe index to seek to {}s", target),
            });
            return Ok(self.sink.current_time());
        };

        transmuxer.pause()?;
        if !transmuxer.seek_by_keyframe(keyframe) {
            self.recover_source();
            return Ok(self.sink.current_time());
        }

        let actual = keyframe.time_secs();
        info!("Seek {}s -> keyframe {}s", target, actual);
        self.sink.seek(actual);
        self.write_position(actual);
        self.cancel_poll();
        self.events.emit(PlayerEvent::SeekCompleted {
            requested: target,
            actual,
        });
        Ok(actual)
    }

    /// The old loader is gone after a failed reposition; reload from the start
    /// so ingestion does not stall.
    fn recover_source(&mut self) {
        warn!("Seek could not reposition the loader, reloading the source");
        if let Err(e) = self.refresh() {
            error!("Failed to reload source: {}", e);
            self.events.emit(PlayerEvent::Error {
                kind: ErrorKind::Loader,
                detail: e.to_string(),
            });
        }
    }

    /// Position write from outside the player
    pub fn set_current_time(&mut self, seconds: f64) -> Result<f64, PlayerError> {
        if self.config.lock_playback_position && self.state != IngestionState::Seeking {
            warn!("Rejected direct position write to {}s", seconds);
            return Err(PlayerError::LockedPositionWrite { requested: seconds });
        }
        self.seek(seconds)
    }

    pub fn play(&mut self) {
        self.sink.play();
    }

    pub fn pause(&mut self) {
        self.sink.pause();
    }

    /// Re-enter seek at the current position
    pub fn resume(&mut self) -> Result<f64, PlayerError> {
        let position = self.sink.current_time();
        self.reconcile(position, SeekOrigin::Sink)
    }

    /// Restart the source from the beginning
    pub fn refresh(&mut self) -> Result<(), PlayerError> {
        let transmuxer = self.transmuxer.as_mut().ok_or(PlayerError::NoActiveSession)?;
        transmuxer.refresh()?;
        self.cancel_poll();
        self.state = IngestionState::Flowing;
        Ok(())
    }

    pub fn destroy(&mut self) {
        self.cancel_poll();
        if let Some(mut transmuxer) = self.transmuxer.take() {
            transmuxer.destroy();
        }
        self.sink.destroy();
        self.events.clear();
        info!("Player destroyed");
    }

    /// Handle every event already queued, without waiting
    pub fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.transmux_rx.try_recv() {
                self.handle_transmux_event(event);
            } else if let Ok(event) = self.sink_rx.try_recv() {
                self.handle_sink_event(event);
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    async fn next_arrival(transmuxer: &mut Option<Transmuxer>) -> Arrival {
        match transmuxer {
            Some(transmuxer) => transmuxer.next_arrival().await,
            None => std::future::pending().await,
        }
    }

    fn handle_arrival(&mut self, arrival: Arrival) {
        if let Some(transmuxer) = self.transmuxer.as_mut() {
            transmuxer.handle_arrival(arrival);
        }
    }

    /// Wait for and handle one event or loader arrival
    pub async fn step(&mut self) {
        tokio::select! {
            biased;
            Some(event) = self.transmux_rx.recv() => self.handle_transmux_event(event),
            Some(event) = self.sink_rx.recv() => self.handle_sink_event(event),
            Some(generation) = self.poll_rx.recv() => self.on_poll_tick(generation),
            arrival = Self::next_arrival(&mut self.transmuxer) => self.handle_arrival(arrival),
        }
    }

    /// Returns false once the player should stop
    fn execute(&mut self, command: PlayerCommand) -> bool {
        match command {
            PlayerCommand::Load(reply) => {
                let _ = reply.send(self.load());
            }
            PlayerCommand::Seek { seconds, reply } => {
                let _ = reply.send(self.seek(seconds));
            }
            PlayerCommand::SetCurrentTime { seconds, reply } => {
                let _ = reply.send(self.set_current_time(seconds));
            }
            PlayerCommand::Play => self.play(),
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::Resume(reply) => {
                let _ = reply.send(self.resume());
            }
            PlayerCommand::Refresh(reply) => {
                let _ = reply.send(self.refresh());
            }
            PlayerCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            PlayerCommand::Destroy(reply) => {
                self.destroy();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn run(mut self, mut commands: mpsc::Receiver<PlayerCommand>) {
        info!("Player task started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.destroy();
                        break;
                    };
                    if !self.execute(command) {
                        break;
                    }
                }
                Some(event) = self.transmux_rx.recv() => self.handle_transmux_event(event),
                Some(event) = self.sink_rx.recv() => self.handle_sink_event(event),
                Some(generation) = self.poll_rx.recv() => self.on_poll_tick(generation),
                arrival = Self::next_arrival(&mut self.transmuxer) => self.handle_arrival(arrival),
            }
        }
        info!("Player task stopped");
    }

    /// Move the player onto its own task and return a handle to drive it.
    ///
    /// The task ends on `destroy` or once every handle is dropped.
    pub fn spawn(self) -> (PlayerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(self.run(rx));
        (PlayerHandle { commands: tx }, task)
    }
}

pub enum PlayerCommand {
    Load(oneshot::Sender<Result<(), PlayerError>>),
    Seek {
        seconds: f64,
        reply: oneshot::Sender<Result<f64, PlayerError>>,
    },
    SetCurrentTime {
        seconds: f64,
        reply: oneshot::Sender<Result<f64, PlayerError>>,
    },
    Play,
    Pause,
    Resume(oneshot::Sender<Result<f64, PlayerError>>),
    Refresh(oneshot::Sender<Result<(), PlayerError>>),
    Status(oneshot::Sender<PlayerStatus>),
    Destroy(oneshot::Sender<()>),
}

/// Playback operations available to the embedding application
#[async_trait]
pub trait PlaybackController: Send + Sync {
    async fn load(&self) -> Result<(), PlayerError>;
    async fn seek(&self, seconds: f64) -> Result<f64, PlayerError>;
    async fn set_current_time(&self, seconds: f64) -> Result<f64, PlayerError>;
    async fn play(&self) -> Result<(), PlayerError>;
    async fn pause(&self) -> Result<(), PlayerError>;
    async fn resume(&self) -> Result<f64, PlayerError>;
    async fn refresh(&self) -> Result<(), PlayerError>;
    async fn status(&self) -> Result<PlayerStatus, PlayerError>;
    async fn destroy(&self) -> Result<(), PlayerError>;
}

/// Cloneable front end to a spawned [`Player`]
#[derive(Clone)]
pub struct PlayerHandle {
    commands: mpsc::Sender<PlayerCommand>,
}

impl PlayerHandle {
    async fn send(&self, command: PlayerCommand) -> Result<(), PlayerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PlayerError::ChannelClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> PlayerCommand) -> Result<T, PlayerError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| PlayerError::ChannelClosed)
    }
}

#[async_trait]
impl PlaybackController for PlayerHandle {
    async fn load(&self) -> Result<(), PlayerError> {
        self.request(PlayerCommand::Load).await?
    }

    async fn seek(&self, seconds: f64) -> Result<f64, PlayerError> {
        self.request(|reply| PlayerCommand::Seek { seconds, reply }).await?
    }

    async fn set_current_time(&self, seconds: f64) -> Result<f64, PlayerError> {
        self.request(|reply| PlayerCommand::SetCurrentTime { seconds, reply }).await?
    }

    async fn play(&self) -> Result<(), PlayerError> {
        self.send(PlayerCommand::Play).await
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        self.send(PlayerCommand::Pause).await
    }

    async fn resume(&self) -> Result<f64, PlayerError> {
        self.request(PlayerCommand::Resume).await?
    }

    async fn refresh(&self) -> Result<(), PlayerError> {
        self.request(PlayerCommand::Refresh).await?
    }

    async fn status(&self) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::Status).await
    }

    async fn destroy(&self) -> Result<(), PlayerError> {
        self.request(PlayerCommand::Destroy).await
    }
}
