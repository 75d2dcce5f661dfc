use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::codec::{CodecFactory, FlvCodecFactory};
use crate::config::{AppConfig, ConfigManager, EnvConfigOverride, LoggingConfig};
use crate::controller::{PlaybackController, Player, PlayerHandle};
use crate::errors::PlayerError;
use crate::events::{ChannelHandler, EventHandler, PlayerEvent};
use crate::loader::{FileLoaderFactory, LoaderFactory};
use crate::sink::{SimulatedClock, SimulatedSink};

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level; a second call leaves the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let json = config.json.then(|| tracing_subscriber::fmt::layer().json());
    let text = (!config.json).then(|| tracing_subscriber::fmt::layer());

    if tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .is_err()
    {
        debug!("Logging already initialised");
    }
}

/// Logs player events
pub struct ConsoleEventHandler;

impl EventHandler<PlayerEvent> for ConsoleEventHandler {
    fn handle_event(&self, event: &PlayerEvent) {
        match event {
            PlayerEvent::Metadata(metadata) => {
                let keyframes = metadata.seekable_index().map(|i| i.len()).unwrap_or(0);
                info!("Metadata: {:.2}s, {} indexed keyframes", metadata.duration, keyframes);
            }
            PlayerEvent::IngestionPaused { position, buffered_end } => {
                info!("Ingestion paused at {:.2}s (buffered to {:?})", position, buffered_end);
            }
            PlayerEvent::IngestionResumed { position } => {
                info!("Ingestion resumed at {:.2}s", position);
            }
            PlayerEvent::SeekCompleted { requested, actual } => {
                info!("Seek to {:.2}s landed on {:.2}s", requested, actual);
            }
            PlayerEvent::Error { kind, detail } => {
                error!("Player error ({:?}): {}", kind, detail);
            }
        }
    }
}

/// Wires configuration, logging and a player running on its own task
pub struct AppBuilder {
    config_path: Option<PathBuf>,
    custom_config: Option<AppConfig>,
    source: Option<String>,
    loader_factory: Option<Arc<dyn LoaderFactory>>,
    codec_factory: Option<Arc<dyn CodecFactory>>,
    event_handlers: Vec<Arc<dyn EventHandler<PlayerEvent>>>,
    enable_env_overrides: bool,
    enable_logging: bool,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config_path: None,
            custom_config: None,
            source: None,
            loader_factory: None,
            codec_factory: None,
            event_handlers: Vec::new(),
            enable_env_overrides: true,
            enable_logging: true,
        }
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.custom_config = Some(config);
        self
    }

    /// Overrides `session.source_url`
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_loader_factory(mut self, factory: Arc<dyn LoaderFactory>) -> Self {
        self.loader_factory = Some(factory);
        self
    }

    pub fn with_codec_factory(mut self, factory: Arc<dyn CodecFactory>) -> Self {
        self.codec_factory = Some(factory);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler<PlayerEvent>>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    pub fn with_env_overrides(mut self, enable: bool) -> Self {
        self.enable_env_overrides = enable;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    /// Load configuration, then spawn the player. Must run inside a Tokio runtime.
    pub async fn build(self) -> Result<PlayerApp, PlayerError> {
        let config = self.load_configuration().await?;
        if self.enable_logging {
            init_logging(&config.logging);
        }
        info!("Initializing player for {}", config.session.source_url);

        let sink = SimulatedSink::new();
        let clock = sink.clock();
        let player = Player::new(
            config.session.clone(),
            self.loader_factory.unwrap_or_else(|| Arc::new(FileLoaderFactory)),
            self.codec_factory.unwrap_or_else(|| Arc::new(FlvCodecFactory)),
            Box::new(sink),
        )?;

        for handler in &self.event_handlers {
            player.subscribe(handler.clone());
        }
        if self.event_handlers.is_empty() {
            player.subscribe(Arc::new(ConsoleEventHandler));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        player.subscribe(Arc::new(ChannelHandler::new(events_tx)));

        let (handle, task) = player.spawn();
        Ok(PlayerApp {
            config,
            handle,
            task: Some(task),
            clock,
            events: Some(events_rx),
        })
    }

    async fn load_configuration(&self) -> Result<AppConfig, PlayerError> {
        let mut config = match &self.custom_config {
            Some(config) => config.clone(),
            None => {
                let path = self.config_path.clone().unwrap_or_else(|| PathBuf::from("flv_player.toml"));
                let mut manager = ConfigManager::new(path);
                manager.load().await?;
                manager.get_config().clone()
            }
        };

        if self.enable_env_overrides {
            EnvConfigOverride::apply_overrides(&mut config);
        }
        if let Some(source) = &self.source {
            config.session.source_url = source.clone();
        }

        config.session.validate()?;
        Ok(config)
    }
}

/// A spawned player with a simulated presentation clock
pub struct PlayerApp {
    config: AppConfig,
    handle: PlayerHandle,
    task: Option<JoinHandle<()>>,
    clock: SimulatedClock,
    events: Option<mpsc::UnboundedReceiver<PlayerEvent>>,
}

impl PlayerApp {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn handle(&self) -> &PlayerHandle {
        &self.handle
    }

    pub fn clock(&self) -> &SimulatedClock {
        &self.clock
    }

    /// Player events as a stream; only the first call gets it
    pub fn take_events(&mut self) -> Option<BoxStream<'static, PlayerEvent>> {
        let rx = self.events.take()?;
        Some(stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        })
        .boxed())
    }

    /// Destroy the player and wait for its task
    pub async fn shutdown(&mut self) -> Result<(), PlayerError> {
        info!("Shutting down player");
        match self.handle.destroy().await {
            Ok(()) | Err(PlayerError::ChannelClosed) => {}
            Err(e) => return Err(e),
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Player task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}
