use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::mpsc;

use flv_player::app::{init_logging, AppBuilder};
use flv_player::codec::FlvCodecFactory;
use flv_player::config::{AppConfig, ConfigManager, EnvConfigOverride};
use flv_player::events::ChannelHandler;
use flv_player::loader::{FileLoaderFactory, LoaderEvent};
use flv_player::transmuxer::{Arrival, Transmuxer};
use flv_player::{PlaybackController, PlayerEvent, TransmuxEvent};

#[derive(Parser, Debug)]
#[command(name = "flv-player", version, about = "FLV transmuxing player with lazy loading")]
struct Cli {
    /// Configuration file, created with defaults when missing
    #[arg(short, long, default_value = "flv_player.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print stream metadata and the keyframe index
    Probe {
        /// Local path or file:// URL
        source: String,
    },
    /// Play against a simulated presentation clock
    Play {
        source: String,

        /// Seek here once metadata is known (seconds)
        #[arg(long)]
        seek: Option<f64>,

        /// Stop after this much playback (seconds)
        #[arg(long)]
        duration: Option<f64>,

        /// Playback rate of the simulated clock
        #[arg(long, default_value_t = 1.0)]
        speed: f64,

        /// Run the transmuxer on a separate worker task
        #[arg(long)]
        offload: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Probe { source } => {
            let config = load_config(&cli.config).await?;
            init_logging(&config.logging);
            probe(config, source).await
        }
        Command::Play {
            source,
            seek,
            duration,
            speed,
            offload,
        } => {
            let mut config = load_config(&cli.config).await?;
            config.session.offload_worker |= offload;
            play(config, source, seek, duration, speed).await
        }
    }
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    let mut manager = ConfigManager::new(path.to_path_buf());
    manager
        .load()
        .await
        .with_context(|| format!("loading configuration from {:?}", path))?;
    let mut config = manager.get_config().clone();
    EnvConfigOverride::apply_overrides(&mut config);
    Ok(config)
}

/// Demux until the first metadata tag or the end of the source
async fn probe(config: AppConfig, source: String) -> Result<()> {
    let mut session = config.session;
    session.source_url = source;
    session.offload_worker = false;

    let mut transmuxer = Transmuxer::new(session, Arc::new(FileLoaderFactory), Arc::new(FlvCodecFactory))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    transmuxer.subscribe(Arc::new(ChannelHandler::new(tx)));
    transmuxer.load_source()?;

    let mut segments = 0u64;
    loop {
        while let Ok(event) = rx.try_recv() {
            match event {
                TransmuxEvent::Metadata(metadata) => {
                    transmuxer.destroy();
                    println!("{}", serde_json::to_string_pretty(&metadata)?);
                    return Ok(());
                }
                TransmuxEvent::MediaSegment(_) | TransmuxEvent::MediaSegmentInit(_) => segments += 1,
                TransmuxEvent::DemuxError { kind, info } => bail!("{}: {}", kind, info),
                TransmuxEvent::Error { kind, detail } => bail!("{:?}: {}", kind, detail),
            }
        }

        match transmuxer.next_arrival().await {
            Arrival::Loader(LoaderEvent::Complete) => break,
            arrival => transmuxer.handle_arrival(arrival),
        }
    }

    transmuxer.destroy();
    println!("No onMetaData tag found ({} segments demuxed)", segments);
    Ok(())
}

async fn play(config: AppConfig, source: String, seek: Option<f64>, duration: Option<f64>, speed: f64) -> Result<()> {
    if !(speed.is_finite() && speed > 0.0) {
        bail!("speed must be a positive number, got {}", speed);
    }

    let mut app = AppBuilder::new()
        .with_config(config)
        .with_source(source)
        .with_env_overrides(false)
        .build()
        .await?;
    let handle = app.handle().clone();
    let clock = app.clock().clone();
    let mut events = app.take_events().context("event stream already taken")?;

    handle.load().await?;

    let tick = Duration::from_millis(100);
    let mut interval = tokio::time::interval(tick);
    let mut pending_seek = seek;
    let mut played = 0.0f64;
    let mut stream_duration: Option<f64> = None;

    let outcome: Result<()> = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                break Ok(());
            }
            Some(event) = events.next() => {
                if let PlayerEvent::Metadata(metadata) = event {
                    stream_duration = Some(metadata.duration);
                    if let Some(target) = pending_seek.take() {
                        handle.seek(target).await?;
                    }
                    handle.play().await?;
                }
            }
            _ = interval.tick() => {
                let before = clock.position();
                let after = clock.advance(tick.as_secs_f64() * speed);
                played += after - before;

                let status = handle.status().await?;
                println!(
                    "position {:>7.2}s  state {:?}  buffered {:?}",
                    status.position,
                    status.state,
                    status.buffered.ranges().iter().map(|r| (r.start, r.end)).collect::<Vec<_>>()
                );

                if duration.is_some_and(|limit| played >= limit) {
                    break Ok(());
                }
                // Within one frame of the end counts as finished
                if stream_duration.is_some_and(|total| total > 0.0 && after >= total - 0.1) {
                    println!("Reached end of stream");
                    break Ok(());
                }
            }
        }
    };

    app.shutdown().await?;
    outcome
}
