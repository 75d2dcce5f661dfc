use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::errors::ConfigError;

/// Options for one playback session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Run the codec in a separate worker task
    pub offload_worker: bool,

    /// Live source: no lazy-load pausing, autoplay on `CanPlay`
    pub is_live: bool,

    /// Start playback as soon as the sink can play (live only)
    pub autoplay: bool,

    /// Reject direct playback-position writes that bypass the player
    pub lock_playback_position: bool,

    /// Snap seeks inside buffered content onto the nearest keyframe
    pub always_snap_to_keyframe: bool,

    /// Buffered-ahead ceiling in seconds before ingestion is suspended
    pub lazy_load_max_duration: f64,

    /// Ingestion resumes once buffered-ahead falls to this many seconds
    pub lazy_load_recover_duration: f64,

    /// Source location: a file path or `file://` URL
    pub source_url: String,

    /// Bytes per loader read
    pub chunk_size: usize,

    /// Period of the drain poll while ingestion is suspended
    #[serde(serialize_with = "crate::serde_helpers::serialize_duration")]
    #[serde(deserialize_with = "crate::serde_helpers::deserialize_duration")]
    pub poll_interval: Duration,

    /// Loader chunk channel bound
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            offload_worker: false,
            is_live: false,
            autoplay: false,
            lock_playback_position: false,
            always_snap_to_keyframe: false,
            lazy_load_max_duration: 3.0 * 60.0,
            lazy_load_recover_duration: 30.0,
            source_url: String::new(),
            chunk_size: 64 * 1024, // 64KB
            poll_interval: Duration::from_secs(1),
            channel_capacity: 16,
        }
    }
}

impl SessionConfig {
    pub fn with_source(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lazy_load_max_duration <= 0.0 {
            return Err(ConfigError::Invalid {
                message: "lazy_load_max_duration must be greater than 0".to_string(),
            });
        }

        if self.lazy_load_recover_duration <= 0.0 {
            return Err(ConfigError::Invalid {
                message: "lazy_load_recover_duration must be greater than 0".to_string(),
            });
        }

        if self.lazy_load_recover_duration >= self.lazy_load_max_duration {
            return Err(ConfigError::Invalid {
                message: "lazy_load_recover_duration must be less than lazy_load_max_duration".to_string(),
            });
        }

        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                message: "chunk_size must be greater than 0".to_string(),
            });
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                message: "poll_interval must be greater than 0".to_string(),
            });
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "channel_capacity must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    pub level: String,

    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Application configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

/// Configuration manager for loading, saving, and validating configurations
pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            config: AppConfig::default(),
        }
    }

    /// Load configuration from file, writing defaults when it does not exist
    pub async fn load(&mut self) -> Result<(), ConfigError> {
        if !self.config_path.exists() {
            self.save().await?;
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(ConfigError::Read)?;

        self.config = toml::from_str(&content)?;
        self.validate()?;
        Ok(())
    }

    pub async fn save(&self) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(&self.config)?;

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(ConfigError::Write)?;
            }
        }

        tokio::fs::write(&self.config_path, content)
            .await
            .map_err(ConfigError::Write)?;

        Ok(())
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: AppConfig) -> Result<(), ConfigError> {
        self.config = config;
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.session.validate()?;

        if self.config.logging.level.is_empty() {
            return Err(ConfigError::Invalid {
                message: "Log level cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Environment-based configuration override
pub struct EnvConfigOverride;

impl EnvConfigOverride {
    pub fn apply_overrides(config: &mut AppConfig) {
        Self::apply_from(config, |key| std::env::var(key).ok());
    }

    /// Apply overrides read through `lookup`
    pub fn apply_from<F>(config: &mut AppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).map(|v| v.to_lowercase() == "true");
        let seconds = |key: &str| lookup(key).and_then(|v| v.parse::<f64>().ok());

        if let Some(url) = lookup("FLV_PLAYER_SOURCE_URL") {
            config.session.source_url = url;
        }
        if let Some(v) = flag("FLV_PLAYER_OFFLOAD_WORKER") {
            config.session.offload_worker = v;
        }
        if let Some(v) = flag("FLV_PLAYER_IS_LIVE") {
            config.session.is_live = v;
        }
        if let Some(v) = flag("FLV_PLAYER_LOCK_PLAYBACK_POSITION") {
            config.session.lock_playback_position = v;
        }
        if let Some(v) = flag("FLV_PLAYER_ALWAYS_SNAP_TO_KEYFRAME") {
            config.session.always_snap_to_keyframe = v;
        }
        if let Some(v) = seconds("FLV_PLAYER_LAZY_LOAD_MAX_DURATION") {
            config.session.lazy_load_max_duration = v;
        }
        if let Some(v) = seconds("FLV_PLAYER_LAZY_LOAD_RECOVER_DURATION") {
            config.session.lazy_load_recover_duration = v;
        }

        if let Some(level) = lookup("FLV_PLAYER_LOG_LEVEL") {
            config.logging.level = level;
        }
    }
}
