use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Source not found: {path}")]
    SourceNotFound { path: String },

    #[error("Unsupported source scheme: {url}")]
    UnsupportedScheme { url: String },

    #[error("Seek offset {offset} beyond end of source ({size} bytes)")]
    SeekBeyondEnd { offset: u64, size: u64 },

    #[error("Loader has been destroyed")]
    Destroyed,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Invalid FLV header: {reason}")]
    InvalidHeader { reason: String },

    #[error("Malformed tag at byte {offset}: {reason}")]
    MalformedTag { offset: u64, reason: String },

    #[error("AMF decode error: {reason}")]
    Amf { reason: String },
}

#[derive(Error, Debug)]
pub enum TransmuxError {
    #[error("Stream has no keyframe index and cannot seek")]
    NotSeekable,

    #[error("No active session")]
    NoActiveSession,

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] common::ProtocolError),
}

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Playback position is locked; seek through the player instead (requested {requested}s)")]
    LockedPositionWrite { requested: f64 },

    #[error("No active session")]
    NoActiveSession,

    #[error("Player inbox closed")]
    ChannelClosed,

    #[error("Transmux error: {0}")]
    Transmux(#[from] TransmuxError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write config file: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(LoaderError::SeekBeyondEnd { offset: 10, size: 4 }),
            Box::new(CodecError::MalformedTag { offset: 13, reason: "short".to_string() }),
            Box::new(TransmuxError::NotSeekable),
            Box::new(PlayerError::LockedPositionWrite { requested: 4.5 }),
            Box::new(ConfigError::Invalid { message: "bad".to_string() }),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_conversion_chain() {
        let loader = LoaderError::SourceNotFound { path: "a.flv".to_string() };
        let transmux: TransmuxError = loader.into();
        let player: PlayerError = transmux.into();
        assert!(matches!(player, PlayerError::Transmux(TransmuxError::Loader(_))));
        assert!(player.to_string().contains("a.flv"));
    }
}
