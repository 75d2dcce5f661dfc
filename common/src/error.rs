use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Bincode encode error: {0}")]
    Encode(String),

    #[error("Bincode decode error: {0}")]
    Decode(String),

    #[error("Worker message out of order: expected {expected}, received {received}")]
    OutOfOrder { expected: u64, received: u64 },

    #[error("Worker channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
