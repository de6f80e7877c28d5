use thiserror::Error;

/// Crate-wide error type
///
/// Every variant carries a context string identifying the operation that
/// failed, so FFI callers get a single printable line per failure.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Transport connect failed: {0}")]
    TransportConnect(String),

    #[error("Transport write failed: {0}")]
    TransportWrite(String),

    #[error("Protocol negotiation failed: {0}")]
    ProtocolNegotiation(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Upstream callback error: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, SinkError>;
