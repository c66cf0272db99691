//! Error types for teleop-io

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// teleop-io error types
///
/// Only construction and configuration surface these directly. Runtime
/// transport operations log them and return a sentinel instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration could not be written
    #[error("Config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Transport used before `connect` succeeded
    #[error("Transport not connected")]
    NotConnected,

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    Disconnected,

    /// Payload decoded as JSON but is not a key-value mapping
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation not supported
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that mean the stream peer is gone.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Disconnected => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// True for a read that ran out of time without data.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
