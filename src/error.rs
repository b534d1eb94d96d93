//! Error types for raycore

use thiserror::Error;

/// Main error type for raycore
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The identity token did not match any user inside the time window.
    #[error("Invalid user")]
    InvalidUser,

    #[error("Invalid protocol version: {0}")]
    InvalidVersion(u8),

    /// Checksum mismatch or malformed header field.
    #[error("Corrupted packet")]
    CorruptedPacket,

    /// The response header did not echo the byte the client sent.
    #[error("Invalid response header")]
    InvalidResponse,

    #[error("No rule applicable")]
    NoRuleApplicable,

    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    #[error("Command too large: {0} bytes")]
    CommandTooLarge(usize),

    #[error("Buffer overflow: need {requested} bytes, {available} available")]
    BufferOverflow { requested: usize, available: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Retry failed after {0} attempts")]
    RetryFailed(usize),
}

impl Error {
    /// Errors produced while authenticating or parsing a request header.
    ///
    /// These never cause anything to be written back to the peer.
    pub fn is_header_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidUser | Error::InvalidVersion(_) | Error::CorruptedPacket
        )
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Result type alias for raycore
pub type Result<T> = std::result::Result<T, Error>;
