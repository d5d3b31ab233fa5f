//! Error types for the signal relay

use thiserror::Error;

/// Relay error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("signal write failed")]
    SignalWriteFailed,

    #[error("signal message dropped")]
    SignalMessageDropped,

    #[error("stream closed")]
    StreamClosed,

    #[error("channel full")]
    ChannelFull,

    #[error("send timed out")]
    SendTimeout,

    #[error("transient send failure: {0}")]
    Transient(String),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;
