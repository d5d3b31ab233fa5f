//! Error types for the forwarding engine

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("receiver closed")]
    ReceiverClosed,

    #[error("buffer closed")]
    BufferClosed,

    #[error("buffer not found for layer {0}")]
    BufferNotFound(i32),

    #[error("packet not found")]
    PacketNotFound,

    #[error("packet too old")]
    PacketTooOld,

    #[error("duplicate packet")]
    DuplicatePacket,

    #[error("padding only packet")]
    PaddingOnlyPacket,

    #[error("out of order packet, cache only sequence number offset")]
    OutOfOrderSequenceNumberCacheOnly,

    #[error("down track not bound")]
    NotBound,

    #[error("invalid layer, target: {target}, reference: {reference}")]
    InvalidLayer { target: i32, reference: i32 },

    #[error("rtcp sender report not available for layer {0}")]
    SenderReportNotAvailable(i32),

    #[error("red payload does not have enough space, need {0} bytes")]
    RedPayloadTooLarge(usize),

    #[error("malformed red payload: {0}")]
    MalformedRedPayload(&'static str),

    #[error("malformed rtp packet")]
    MalformedPacket,

    #[error("transport write failed: {0}")]
    WriteFailed(String),
}

/// Result type for forwarding operations
pub type Result<T> = std::result::Result<T, Error>;
