//! Ordered, resumable signal relay between castmux nodes
//!
//! Participant signaling messages travel between nodes over a bidirectional
//! stream with retries. The sender ([`SignalMessageSink`]) queues messages
//! and drains them with a single writer task; the receiver
//! ([`SignalMessageReader`]) trims retry overlap by sequence number so every
//! logical message is delivered at most once, in order.

pub mod channel;
pub mod error;
pub mod frame;
pub mod sink;

pub use channel::MessageChannel;
pub use error::{Error, Result};
pub use frame::{SignalFrame, SignalMessageReader};
pub use sink::{SignalMessageSink, SignalSinkParams, SignalStream};

use castmux_core::Metrics;
use tokio::sync::mpsc;

/// Pump incoming frames into a [`MessageChannel`] until the peer closes the
/// stream or an error ends it
pub async fn copy_stream_to_message_channel<M: Send>(
    mut frames: mpsc::Receiver<SignalFrame<M>>,
    channel: &MessageChannel<M>,
    metrics: &Metrics,
) -> Result<()> {
    let mut reader = SignalMessageReader::new();

    while let Some(frame) = frames.recv().await {
        let close = frame.close;

        let messages = match reader.read(frame) {
            Ok(messages) => messages,
            Err(e) => {
                metrics.record_relay_message("failure");
                return Err(e);
            }
        };

        for message in messages {
            if let Err(e) = channel.write_message(message) {
                metrics.record_relay_message("failure");
                return Err(e);
            }
            metrics.record_relay_message("success");
        }

        if close {
            return Ok(());
        }
    }

    Err(Error::StreamClosed)
}
