//! Relay wire frame

use crate::error::{Error, Result};

/// One frame on the relay stream
///
/// `seq` is the cumulative count of messages the sender had handed to the
/// stream before this frame; together with the batch it lets a resuming
/// receiver trim overlap and detect gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFrame<M> {
    pub seq: u64,
    pub close: bool,
    pub messages: Vec<M>,
}

/// Receiver-side cursor over a relay stream
///
/// Frames ahead of the cursor mean messages were lost; frames behind overlap
/// a retry and are trimmed so no logical message is emitted twice.
#[derive(Debug, Default)]
pub struct SignalMessageReader {
    seq: u64,
}

impl SignalMessageReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Accept a frame, returning the messages not yet seen
    pub fn read<M>(&mut self, frame: SignalFrame<M>) -> Result<Vec<M>> {
        let mut messages = frame.messages;

        if self.seq < frame.seq {
            return Err(Error::SignalMessageDropped);
        }
        if self.seq > frame.seq {
            let overlap = usize::try_from(self.seq - frame.seq)
                .unwrap_or(usize::MAX)
                .min(messages.len());
            messages.drain(..overlap);
        }
        self.seq += messages.len() as u64;

        Ok(messages)
    }
}
