//! Bounded in-process message channel
//!
//! Adapts the relay reader to a consumer: the stream pump writes decoded
//! messages in, the session logic reads them out. The bound comes from
//! `signal_relay.stream_buffer_size`.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct MessageChannel<M> {
    tx: Mutex<Option<mpsc::Sender<M>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<M>>,
}

impl<M: Send> MessageChannel<M> {
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Queue a message for the consumer; fails fast when the consumer lags
    /// behind the configured bound or the channel is closed
    pub fn write_message(&self, message: M) -> Result<()> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(Error::StreamClosed);
        };

        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::ChannelFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::StreamClosed),
        }
    }

    /// Next message, or `None` after close once the queue drained
    pub async fn read_message(&self) -> Option<M> {
        self.rx.lock().await.recv().await
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}
