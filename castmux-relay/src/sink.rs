//! Sending side of the relay
//!
//! Messages are queued in memory and drained by a single writer task. Send
//! failures retry with exponentially growing attempt timeouts until
//! `retry_timeout` passes without a success, at which point the queue is
//! discarded and the stream is closed with [`Error::SignalWriteFailed`].

use crate::error::{Error, Result};
use crate::frame::SignalFrame;
use async_trait::async_trait;
use castmux_core::config::SignalRelayConfig;
use castmux_core::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Transport seam of the relay: a bidirectional stream towards a peer node
#[async_trait]
pub trait SignalStream<M>: Send + Sync {
    /// Ship one frame; must return within `timeout`
    async fn send(&self, frame: SignalFrame<M>, timeout: Duration) -> Result<()>;

    /// Terminal state of the stream, if any
    fn err(&self) -> Option<Error>;

    /// Cancelled once the stream is fully torn down (both directions)
    fn context(&self) -> CancellationToken;

    async fn close(&self, err: Option<Error>);
}

pub struct SignalSinkParams<M> {
    pub stream: Arc<dyn SignalStream<M>>,
    pub config: SignalRelayConfig,
    /// Close the stream with `SignalWriteFailed` after giving up
    pub close_on_failure: bool,
    /// Block `close()` until the stream context ends; used where departing
    /// messages must not be lost
    pub block_on_close: bool,
    pub metrics: Metrics,
}

struct State<M> {
    seq: u64,
    queue: Vec<M>,
    writing: bool,
    draining: bool,
}

pub struct SignalMessageSink<M> {
    stream: Arc<dyn SignalStream<M>>,
    config: SignalRelayConfig,
    close_on_failure: bool,
    block_on_close: bool,
    metrics: Metrics,
    state: Mutex<State<M>>,
}

impl<M: Clone + Send + 'static> SignalMessageSink<M> {
    #[must_use]
    pub fn new(params: SignalSinkParams<M>) -> Arc<Self> {
        Arc::new(Self {
            stream: params.stream,
            config: params.config,
            close_on_failure: params.close_on_failure,
            block_on_close: params.block_on_close,
            metrics: params.metrics,
            state: Mutex::new(State {
                seq: 0,
                queue: Vec::new(),
                writing: false,
                draining: false,
            }),
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stream.err().is_some()
    }

    /// Queue a message; the writer task is started on demand
    pub fn write_message(self: &Arc<Self>, message: M) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(err) = self.stream.err() {
            return Err(err);
        }
        if state.draining {
            return Err(Error::StreamClosed);
        }

        state.queue.push(message);
        if !state.writing {
            state.writing = true;
            let sink = self.clone();
            tokio::spawn(async move { sink.write().await });
        }
        Ok(())
    }

    /// Drain and close. With `block_on_close` the call returns only when the
    /// stream context has ended, so queued departure notifications make it
    /// out before the owner tears the connection down.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.draining = true;
            if !state.writing {
                state.writing = true;
                let sink = self.clone();
                tokio::spawn(async move { sink.write().await });
            }
        }

        if self.block_on_close {
            self.stream.context().cancelled().await;
        }
    }

    async fn write(self: Arc<Self>) {
        let mut interval = self.config.min_retry_interval();
        let mut deadline = Instant::now() + self.config.retry_timeout();
        let mut send_err: Option<Error> = None;

        loop {
            let (frame, batch_len, closing) = {
                let mut state = self.state.lock();
                let closing = state.draining;
                if (!closing && state.queue.is_empty()) || self.is_closed() {
                    state.writing = false;
                    break;
                }
                (
                    SignalFrame {
                        seq: state.seq,
                        close: closing,
                        messages: state.queue.clone(),
                    },
                    state.queue.len(),
                    closing,
                )
            };

            match self.stream.send(frame, interval).await {
                Err(e) => {
                    self.metrics.record_relay_message("failure");
                    if Instant::now() >= deadline {
                        warn!(error = %e, dropped = batch_len, "could not send signal message");
                        send_err = Some(e);
                        let mut state = self.state.lock();
                        let dropped = state.queue.len() as u64;
                        state.seq += dropped;
                        state.queue.clear();
                        state.writing = false;
                        break;
                    }
                    interval = (interval * 2).min(self.config.max_retry_interval());
                }
                Ok(()) => {
                    for _ in 0..batch_len {
                        self.metrics.record_relay_message("success");
                    }
                    interval = self.config.min_retry_interval();
                    deadline = Instant::now() + self.config.retry_timeout();

                    let mut state = self.state.lock();
                    state.seq += batch_len as u64;
                    state.queue.drain(..batch_len);
                    if closing {
                        state.writing = false;
                        break;
                    }
                }
            }
        }

        let draining = self.state.lock().draining;
        if draining {
            self.stream.close(None).await;
        }
        if send_err.is_some() && self.close_on_failure {
            self.stream.close(Some(Error::SignalWriteFailed)).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MockStream;
    use super::*;
    use crate::frame::SignalMessageReader;

    fn config() -> SignalRelayConfig {
        SignalRelayConfig::default()
    }

    fn sink_with(
        stream: Arc<MockStream<String>>,
        config: SignalRelayConfig,
        block_on_close: bool,
    ) -> Arc<SignalMessageSink<String>> {
        SignalMessageSink::new(SignalSinkParams {
            stream,
            config,
            close_on_failure: true,
            block_on_close,
            metrics: Metrics::disabled(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_and_preserves_order() {
        let stream = MockStream::new(1);
        let sink = sink_with(stream.clone(), config(), false);

        // queued before the writer task runs, so the failing first attempt
        // already carries the whole batch
        sink.write_message("join".to_string()).unwrap();
        sink.write_message("offer".to_string()).unwrap();
        sink.write_message("answer".to_string()).unwrap();

        for _ in 0..50 {
            tokio::task::yield_now().await;
            if !stream.frames.lock().is_empty() {
                break;
            }
        }

        let frames = stream.frames.lock().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 0);
        assert!(!frames[0].close);
        assert_eq!(frames[0].messages, vec!["join", "offer", "answer"]);

        // the peer observes exactly three messages, in order
        let mut reader = SignalMessageReader::new();
        let delivered = reader.read(frames[0].clone()).unwrap();
        assert_eq!(delivered, vec!["join", "offer", "answer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn seq_advances_across_batches() {
        let stream = MockStream::new(0);
        let sink = sink_with(stream.clone(), config(), false);

        sink.write_message("a".to_string()).unwrap();
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if stream.frames.lock().len() == 1 {
                break;
            }
        }
        sink.write_message("b".to_string()).unwrap();
        sink.write_message("c".to_string()).unwrap();
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if stream.frames.lock().len() >= 2 {
                break;
            }
        }

        let frames = stream.frames.lock().clone();
        assert_eq!(frames[0].seq, 0);
        assert_eq!(frames[1].seq, 1);

        let mut reader = SignalMessageReader::new();
        let mut all = Vec::new();
        for frame in frames {
            all.extend(reader.read(frame).unwrap());
        }
        assert_eq!(all, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_timeout_and_closes_the_stream() {
        let stream = MockStream::new(u32::MAX);
        let mut config = config();
        config.retry_timeout_ms = 0;
        let sink = sink_with(stream.clone(), config, false);

        sink.write_message("doomed".to_string()).unwrap();

        for _ in 0..50 {
            tokio::task::yield_now().await;
            if stream.closed_with.lock().is_some() {
                break;
            }
        }

        assert_eq!(
            stream.closed_with.lock().clone(),
            Some(Some(Error::SignalWriteFailed))
        );
        // late writers observe the stream error
        assert!(sink.write_message("late".to_string()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_blocks_until_the_stream_context_ends() {
        let stream = MockStream::new(0);
        let sink = sink_with(stream.clone(), config(), true);

        sink.write_message("leave".to_string()).unwrap();

        let closer = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.close().await })
        };

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(!closer.is_finished());
        // the drain sent everything with the close flag
        let frames = stream.frames.lock().clone();
        assert!(frames.iter().any(|f| f.close));

        stream.context.cancel();
        closer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn draining_sink_rejects_new_messages() {
        let stream = MockStream::new(0);
        let sink = sink_with(stream.clone(), config(), false);

        sink.write_message("a".to_string()).unwrap();
        sink.close().await;
        assert_eq!(
            sink.write_message("b".to_string()).unwrap_err(),
            Error::StreamClosed
        );
    }
}
