//! Prometheus metrics context
//!
//! Unlike a process-global registry, the metrics context is constructed
//! explicitly and passed down at construction time. Tests use
//! [`Metrics::disabled`], which backs the same counters with an unregistered
//! (and therefore unexported) registry.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    pub forwarded_packets: IntCounterVec,
    pub forwarded_bytes: IntCounterVec,
    pub dropped_packets: IntCounterVec,
    pub write_errors: IntCounter,
    pub plis_sent: IntCounter,
    pub nacks_received: IntCounter,
    pub publication_errors: IntCounter,
    pub active_down_tracks: IntGauge,
    pub relay_messages: IntCounterVec,
}

/// Metrics context for the forwarding engine and the signal relay
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

impl Metrics {
    /// Create a metrics context registered on the given registry
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let inner = Inner {
            forwarded_packets: register_int_counter_vec_with_registry!(
                "castmux_forwarded_packets_total",
                "RTP packets forwarded to subscribers",
                &["kind"],
                registry.clone()
            )?,
            forwarded_bytes: register_int_counter_vec_with_registry!(
                "castmux_forwarded_bytes_total",
                "RTP bytes forwarded to subscribers",
                &["kind"],
                registry.clone()
            )?,
            dropped_packets: register_int_counter_vec_with_registry!(
                "castmux_dropped_packets_total",
                "RTP packets dropped before egress",
                &["reason"],
                registry.clone()
            )?,
            write_errors: register_int_counter_with_registry!(
                "castmux_write_errors_total",
                "Transport write failures on down tracks",
                registry.clone()
            )?,
            plis_sent: register_int_counter_with_registry!(
                "castmux_plis_sent_total",
                "PLIs issued towards publishers",
                registry.clone()
            )?,
            nacks_received: register_int_counter_with_registry!(
                "castmux_nacks_received_total",
                "NACK requests received from subscribers",
                registry.clone()
            )?,
            publication_errors: register_int_counter_with_registry!(
                "castmux_publication_errors_total",
                "Down tracks escalated after repeated write failures",
                registry.clone()
            )?,
            active_down_tracks: register_int_gauge_with_registry!(
                "castmux_active_down_tracks",
                "Currently registered down tracks",
                registry.clone()
            )?,
            relay_messages: register_int_counter_vec_with_registry!(
                "castmux_relay_messages_total",
                "Signal relay messages by outcome",
                &["outcome"],
                registry.clone()
            )?,
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Metrics context that records into a throwaway registry; used by tests
    /// and tools that don't export metrics
    #[must_use]
    pub fn disabled() -> Self {
        let registry = Registry::new();
        Self::new(&registry).expect("metrics registration on a fresh registry cannot fail")
    }

    pub fn record_forwarded(&self, kind: &str, bytes: usize) {
        self.inner.forwarded_packets.with_label_values(&[kind]).inc();
        self.inner
            .forwarded_bytes
            .with_label_values(&[kind])
            .inc_by(bytes as u64);
    }

    pub fn record_dropped(&self, reason: &str) {
        self.inner.dropped_packets.with_label_values(&[reason]).inc();
    }

    pub fn record_write_error(&self) {
        self.inner.write_errors.inc();
    }

    pub fn record_pli(&self) {
        self.inner.plis_sent.inc();
    }

    pub fn record_nack(&self) {
        self.inner.nacks_received.inc();
    }

    pub fn record_publication_error(&self) {
        self.inner.publication_errors.inc();
    }

    pub fn down_track_added(&self) {
        self.inner.active_down_tracks.inc();
    }

    pub fn down_track_removed(&self) {
        self.inner.active_down_tracks.dec();
    }

    pub fn record_relay_message(&self, outcome: &str) {
        self.inner.relay_messages.with_label_values(&[outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_context_still_counts() {
        let metrics = Metrics::disabled();
        metrics.record_forwarded("video", 1200);
        metrics.record_forwarded("video", 800);
        assert_eq!(
            metrics
                .inner
                .forwarded_packets
                .with_label_values(&["video"])
                .get(),
            2
        );
        assert_eq!(
            metrics.inner.forwarded_bytes.with_label_values(&["video"]).get(),
            2000
        );
    }

    #[test]
    fn two_contexts_do_not_collide() {
        let a = Metrics::disabled();
        let b = Metrics::disabled();
        a.record_pli();
        assert_eq!(a.inner.plis_sent.get(), 1);
        assert_eq!(b.inner.plis_sent.get(), 0);
    }
}
