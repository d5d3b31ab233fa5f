//! Fan-out from a receiver to its down tracks
//!
//! The down-track map is guarded by a read-write lock; broadcasts read a
//! shadow slice rebuilt on every mutation so the hot path takes no lock
//! beyond cloning an `Arc`. Large packet fan-outs can be split into chunks
//! of two spread across tokio workers, which amortizes dispatch overhead
//! against the per-track write cost.

use crate::buffer::RtcpSenderReportData;
use crate::error::Result;
use crate::packet::ExtPacket;
use crate::types::Bitrates;
use castmux_core::SubscriberId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Write side of a subscriber's track, as seen by receivers and the spreader
pub trait TrackSender: Send + Sync {
    fn subscriber_id(&self) -> SubscriberId;

    fn write_rtp(&self, ext_pkt: &ExtPacket, spatial_layer: i32) -> Result<()>;

    fn close(&self);

    fn up_track_layers_change(&self) {}

    fn up_track_max_published_layer_change(&self, _max_published_layer: i32) {}

    fn up_track_max_temporal_layer_seen_change(&self, _max_temporal_layer_seen: i32) {}

    fn up_track_bitrate_report(&self, _available_layers: &[i32], _bitrates: Bitrates) {}

    fn handle_rtcp_sender_report(&self, _payload_type: u8, _layer: i32, _sr: &RtcpSenderReportData) {}
}

/// Per-broadcast work unit when the parallel path engages
const PARALLEL_CHUNK: usize = 2;

struct Inner {
    down_tracks: HashMap<SubscriberId, Arc<dyn TrackSender>>,
    shadow: Arc<Vec<Arc<dyn TrackSender>>>,
}

impl Inner {
    fn rebuild_shadow(&mut self) {
        self.shadow = Arc::new(self.down_tracks.values().cloned().collect());
    }
}

pub struct DownTrackSpreader {
    threshold: usize,
    inner: RwLock<Inner>,
}

impl DownTrackSpreader {
    /// `threshold` of 0 disables the parallel path
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            inner: RwLock::new(Inner {
                down_tracks: HashMap::new(),
                shadow: Arc::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn down_tracks(&self) -> Arc<Vec<Arc<dyn TrackSender>>> {
        self.inner.read().shadow.clone()
    }

    /// Atomically clear the set and return what was registered; used on close
    #[must_use]
    pub fn reset_and_get_down_tracks(&self) -> Arc<Vec<Arc<dyn TrackSender>>> {
        let mut inner = self.inner.write();
        let shadow = inner.shadow.clone();
        inner.down_tracks = HashMap::new();
        inner.shadow = Arc::new(Vec::new());
        shadow
    }

    /// Register a sender, replacing any prior one for the same subscriber
    pub fn store(&self, sender: Arc<dyn TrackSender>) {
        let mut inner = self.inner.write();
        inner.down_tracks.insert(sender.subscriber_id(), sender);
        inner.rebuild_shadow();
    }

    pub fn free(&self, subscriber_id: &SubscriberId) {
        let mut inner = self.inner.write();
        inner.down_tracks.remove(subscriber_id);
        inner.rebuild_shadow();
    }

    #[must_use]
    pub fn has_down_track(&self, subscriber_id: &SubscriberId) -> bool {
        self.inner.read().down_tracks.contains_key(subscriber_id)
    }

    #[must_use]
    pub fn down_track_count(&self) -> usize {
        self.inner.read().shadow.len()
    }

    /// Apply `writer` to every registered sender in turn; used for
    /// control-plane notifications, which are rare enough to run inline
    pub fn broadcast<F>(&self, writer: F)
    where
        F: Fn(&Arc<dyn TrackSender>),
    {
        for dt in self.down_tracks().iter() {
            writer(dt);
        }
    }

    /// Write one packet to every registered sender. Below the threshold the
    /// writes run inline; above it they are split into chunks across tokio
    /// workers and awaited before returning, so every subscriber still sees
    /// packets in source order. No cross-subscriber ordering.
    pub async fn broadcast_packet(&self, ext_pkt: &ExtPacket, spatial_layer: i32) {
        let down_tracks = self.down_tracks();

        if self.threshold == 0 || down_tracks.len() * 2 <= self.threshold {
            for dt in down_tracks.iter() {
                let _ = dt.write_rtp(ext_pkt, spatial_layer);
            }
            return;
        }

        let shared = Arc::new(ext_pkt.clone());
        let mut tasks = JoinSet::new();
        for chunk in down_tracks.chunks(PARALLEL_CHUNK) {
            let chunk = chunk.to_vec();
            let pkt = shared.clone();
            tasks.spawn(async move {
                for dt in &chunk {
                    let _ = dt.write_rtp(&pkt, spatial_layer);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        id: SubscriberId,
        written: AtomicUsize,
        closed: Mutex<bool>,
    }

    impl Recorder {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: SubscriberId::from(id),
                written: AtomicUsize::new(0),
                closed: Mutex::new(false),
            })
        }
    }

    impl TrackSender for Recorder {
        fn subscriber_id(&self) -> SubscriberId {
            self.id.clone()
        }

        fn write_rtp(&self, _ext_pkt: &ExtPacket, _spatial_layer: i32) -> Result<()> {
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    #[tokio::test]
    async fn store_replaces_same_subscriber() {
        let spreader = DownTrackSpreader::new(0);
        let first = Recorder::new("sub-a");
        let second = Recorder::new("sub-a");

        spreader.store(first.clone());
        spreader.store(second.clone());
        assert_eq!(spreader.down_track_count(), 1);

        spreader.broadcast_packet(&dummy_packet(), 0).await;
        assert_eq!(first.written.load(Ordering::SeqCst), 0);
        assert_eq!(second.written.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn free_removes_by_subscriber_id() {
        let spreader = DownTrackSpreader::new(0);
        let a = Recorder::new("sub-a");
        let b = Recorder::new("sub-b");
        spreader.store(a);
        spreader.store(b);

        spreader.free(&SubscriberId::from("sub-a"));
        assert_eq!(spreader.down_track_count(), 1);
        assert!(spreader.has_down_track(&SubscriberId::from("sub-b")));
        assert!(!spreader.has_down_track(&SubscriberId::from("sub-a")));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_sender_in_parallel_mode() {
        let spreader = DownTrackSpreader::new(3);
        let senders: Vec<_> = (0..8).map(|i| Recorder::new(&format!("sub-{i}"))).collect();
        for sender in &senders {
            spreader.store(sender.clone());
        }

        spreader.broadcast_packet(&dummy_packet(), 0).await;

        for sender in &senders {
            assert_eq!(sender.written.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn closure_broadcast_visits_every_sender() {
        let spreader = DownTrackSpreader::new(3);
        for i in 0..4 {
            spreader.store(Recorder::new(&format!("sub-{i}")));
        }

        let visited = AtomicUsize::new(0);
        spreader.broadcast(|_dt| {
            visited.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(visited.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn reset_returns_previous_set() {
        let spreader = DownTrackSpreader::new(0);
        spreader.store(Recorder::new("sub-a"));
        spreader.store(Recorder::new("sub-b"));

        let drained = spreader.reset_and_get_down_tracks();
        assert_eq!(drained.len(), 2);
        assert_eq!(spreader.down_track_count(), 0);
    }

    fn dummy_packet() -> ExtPacket {
        use crate::packet::CodecDescriptor;
        use crate::types::VideoLayer;
        use bytes::Bytes;
        use std::time::Instant;
        use webrtc::rtp::packet::Packet;

        ExtPacket {
            arrival: Instant::now(),
            packet: Packet::default(),
            raw_packet: Bytes::new(),
            key_frame: false,
            video_layer: VideoLayer::INVALID,
            spatial: -1,
            descriptor: CodecDescriptor::None,
        }
    }
}
