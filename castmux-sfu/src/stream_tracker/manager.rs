//! Per-receiver tracker coordination
//!
//! Owns one [`StreamTracker`] per spatial layer, maintains the sorted set of
//! currently available layers, aggregates per-layer bitrates into the
//! [`Bitrates`] matrix and computes the distance-to-desired scalar used by
//! quality and admission logic.

use super::{FrameTracker, PacketTracker, StreamStatus, StreamTracker, TrackerStrategy};
use crate::buffer::RtcpSenderReportData;
use crate::error::{Error, Result};
use crate::types::{
    Bitrates, TrackInfo, TrackKind, TrackSource, VideoLayer, DEFAULT_MAX_LAYER_SPATIAL,
    DEFAULT_MAX_LAYER_TEMPORAL, INVALID_LAYER_SPATIAL, INVALID_LAYER_TEMPORAL,
};
use castmux_core::config::{StreamTrackerConfig, StreamTrackerKind, StreamTrackersConfig};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SPATIAL_LAYERS: usize = DEFAULT_MAX_LAYER_SPATIAL as usize + 1;

/// Events published by the manager; implemented by the owning receiver
pub trait StreamTrackerManagerListener: Send + Sync {
    fn on_available_layers_changed(&self);
    fn on_bitrate_availability_changed(&self);
    fn on_max_published_layer_changed(&self, max_published_layer: i32);
    fn on_max_temporal_layer_seen_changed(&self, max_temporal_layer_seen: i32);
    fn on_max_available_layer_changed(&self, max_available_layer: i32);
    fn on_bitrate_report(&self, available_layers: &[i32], bitrates: Bitrates);
}

struct State {
    trackers: [Option<Arc<StreamTracker>>; SPATIAL_LAYERS],
    available_layers: Vec<i32>,
    max_published_layer: i32,
    max_temporal_layer_seen: i32,
    max_expected_layer: i32,
    paused: bool,
}

pub struct StreamTrackerManager {
    track_info: TrackInfo,
    is_svc: bool,
    clock_rate: u32,
    tracker_config: StreamTrackerConfig,

    state: RwLock<State>,
    sender_reports: RwLock<[Option<RtcpSenderReportData>; SPATIAL_LAYERS]>,
    listener: Mutex<Option<Weak<dyn StreamTrackerManagerListener>>>,
    closed: CancellationToken,
}

impl StreamTrackerManager {
    #[must_use]
    pub fn new(
        track_info: TrackInfo,
        is_svc: bool,
        clock_rate: u32,
        trackers_config: &StreamTrackersConfig,
    ) -> Arc<Self> {
        let tracker_config = match track_info.source {
            TrackSource::ScreenShare => trackers_config.screenshare.clone(),
            _ => trackers_config.video.clone(),
        };

        let max_expected_layer = track_info.max_announced_spatial_layer();

        let manager = Arc::new(Self {
            is_svc,
            clock_rate,
            tracker_config,
            state: RwLock::new(State {
                trackers: Default::default(),
                available_layers: Vec::new(),
                max_published_layer: INVALID_LAYER_SPATIAL,
                max_temporal_layer_seen: INVALID_LAYER_TEMPORAL,
                max_expected_layer,
                paused: false,
            }),
            sender_reports: RwLock::new(Default::default()),
            listener: Mutex::new(None),
            closed: CancellationToken::new(),
            track_info,
        });

        if manager.track_info.kind == TrackKind::Video {
            let weak = Arc::downgrade(&manager);
            let closed = manager.closed.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = closed.cancelled() => return,
                        _ = ticker.tick() => {
                            let Some(manager) = weak.upgrade() else { return };
                            manager.report_bitrate();
                        }
                    }
                }
            });
        }

        manager
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn set_listener(&self, listener: Weak<dyn StreamTrackerManagerListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn StreamTrackerManagerListener>> {
        self.listener.lock().as_ref().and_then(Weak::upgrade)
    }

    fn build_strategy(&self, layer: i32) -> Option<TrackerStrategy> {
        match self.tracker_config.kind {
            StreamTrackerKind::Packet => {
                let config = self.tracker_config.packet_tracker.get(&layer)?.clone();
                Some(TrackerStrategy::Packet(PacketTracker::new(config)))
            }
            StreamTrackerKind::Frame => {
                let config = self.tracker_config.frame_tracker.get(&layer)?.clone();
                Some(TrackerStrategy::Frame(FrameTracker::new(config, self.clock_rate)))
            }
        }
    }

    /// Create and start the tracker for a spatial layer. Returns `None` when
    /// the configuration does not cover the layer.
    pub fn add_tracker(self: &Arc<Self>, layer: i32) -> Option<Arc<StreamTracker>> {
        if layer < 0 || layer as usize >= SPATIAL_LAYERS {
            return None;
        }

        let bitrate_interval = self.tracker_config.bitrate_report_interval(layer)?;
        let strategy = self.build_strategy(layer)?;
        let cycle_duration = match self.tracker_config.packet_tracker.get(&layer) {
            Some(c) => c.cycle_duration(),
            None => Duration::from_secs(1),
        };

        let tracker = StreamTracker::new(strategy, cycle_duration, bitrate_interval);
        debug!(layer, "stream tracker manager add tracker");

        let weak = Arc::downgrade(self);
        tracker.on_status_changed(Box::new(move |status| {
            let Some(manager) = weak.upgrade() else { return };
            debug!(layer, ?status, "stream tracker status changed");
            if status == StreamStatus::Stopped {
                manager.remove_available_layer(layer);
            } else {
                manager.add_available_layer(layer);
            }
        }));

        let weak = Arc::downgrade(self);
        tracker.on_bitrate_available(Box::new(move || {
            let Some(manager) = weak.upgrade() else { return };
            if let Some(listener) = manager.listener() {
                listener.on_bitrate_availability_changed();
            }
        }));

        let notify_max = {
            let mut state = self.state.write();
            let paused = state.paused;
            state.trackers[layer as usize] = Some(tracker.clone());
            tracker.set_paused(paused);

            if layer > state.max_published_layer {
                state.max_published_layer = layer;
                true
            } else {
                false
            }
        };

        if notify_max {
            if let Some(listener) = self.listener() {
                listener.on_max_published_layer_changed(layer);
            }
        }

        tracker.start();
        Some(tracker)
    }

    pub fn remove_tracker(&self, layer: i32) {
        if layer < 0 || layer as usize >= SPATIAL_LAYERS {
            return;
        }

        let tracker = self.state.write().trackers[layer as usize].take();
        if let Some(tracker) = tracker {
            tracker.stop();
        }
    }

    pub fn remove_all_trackers(&self) {
        let trackers = {
            let mut state = self.state.write();
            let trackers: Vec<_> = state.trackers.iter_mut().filter_map(Option::take).collect();
            state.available_layers.clear();
            state.max_expected_layer = self.track_info.max_announced_spatial_layer();
            state.paused = false;
            trackers
        };

        for tracker in trackers {
            tracker.stop();
        }
    }

    #[must_use]
    pub fn get_tracker(&self, layer: i32) -> Option<Arc<StreamTracker>> {
        if layer < 0 || layer as usize >= SPATIAL_LAYERS {
            return None;
        }
        self.state.read().trackers[layer as usize].clone()
    }

    pub fn set_paused(&self, paused: bool) {
        let trackers: Vec<_> = {
            let mut state = self.state.write();
            state.paused = paused;
            state.trackers.iter().flatten().cloned().collect()
        };

        for tracker in trackers {
            tracker.set_paused(paused);
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.read().paused
    }

    /// Advisory upper bound of layers expected from the publisher. Raising it
    /// resets stopped trackers so restarted layers report available on their
    /// first packet. Returns the previous bound.
    pub fn set_max_expected_spatial_layer(&self, layer: i32) -> i32 {
        let (prev, to_reset) = {
            let mut state = self.state.write();
            let prev = state.max_expected_layer;
            if layer <= prev {
                state.max_expected_layer = layer;
                return prev;
            }

            let mut to_reset = Vec::new();
            for l in (prev + 1)..=layer {
                if state.available_layers.contains(&l) {
                    continue;
                }
                if let Some(tracker) = state.trackers.get(l as usize).and_then(Clone::clone) {
                    to_reset.push(tracker);
                }
            }
            state.max_expected_layer = layer;
            (prev, to_reset)
        };

        for tracker in to_reset {
            tracker.reset();
        }

        prev
    }

    /// Scalar distance between the layers a subscriber asked for and what the
    /// publisher currently delivers; 0 when paused or nothing is expected
    #[must_use]
    pub fn distance_to_desired(&self) -> f64 {
        let state = self.state.read();
        if state.paused || state.max_expected_layer < 0 || state.max_temporal_layer_seen < 0 {
            return 0.0;
        }

        let (available_layers, bitrates) = self.layered_bitrate_locked(&state);

        let mut max_layer = VideoLayer::INVALID;
        'outer: for s in (0..bitrates.len()).rev() {
            for t in (0..bitrates[0].len()).rev() {
                if bitrates[s][t] != 0 {
                    max_layer = VideoLayer::new(s as i32, t as i32);
                    break 'outer;
                }
            }
        }

        // a tracker may declare a layer seen before bitrate measurement is up
        for layer in &available_layers {
            if *layer > max_layer.spatial {
                max_layer = VideoLayer::new(*layer, state.max_temporal_layer_seen);
            }
        }

        let adjusted = if max_layer.is_valid() {
            max_layer
        } else {
            VideoLayer::new(0, 0)
        };

        let mut distance = (state.max_expected_layer - adjusted.spatial)
            * (state.max_temporal_layer_seen + 1)
            + (state.max_temporal_layer_seen - adjusted.temporal);
        if !max_layer.is_valid() {
            distance += 1;
        }

        f64::from(distance) / f64::from(state.max_temporal_layer_seen + 1)
    }

    #[must_use]
    pub fn get_max_published_layer(&self) -> i32 {
        self.state.read().max_published_layer
    }

    #[must_use]
    pub fn get_max_temporal_layer_seen(&self) -> i32 {
        self.state.read().max_temporal_layer_seen
    }

    #[must_use]
    pub fn get_available_layers(&self) -> Vec<i32> {
        self.state.read().available_layers.clone()
    }

    #[must_use]
    pub fn has_spatial_layer(&self, layer: i32) -> bool {
        self.state.read().available_layers.contains(&layer)
    }

    /// Current available layers and the aggregated bitrate matrix
    #[must_use]
    pub fn get_layered_bitrate(&self) -> (Vec<i32>, Bitrates) {
        let state = self.state.read();
        self.layered_bitrate_locked(&state)
    }

    fn layered_bitrate_locked(&self, state: &State) -> (Vec<i32>, Bitrates) {
        let mut bitrates = Bitrates::default();

        for (spatial, tracker) in state.trackers.iter().enumerate() {
            let Some(tracker) = tracker else { continue };
            if !state.available_layers.contains(&(spatial as i32)) {
                continue;
            }
            let rates = tracker.bitrate_temporal_cumulative();
            bitrates[spatial][..rates.len()].copy_from_slice(&rates);
        }

        if self.is_svc {
            for spatial in (1..bitrates.len()).rev() {
                for temporal in (0..bitrates[spatial].len()).rev() {
                    if bitrates[spatial][temporal] != 0 {
                        for lower in (0..spatial).rev() {
                            bitrates[spatial][temporal] += bitrates[lower][temporal];
                        }
                    }
                }
            }
        }

        (state.available_layers.clone(), bitrates)
    }

    fn add_available_layer(&self, layer: i32) {
        let (changed, is_max_change) = {
            let mut state = self.state.write();
            if state.available_layers.contains(&layer) {
                (false, false)
            } else {
                state.available_layers.push(layer);
                state.available_layers.sort_unstable();
                debug!(added = layer, layers = ?state.available_layers, "available layers changed - layer seen");
                (true, state.available_layers.last() == Some(&layer))
            }
        };

        if !changed {
            return;
        }

        if let Some(listener) = self.listener() {
            listener.on_available_layers_changed();
            if is_max_change {
                listener.on_max_available_layer_changed(layer);
            }
        }
    }

    fn remove_available_layer(&self, layer: i32) {
        let (prev_max, cur_max) = {
            let mut state = self.state.write();
            let prev_max = state.available_layers.last().copied().unwrap_or(INVALID_LAYER_SPATIAL);
            state.available_layers.retain(|l| *l != layer);
            let cur_max = state.available_layers.last().copied().unwrap_or(INVALID_LAYER_SPATIAL);
            debug!(removed = layer, layers = ?state.available_layers, "available layers changed - layer gone");
            (prev_max, cur_max)
        };

        // unavailable layers must be switched away from immediately
        if let Some(listener) = self.listener() {
            listener.on_available_layers_changed();
            if cur_max != prev_max {
                listener.on_max_available_layer_changed(cur_max);
            }
        }
    }

    pub fn set_sender_report_data(&self, layer: i32, report: RtcpSenderReportData) {
        if layer < 0 || layer as usize >= SPATIAL_LAYERS {
            return;
        }
        self.sender_reports.write()[layer as usize] = Some(report);
    }

    /// Map an RTP timestamp from `layer` onto `reference_layer` using the NTP
    /// time of each layer's most recent sender report
    pub fn get_reference_layer_rtp_timestamp(&self, ts: u32, layer: i32, reference_layer: i32) -> Result<u32> {
        if layer < 0 || reference_layer < 0 {
            return Err(Error::InvalidLayer {
                target: layer,
                reference: reference_layer,
            });
        }

        let reports = self.sender_reports.read();
        let sr_layer = reports
            .get(layer as usize)
            .and_then(|r| *r)
            .filter(|r| r.ntp_timestamp.0 != 0)
            .ok_or(Error::SenderReportNotAvailable(layer))?;
        let sr_ref = reports
            .get(reference_layer as usize)
            .and_then(|r| *r)
            .filter(|r| r.ntp_timestamp.0 != 0)
            .ok_or(Error::SenderReportNotAvailable(reference_layer))?;

        // line up both RTP timestamps at the reference layer's NTP instant;
        // modulo arithmetic keeps this correct across u32 wrap
        let ntp_diff = sr_ref.ntp_timestamp.as_secs_f64() - sr_layer.ntp_timestamp.as_secs_f64();
        let rtp_diff = (ntp_diff * f64::from(self.clock_rate)).round() as i64;
        let normalized = sr_layer.rtp_timestamp.wrapping_add(rtp_diff as u32);

        Ok(ts.wrapping_add(sr_ref.rtp_timestamp.wrapping_sub(normalized)))
    }

    fn update_max_temporal_layer_seen(&self, bitrates: &Bitrates) {
        let mut seen = INVALID_LAYER_TEMPORAL;
        'outer: for t in (0..=DEFAULT_MAX_LAYER_TEMPORAL as usize).rev() {
            for s in (0..=DEFAULT_MAX_LAYER_SPATIAL as usize).rev() {
                if bitrates[s][t] != 0 {
                    seen = t as i32;
                    break 'outer;
                }
            }
        }

        {
            let mut state = self.state.write();
            if seen <= state.max_temporal_layer_seen {
                return;
            }
            state.max_temporal_layer_seen = seen;
        }

        if let Some(listener) = self.listener() {
            listener.on_max_temporal_layer_seen_changed(seen);
        }
    }

    fn report_bitrate(&self) {
        let (available_layers, bitrates) = self.get_layered_bitrate();
        self.update_max_temporal_layer_seen(&bitrates);

        if let Some(listener) = self.listener() {
            listener.on_bitrate_report(&available_layers, bitrates);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::NtpTime;
    use castmux_core::TrackId;

    fn track_info(source: TrackSource) -> TrackInfo {
        TrackInfo {
            id: TrackId::from("TR_test"),
            kind: TrackKind::Video,
            source,
            layers: vec![
                crate::types::PublishedLayerInfo { spatial: 0, bitrate: 150_000 },
                crate::types::PublishedLayerInfo { spatial: 1, bitrate: 500_000 },
            ],
        }
    }

    fn manager(is_svc: bool) -> Arc<StreamTrackerManager> {
        StreamTrackerManager::new(
            track_info(TrackSource::Camera),
            is_svc,
            90_000,
            &StreamTrackersConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn svc_bitrate_aggregation_is_cumulative() {
        let manager = manager(true);
        let t0 = manager.add_tracker(0).unwrap();
        let t1 = manager.add_tracker(1).unwrap();

        // both layers at 100 pkt/s x 1000 B, spread across the report window
        for _ in 0..4 {
            for _ in 0..25 {
                t0.observe(0, 1000, 990, false, 0);
                t1.observe(0, 1000, 990, false, 0);
            }
            tokio::time::advance(Duration::from_millis(250)).await;
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;

        let (available, bitrates) = manager.get_layered_bitrate();
        assert_eq!(available, vec![0, 1]);
        assert_eq!(bitrates[0][0], 100_000);
        assert_eq!(bitrates[1][0], 200_000);
        // cumulativity invariant across spatial layers
        for t in 0..bitrates[0].len() {
            assert!(bitrates[1][t] >= bitrates[0][t]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn available_layers_follow_tracker_status() {
        let manager = manager(false);
        let t0 = manager.add_tracker(0).unwrap();
        assert!(manager.get_available_layers().is_empty());

        t0.observe(0, 1000, 990, false, 0);
        assert_eq!(manager.get_available_layers(), vec![0]);
        assert!(manager.has_spatial_layer(0));

        // two empty cycles stop the layer
        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert!(manager.get_available_layers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn max_published_layer_tracks_added_trackers() {
        let manager = manager(false);
        assert_eq!(manager.get_max_published_layer(), INVALID_LAYER_SPATIAL);
        manager.add_tracker(0);
        assert_eq!(manager.get_max_published_layer(), 0);
        manager.add_tracker(2);
        assert_eq!(manager.get_max_published_layer(), 2);
        manager.add_tracker(1);
        assert_eq!(manager.get_max_published_layer(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reference_layer_timestamp_alignment() {
        let manager = manager(true);

        manager.set_sender_report_data(
            0,
            RtcpSenderReportData {
                ntp_timestamp: NtpTime::from_secs_f64(1000.0),
                rtp_timestamp: 100_000,
                packet_count: 0,
                byte_count: 0,
                at: None,
            },
        );
        manager.set_sender_report_data(
            1,
            RtcpSenderReportData {
                ntp_timestamp: NtpTime::from_secs_f64(1000.1),
                rtp_timestamp: 110_000,
                packet_count: 0,
                byte_count: 0,
                at: None,
            },
        );

        let mapped = manager.get_reference_layer_rtp_timestamp(105_000, 0, 1).unwrap();
        assert_eq!(mapped, 106_000);

        assert!(matches!(
            manager.get_reference_layer_rtp_timestamp(105_000, 0, 2),
            Err(Error::SenderReportNotAvailable(2))
        ));
        assert!(matches!(
            manager.get_reference_layer_rtp_timestamp(105_000, -1, 1),
            Err(Error::InvalidLayer { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn distance_to_desired_accounts_for_missing_layers() {
        let manager = manager(false);

        // nothing seen yet
        assert_eq!(manager.distance_to_desired(), 0.0);

        let t0 = manager.add_tracker(0).unwrap();
        t0.observe(0, 1000, 990, false, 0);
        {
            // max temporal layer seen is normally learned from bitrate reports
            manager.state.write().max_temporal_layer_seen = 2;
        }

        // expected up to layer 1, only layer 0 available with unknown bitrate:
        // ((1 - 0) * 3 + (2 - 2)) / 3 = 1.0
        assert_eq!(manager.distance_to_desired(), 1.0);

        manager.set_paused(true);
        assert_eq!(manager.distance_to_desired(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn raising_expected_layer_resets_stopped_trackers() {
        let manager = manager(false);
        let t1 = manager.add_tracker(1).unwrap();

        t1.observe(0, 1000, 990, false, 0);
        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert!(!manager.has_spatial_layer(1));

        let prev = manager.set_max_expected_spatial_layer(-1);
        assert_eq!(prev, 1);
        manager.set_max_expected_spatial_layer(1);
        // tracker was reset; first packet reactivates immediately
        t1.observe(0, 1000, 990, false, 0);
        assert!(manager.has_spatial_layer(1));
    }
}
