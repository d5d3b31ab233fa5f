//! Per-publisher-track receiver
//!
//! One receiver per published track. It owns up to one buffer per simulcast
//! layer (a single buffer for SVC codecs), runs a forwarding task per uplink
//! layer, feeds the stream tracker manager, fans packets out through the
//! spreader and lazily installs RED wrap/unwrap receivers for audio.

use crate::buffer::{AudioLevelParams, Buffer, RtcpPacket};
use crate::error::{Error, Result};
use crate::packet::ExtPacket;
use crate::red::{RedPrimaryReceiver, RedReceiver};
use crate::spreader::{DownTrackSpreader, TrackSender};
use crate::stream_tracker::{StreamTrackerManager, StreamTrackerManagerListener};
use crate::types::{
    rid_to_spatial_layer, is_red_codec, is_svc_codec, Bitrates, TrackInfo, TrackKind,
};
use castmux_core::config::{AudioConfig, PliThrottleConfig};
use castmux_core::{Metrics, SubscriberId, TrackId};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;

use crate::types::DEFAULT_MAX_LAYER_SPATIAL;

const SPATIAL_LAYERS: usize = DEFAULT_MAX_LAYER_SPATIAL as usize + 1;

/// Read side of a published track, as seen by down tracks and wrappers
pub trait TrackReceiver: Send + Sync {
    fn track_id(&self) -> TrackId;

    fn stream_id(&self) -> String;

    fn codec(&self) -> RTCRtpCodecParameters;

    fn kind(&self) -> TrackKind;

    fn track_info(&self) -> TrackInfo;

    fn is_closed(&self) -> bool;

    /// Historical packet lookup for retransmission
    fn read_rtp(&self, buf: &mut [u8], layer: u8, sn: u16) -> Result<usize>;

    fn get_layered_bitrate(&self) -> (Vec<i32>, Bitrates);

    fn get_audio_level(&self) -> Option<(f64, bool)>;

    fn send_pli(&self, layer: i32, force: bool);

    fn set_up_track_paused(&self, paused: bool);

    fn set_max_expected_spatial_layer(&self, layer: i32);

    fn set_rtt(&self, rtt: u32);

    fn add_down_track(&self, sender: Arc<dyn TrackSender>) -> Result<()>;

    fn delete_down_track(&self, subscriber_id: &SubscriberId);

    fn get_temporal_layer_fps_for_spatial(&self, layer: i32) -> Vec<f32>;

    fn get_reference_layer_rtp_timestamp(&self, ts: u32, layer: i32, reference_layer: i32) -> Result<u32>;

    /// Primary-codec view of a RED track; `self` when the track is not RED
    fn get_primary_receiver_for_red(self: Arc<Self>) -> Arc<dyn TrackReceiver>;

    /// RED view of a plain opus track; `self` when the track is already RED
    fn get_red_receiver(self: Arc<Self>) -> Arc<dyn TrackReceiver>;
}

/// Uplink description for one layer
#[derive(Debug, Clone)]
pub struct UpTrack {
    pub rid: String,
    pub ssrc: u32,
}

#[derive(Clone)]
enum RedForward {
    Encoder(Arc<RedReceiver>),
    Decoder(Arc<RedPrimaryReceiver>),
}

pub struct Receiver {
    track_id: TrackId,
    stream_id: String,
    kind: TrackKind,
    codec: RTCRtpCodecParameters,
    track_info: TrackInfo,
    is_svc: bool,
    is_red: bool,
    use_trackers: bool,
    lb_threshold: usize,
    audio_level_ext_id: Option<u8>,

    pli_throttle: PliThrottleConfig,
    audio_config: AudioConfig,
    metrics: Metrics,

    closed: AtomicBool,
    close_once: AtomicBool,
    on_close: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    on_max_layer_change: Mutex<Option<Arc<dyn Fn(i32) + Send + Sync>>>,
    on_bitrate_report: Mutex<Option<Arc<dyn Fn(&[i32], Bitrates) + Send + Sync>>>,

    rtcp_tx: Mutex<Option<mpsc::Sender<Vec<RtcpPacket>>>>,

    buffers: RwLock<[Option<Arc<Buffer>>; SPATIAL_LAYERS]>,
    up_tracks: RwLock<[Option<UpTrack>; SPATIAL_LAYERS]>,
    rtt: Mutex<u32>,

    stream_tracker_manager: Arc<StreamTrackerManager>,
    spreader: DownTrackSpreader,

    red_receiver: Mutex<Option<Arc<RedReceiver>>>,
    primary_receiver: Mutex<Option<Arc<RedPrimaryReceiver>>>,
    red_forward: RwLock<Option<RedForward>>,
}

/// Construction options mirroring the deployment configuration
pub struct ReceiverParams {
    pub track_info: TrackInfo,
    pub codec: RTCRtpCodecParameters,
    pub stream_id: String,
    pub pli_throttle: PliThrottleConfig,
    pub audio_config: AudioConfig,
    pub stream_trackers: castmux_core::config::StreamTrackersConfig,
    pub use_trackers: bool,
    /// Down-track count above which fan-out parallelizes; 0 disables
    pub lb_threshold: usize,
    /// Negotiated RFC 6464 audio-level header extension id, if any
    pub audio_level_ext_id: Option<u8>,
    pub metrics: Metrics,
}

impl Receiver {
    #[must_use]
    pub fn new(params: ReceiverParams) -> Arc<Self> {
        let is_svc = is_svc_codec(&params.codec.capability.mime_type);
        let is_red = is_red_codec(&params.codec.capability.mime_type);

        let stream_tracker_manager = StreamTrackerManager::new(
            params.track_info.clone(),
            is_svc,
            params.codec.capability.clock_rate,
            &params.stream_trackers,
        );

        let receiver = Arc::new(Self {
            track_id: params.track_info.id.clone(),
            stream_id: params.stream_id,
            kind: params.track_info.kind,
            codec: params.codec,
            track_info: params.track_info,
            is_svc,
            is_red,
            use_trackers: params.use_trackers,
            lb_threshold: params.lb_threshold,
            audio_level_ext_id: params.audio_level_ext_id,
            pli_throttle: params.pli_throttle,
            audio_config: params.audio_config,
            metrics: params.metrics,
            closed: AtomicBool::new(false),
            close_once: AtomicBool::new(false),
            on_close: Mutex::new(None),
            on_max_layer_change: Mutex::new(None),
            on_bitrate_report: Mutex::new(None),
            rtcp_tx: Mutex::new(None),
            buffers: RwLock::new(Default::default()),
            up_tracks: RwLock::new(Default::default()),
            rtt: Mutex::new(0),
            stream_tracker_manager,
            spreader: DownTrackSpreader::new(params.lb_threshold),
            red_receiver: Mutex::new(None),
            primary_receiver: Mutex::new(None),
            red_forward: RwLock::new(None),
        });

        let listener: Weak<dyn StreamTrackerManagerListener> =
            Arc::downgrade(&receiver) as Weak<dyn StreamTrackerManagerListener>;
        receiver.stream_tracker_manager.set_listener(listener);

        receiver
    }

    pub fn on_close(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_close.lock() = Some(Box::new(f));
    }

    pub fn on_max_layer_change(&self, f: impl Fn(i32) + Send + Sync + 'static) {
        *self.on_max_layer_change.lock() = Some(Arc::new(f));
    }

    pub fn on_bitrate_report_event(&self, f: impl Fn(&[i32], Bitrates) + Send + Sync + 'static) {
        *self.on_bitrate_report.lock() = Some(Arc::new(f));
    }

    /// Channel the owner drains to ship RTCP feedback to the publisher
    pub fn set_rtcp_sender(&self, tx: mpsc::Sender<Vec<RtcpPacket>>) {
        *self.rtcp_tx.lock() = Some(tx);
    }

    #[must_use]
    pub fn ssrc(&self, layer: usize) -> u32 {
        self.up_tracks
            .read()
            .get(layer)
            .and_then(|t| t.as_ref().map(|t| t.ssrc))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_svc(&self) -> bool {
        self.is_svc
    }

    #[must_use]
    pub fn is_red(&self) -> bool {
        self.is_red
    }

    #[must_use]
    pub fn stream_tracker_manager(&self) -> &Arc<StreamTrackerManager> {
        &self.stream_tracker_manager
    }

    /// Attach one uplink layer and start its forwarding loop. Idempotent per
    /// layer; a second registration for the same layer is ignored.
    pub fn add_up_track(self: &Arc<Self>, track: UpTrack, buffer: Arc<Buffer>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let layer = if self.kind == TrackKind::Video && !self.is_svc {
            rid_to_spatial_layer(&track.rid)
        } else {
            0
        };

        {
            let mut up_tracks = self.up_tracks.write();
            if up_tracks[layer as usize].is_some() {
                return;
            }
            up_tracks[layer as usize] = Some(track);
        }

        buffer.set_pli_throttle(self.pli_throttle.for_layer(layer));
        buffer.set_audio_level_params(AudioLevelParams {
            active_level: self.audio_config.active_level,
            min_percentile: self.audio_config.min_percentile,
            observe_duration: Duration::from_millis(u64::from(self.audio_config.update_interval_ms)),
            smooth_intervals: self.audio_config.smooth_intervals,
        });
        if let Some(ext_id) = self.audio_level_ext_id {
            buffer.set_audio_level_extension_id(ext_id);
        }

        let receiver = self.clone();
        buffer.on_rtcp_feedback(move |packets| {
            receiver.send_rtcp(packets);
        });

        let receiver = self.clone();
        let payload_type = self.codec.payload_type;
        buffer.on_rtcp_sender_report(move |sr| {
            receiver
                .stream_tracker_manager
                .set_sender_report_data(layer, *sr);
            receiver.spreader.broadcast(|dt| {
                dt.handle_rtcp_sender_report(payload_type, layer, sr);
            });
        });

        {
            let rtt = *self.rtt.lock();
            buffer.set_rtt(rtt);
            self.buffers.write()[layer as usize] = Some(buffer.clone());
        }
        buffer.set_paused(self.stream_tracker_manager.is_paused());

        if self.kind == TrackKind::Video && self.use_trackers {
            self.stream_tracker_manager.add_tracker(layer);
        }

        let receiver = self.clone();
        tokio::spawn(async move {
            receiver.forward_rtp(layer, buffer).await;
        });
    }

    async fn forward_rtp(self: Arc<Self>, layer: i32, buffer: Arc<Buffer>) {
        let mut tracker = self.stream_tracker_manager.get_tracker(layer);

        loop {
            let ext_pkt = match buffer.read_extended().await {
                Ok(pkt) => pkt,
                Err(_) => break,
            };

            let mut spatial_layer = layer;
            let mut spatial_tracker = tracker.clone();
            if ext_pkt.spatial >= 0 {
                // svc packet, dispatch to the tracker of its own layer
                spatial_layer = ext_pkt.spatial;
                spatial_tracker = self.stream_tracker_manager.get_tracker(spatial_layer);
                if spatial_tracker.is_none() {
                    spatial_tracker = self.stream_tracker_manager.add_tracker(spatial_layer);
                }
            } else if tracker.is_none() {
                tracker = self.stream_tracker_manager.get_tracker(layer);
                spatial_tracker = tracker.clone();
            }

            if let Some(t) = spatial_tracker.as_ref() {
                t.observe(
                    ext_pkt.video_layer.temporal,
                    ext_pkt.raw_packet.len(),
                    ext_pkt.packet.payload.len(),
                    ext_pkt.packet.header.marker,
                    ext_pkt.packet.header.timestamp,
                );
            }

            self.spreader.broadcast_packet(&ext_pkt, spatial_layer).await;

            // clone out of the lock so the guard is not held across an await
            let red_forward = self.red_forward.read().clone();
            match red_forward {
                Some(RedForward::Encoder(red)) => red.forward_rtp(&ext_pkt, spatial_layer).await,
                Some(RedForward::Decoder(primary)) => {
                    primary.forward_rtp(&ext_pkt, spatial_layer).await;
                }
                None => {}
            }
        }

        self.close_internal();
        self.stream_tracker_manager.remove_tracker(layer);
        if self.is_svc {
            self.stream_tracker_manager.remove_all_trackers();
        }
    }

    fn close_internal(&self) {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.store(true, Ordering::Release);

        info!(track_id = %self.track_id, "receiver closed");

        self.stream_tracker_manager.close();

        for dt in self.spreader.reset_and_get_down_tracks().iter() {
            dt.close();
        }

        if let Some(red) = self.primary_receiver.lock().as_ref() {
            red.close();
        }
        if let Some(red) = self.red_receiver.lock().as_ref() {
            red.close();
        }

        if let Some(f) = self.on_close.lock().take() {
            f();
        }
    }

    /// Close the receiver: buffers drain, forwarding loops exit, down tracks
    /// close. Safe to call more than once.
    pub fn close(&self) {
        let buffers = self.buffers.read().clone();
        for buffer in buffers.iter().flatten() {
            buffer.close();
        }
        self.close_internal();
    }

    fn send_rtcp(&self, packets: Vec<RtcpPacket>) {
        if packets.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let tx = self.rtcp_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.try_send(packets).is_err() {
                warn!(track_id = %self.track_id, "rtcp channel full, dropping feedback");
            }
        }
    }

    fn get_buffer(&self, layer: i32) -> Option<Arc<Buffer>> {
        // spatial layers of svc codecs share one buffer
        let layer = if self.is_svc { 0 } else { layer };
        if layer < 0 || layer as usize >= SPATIAL_LAYERS {
            return None;
        }
        self.buffers.read()[layer as usize].clone()
    }

    #[must_use]
    pub fn debug_info(&self) -> serde_json::Value {
        let up_tracks: Vec<_> = self
            .up_tracks
            .read()
            .iter()
            .enumerate()
            .filter_map(|(layer, t)| {
                t.as_ref().map(|t| {
                    json!({
                        "layer": layer,
                        "ssrc": t.ssrc,
                        "rid": t.rid,
                    })
                })
            })
            .collect();

        json!({
            "svc": self.is_svc,
            "simulcast": !self.is_svc && self.track_info.layers.len() > 1,
            "up_tracks": up_tracks,
        })
    }
}

impl TrackReceiver for Receiver {
    fn track_id(&self) -> TrackId {
        self.track_id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn codec(&self) -> RTCRtpCodecParameters {
        self.codec.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn track_info(&self) -> TrackInfo {
        self.track_info.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read_rtp(&self, buf: &mut [u8], layer: u8, sn: u16) -> Result<usize> {
        let buffer = self
            .get_buffer(i32::from(layer))
            .ok_or(Error::BufferNotFound(i32::from(layer)))?;
        buffer.get_packet(buf, sn)
    }

    fn get_layered_bitrate(&self) -> (Vec<i32>, Bitrates) {
        self.stream_tracker_manager.get_layered_bitrate()
    }

    fn get_audio_level(&self) -> Option<(f64, bool)> {
        if self.kind == TrackKind::Video {
            return None;
        }
        let buffers = self.buffers.read();
        buffers.iter().flatten().next().and_then(|b| b.get_audio_level())
    }

    fn send_pli(&self, layer: i32, force: bool) {
        if let Some(buffer) = self.get_buffer(layer) {
            self.metrics.record_pli();
            buffer.send_pli(force);
        }
    }

    fn set_up_track_paused(&self, paused: bool) {
        self.stream_tracker_manager.set_paused(paused);

        let buffers = self.buffers.read();
        for buffer in buffers.iter().flatten() {
            buffer.set_paused(paused);
        }
    }

    fn set_max_expected_spatial_layer(&self, layer: i32) {
        self.stream_tracker_manager.set_max_expected_spatial_layer(layer);
    }

    fn set_rtt(&self, rtt: u32) {
        {
            let mut current = self.rtt.lock();
            if *current == rtt {
                return;
            }
            *current = rtt;
        }

        let buffers = self.buffers.read().clone();
        for buffer in buffers.iter().flatten() {
            buffer.set_rtt(rtt);
        }
    }

    fn add_down_track(&self, sender: Arc<dyn TrackSender>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ReceiverClosed);
        }

        let subscriber_id = sender.subscriber_id();
        if self.spreader.has_down_track(&subscriber_id) {
            info!(
                track_id = %self.track_id,
                subscriber_id = %subscriber_id,
                "subscriber already exists, replacing down track"
            );
        }

        sender.up_track_max_published_layer_change(self.stream_tracker_manager.get_max_published_layer());
        sender.up_track_max_temporal_layer_seen_change(self.stream_tracker_manager.get_max_temporal_layer_seen());

        self.spreader.store(sender);
        self.metrics.down_track_added();
        Ok(())
    }

    fn delete_down_track(&self, subscriber_id: &SubscriberId) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        self.spreader.free(subscriber_id);
        self.metrics.down_track_removed();
    }

    fn get_temporal_layer_fps_for_spatial(&self, layer: i32) -> Vec<f32> {
        let Some(buffer) = self.get_buffer(layer) else {
            return Vec::new();
        };

        if !self.is_svc {
            buffer.get_temporal_layer_fps_for_spatial(0)
        } else {
            buffer.get_temporal_layer_fps_for_spatial(layer)
        }
    }

    fn get_reference_layer_rtp_timestamp(&self, ts: u32, layer: i32, reference_layer: i32) -> Result<u32> {
        self.stream_tracker_manager
            .get_reference_layer_rtp_timestamp(ts, layer, reference_layer)
    }

    fn get_primary_receiver_for_red(self: Arc<Self>) -> Arc<dyn TrackReceiver> {
        if !self.is_red || self.closed.load(Ordering::Acquire) {
            return self;
        }

        let mut slot = self.primary_receiver.lock();
        if slot.is_none() {
            let primary = RedPrimaryReceiver::new(&self, self.lb_threshold);
            *self.red_forward.write() = Some(RedForward::Decoder(primary.clone()));
            *slot = Some(primary);
        }
        let primary = slot.as_ref().cloned();
        drop(slot);
        primary.map_or_else(|| self.clone() as Arc<dyn TrackReceiver>, |p| p as Arc<dyn TrackReceiver>)
    }

    fn get_red_receiver(self: Arc<Self>) -> Arc<dyn TrackReceiver> {
        if self.is_red || self.closed.load(Ordering::Acquire) {
            return self;
        }

        let mut slot = self.red_receiver.lock();
        if slot.is_none() {
            let red = RedReceiver::new(&self, self.lb_threshold);
            *self.red_forward.write() = Some(RedForward::Encoder(red.clone()));
            *slot = Some(red);
        }
        let red = slot.as_ref().cloned();
        drop(slot);
        red.map_or_else(|| self.clone() as Arc<dyn TrackReceiver>, |r| r as Arc<dyn TrackReceiver>)
    }
}

impl StreamTrackerManagerListener for Receiver {
    fn on_available_layers_changed(&self) {
        for dt in self.spreader.down_tracks().iter() {
            dt.up_track_layers_change();
        }
    }

    fn on_bitrate_availability_changed(&self) {
        for dt in self.spreader.down_tracks().iter() {
            dt.up_track_layers_change();
        }
    }

    fn on_max_published_layer_changed(&self, max_published_layer: i32) {
        for dt in self.spreader.down_tracks().iter() {
            dt.up_track_max_published_layer_change(max_published_layer);
        }
    }

    fn on_max_temporal_layer_seen_changed(&self, max_temporal_layer_seen: i32) {
        for dt in self.spreader.down_tracks().iter() {
            dt.up_track_max_temporal_layer_seen_change(max_temporal_layer_seen);
        }
    }

    fn on_max_available_layer_changed(&self, max_available_layer: i32) {
        let callback = self.on_max_layer_change.lock().clone();
        if let Some(f) = callback {
            f(max_available_layer);
        }
    }

    fn on_bitrate_report(&self, available_layers: &[i32], bitrates: Bitrates) {
        for dt in self.spreader.down_tracks().iter() {
            dt.up_track_bitrate_report(available_layers, bitrates);
        }
        let callback = self.on_bitrate_report.lock().clone();
        if let Some(f) = callback {
            f(available_layers, bitrates);
        }
        debug!(track_id = %self.track_id, layers = ?available_layers, "bitrate report");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::{PublishedLayerInfo, TrackSource};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    pub(crate) fn receiver_with(mime: &str, kind: TrackKind, layers: Vec<i32>) -> Arc<Receiver> {
        let source = match kind {
            TrackKind::Audio => TrackSource::Microphone,
            TrackKind::Video => TrackSource::Camera,
        };

        Receiver::new(ReceiverParams {
            track_info: TrackInfo {
                id: TrackId::from("TR_test"),
                kind,
                source,
                layers: layers
                    .into_iter()
                    .map(|spatial| PublishedLayerInfo { spatial, bitrate: 0 })
                    .collect(),
            },
            codec: RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: mime.to_string(),
                    clock_rate: if mime.starts_with("audio") { 48_000 } else { 90_000 },
                    channels: u16::from(mime.starts_with("audio")) * 2,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: Vec::new(),
                },
                payload_type: 111,
                ..Default::default()
            },
            stream_id: "stream-test".to_string(),
            pli_throttle: PliThrottleConfig::default(),
            audio_config: AudioConfig::default(),
            stream_trackers: castmux_core::config::StreamTrackersConfig::default(),
            use_trackers: true,
            lb_threshold: 0,
            audio_level_ext_id: match kind {
                TrackKind::Audio => Some(1),
                TrackKind::Video => None,
            },
            metrics: Metrics::disabled(),
        })
    }

    pub(crate) fn opus_receiver() -> Arc<Receiver> {
        receiver_with("audio/opus", TrackKind::Audio, vec![0])
    }

    /// Track sender that records everything written to it
    pub(crate) struct RecordingSender {
        id: SubscriberId,
        packets: Mutex<Vec<(ExtPacket, i32)>>,
        closed: AtomicBool,
        max_published_seen: Mutex<Vec<i32>>,
    }

    impl RecordingSender {
        pub(crate) fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: SubscriberId::from(id),
                packets: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                max_published_seen: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn packets(&self) -> Vec<ExtPacket> {
            self.packets.lock().iter().map(|(p, _)| p.clone()).collect()
        }

        pub(crate) fn packets_with_layers(&self) -> Vec<(ExtPacket, i32)> {
            self.packets.lock().clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }

        pub(crate) fn max_published_seen(&self) -> Vec<i32> {
            self.max_published_seen.lock().clone()
        }
    }

    impl TrackSender for RecordingSender {
        fn subscriber_id(&self) -> SubscriberId {
            self.id.clone()
        }

        fn write_rtp(&self, ext_pkt: &ExtPacket, spatial_layer: i32) -> Result<()> {
            self.packets.lock().push((ext_pkt.clone(), spatial_layer));
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn up_track_max_published_layer_change(&self, max_published_layer: i32) {
            self.max_published_seen.lock().push(max_published_layer);
        }
    }
}
