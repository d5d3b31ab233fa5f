//! Per-subscriber forwarding track
//!
//! A `DownTrack` is the egress counterpart of a publisher track for exactly
//! one subscriber. It consults its codec selector for every packet, rewrites
//! sequence numbers/timestamps/SSRC so the output reads as one continuous
//! stream, retransmits on NACK, answers RTCP, and escalates persistent
//! transport failures to its owner.

use crate::buffer::{NtpTime, RtcpSenderReportData};
use crate::error::{Error, Result};
use crate::packet::ExtPacket;
use crate::receiver::TrackReceiver;
use crate::rtp_munger::RtpMunger;
use crate::selector::VideoLayerSelector;
use crate::spreader::TrackSender;
use crate::types::{Bitrates, TrackKind, VideoLayer};
use castmux_core::{Metrics, SubscriberId, TrackId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::source_description::{
    SdesType, SourceDescriptionChunk, SourceDescriptionItem,
};
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp::header::{Extension, Header};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::util::{MarshalSize, Unmarshal};

/// Consecutive transport write failures before `on_publication_error` fires
const WRITE_ERROR_THRESHOLD: u32 = 5;
/// Two-byte extension profile; dependency descriptors exceed the one-byte cap
const DD_EXTENSION_PROFILE: u16 = 0x1000;
const DD_EXTENSION_ID: u8 = 12;
/// Forwarded packets remembered for NACK-triggered retransmission mapping
const SEQUENCER_HISTORY: usize = 1 << 10;
/// Scratch size for RTX reads
const RTX_SCRATCH_SIZE: usize = 1500;

/// Lifecycle of a down track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DownTrackState {
    PreNegotiated = 0,
    Bound = 1,
    Active = 2,
    Paused = 3,
    Closed = 4,
}

impl DownTrackState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Bound,
            2 => Self::Active,
            3 => Self::Paused,
            4 => Self::Closed,
            _ => Self::PreNegotiated,
        }
    }
}

/// Transport seam towards the subscriber's peer connection. Implementations
/// may block briefly on socket backpressure but must not park the caller.
pub trait DownTrackTransport: Send + Sync {
    fn write_rtp(&self, packet: &Packet) -> Result<usize>;
}

/// Cumulative egress statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct DownTrackStats {
    pub packets: u64,
    pub bytes: u64,
    pub padding_packets: u64,
    pub write_errors: u64,
    pub nacks: u64,
    pub plis: u64,
}

pub type OnBindingFn = Arc<dyn Fn() + Send + Sync>;
pub type OnCloseFn = Arc<dyn Fn(bool) + Send + Sync>;
pub type OnMaxLayerChangedFn = Arc<dyn Fn(i32) + Send + Sync>;
pub type OnStatsUpdateFn = Arc<dyn Fn(&DownTrackStats) + Send + Sync>;
pub type OnRttUpdateFn = Arc<dyn Fn(u32) + Send + Sync>;
pub type OnPublicationErrorFn = Arc<dyn Fn(&TrackId) + Send + Sync>;
pub type ReceiverReportFn = Arc<dyn Fn(&ReceiverReport) + Send + Sync>;

struct Forwarder {
    selector: VideoLayerSelector,
    munger: RtpMunger,
    // (egress sn, source sn, source layer) for RTX reverse mapping
    sequencer: VecDeque<(u16, u16, i32)>,
    started: bool,
}

impl Forwarder {
    fn remember(&mut self, egress_sn: u16, source_sn: u16, layer: i32) {
        self.sequencer.push_back((egress_sn, source_sn, layer));
        while self.sequencer.len() > SEQUENCER_HISTORY {
            self.sequencer.pop_front();
        }
    }

    fn lookup(&self, egress_sn: u16) -> Option<(u16, i32)> {
        self.sequencer
            .iter()
            .rev()
            .find(|(e, _, _)| *e == egress_sn)
            .map(|(_, s, l)| (*s, *l))
    }
}

struct Callbacks {
    on_binding: Option<OnBindingFn>,
    on_close: Option<OnCloseFn>,
    on_max_layer_changed: Option<OnMaxLayerChangedFn>,
    on_stats_update: Option<OnStatsUpdateFn>,
    on_rtt_update: Option<OnRttUpdateFn>,
    on_publication_error: Option<OnPublicationErrorFn>,
    receiver_report_listeners: Vec<ReceiverReportFn>,
}

pub struct DownTrack {
    id: TrackId,
    subscriber_id: SubscriberId,
    kind: TrackKind,
    ssrc: u32,
    payload_type: u8,
    stream_id: String,
    codec: RTCRtpCodecCapability,

    receiver: Mutex<Weak<dyn TrackReceiver>>,
    transport: Arc<dyn DownTrackTransport>,
    metrics: Metrics,

    state: AtomicU8,
    publisher_muted: AtomicBool,
    subscriber_muted: AtomicBool,
    rtt: AtomicU32,

    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    padding_sent: AtomicU64,
    write_errors_total: AtomicU64,
    consecutive_write_errors: AtomicU32,
    nacks_seen: AtomicU64,
    plis_seen: AtomicU64,

    // NTP middle bits of the last sender report, for RTT from reception reports
    last_sr: Mutex<Option<(u32, std::time::Instant)>>,
    // latest per-layer sender report relayed from the publisher side
    upstream_sender_reports: Mutex<[Option<RtcpSenderReportData>; 3]>,
    // latest availability snapshot from the receiver's bitrate reports
    bitrate_report: Mutex<(Vec<i32>, Bitrates)>,

    forwarder: Mutex<Forwarder>,
    callbacks: Mutex<Callbacks>,
}

impl DownTrack {
    #[must_use]
    pub fn new(
        id: TrackId,
        subscriber_id: SubscriberId,
        kind: TrackKind,
        codec: RTCRtpCodecCapability,
        payload_type: u8,
        stream_id: String,
        receiver: Weak<dyn TrackReceiver>,
        transport: Arc<dyn DownTrackTransport>,
        metrics: Metrics,
    ) -> Arc<Self> {
        let selector = match kind {
            TrackKind::Audio => VideoLayerSelector::for_mime(""),
            TrackKind::Video => VideoLayerSelector::for_mime(&codec.mime_type),
        };

        Arc::new(Self {
            id,
            subscriber_id,
            kind,
            ssrc: rand::random::<u32>(),
            payload_type,
            stream_id,
            codec,
            receiver: Mutex::new(receiver),
            transport,
            metrics,
            state: AtomicU8::new(DownTrackState::PreNegotiated as u8),
            publisher_muted: AtomicBool::new(false),
            subscriber_muted: AtomicBool::new(false),
            rtt: AtomicU32::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            padding_sent: AtomicU64::new(0),
            write_errors_total: AtomicU64::new(0),
            consecutive_write_errors: AtomicU32::new(0),
            nacks_seen: AtomicU64::new(0),
            plis_seen: AtomicU64::new(0),
            last_sr: Mutex::new(None),
            upstream_sender_reports: Mutex::new(Default::default()),
            bitrate_report: Mutex::new((Vec::new(), Bitrates::default())),
            forwarder: Mutex::new(Forwarder {
                selector,
                munger: RtpMunger::new(),
                sequencer: VecDeque::new(),
                started: false,
            }),
            callbacks: Mutex::new(Callbacks {
                on_binding: None,
                on_close: None,
                on_max_layer_changed: None,
                on_stats_update: None,
                on_rtt_update: None,
                on_publication_error: None,
                receiver_report_listeners: Vec::new(),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[must_use]
    pub fn codec(&self) -> &RTCRtpCodecCapability {
        &self.codec
    }

    #[must_use]
    pub fn state(&self) -> DownTrackState {
        DownTrackState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == DownTrackState::Closed
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        !matches!(self.state(), DownTrackState::PreNegotiated | DownTrackState::Closed)
    }

    pub fn on_binding(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().on_binding = Some(Arc::new(f));
    }

    pub fn on_close(&self, f: impl Fn(bool) + Send + Sync + 'static) {
        self.callbacks.lock().on_close = Some(Arc::new(f));
    }

    pub fn on_max_layer_changed(&self, f: impl Fn(i32) + Send + Sync + 'static) {
        self.callbacks.lock().on_max_layer_changed = Some(Arc::new(f));
    }

    pub fn on_stats_update(&self, f: impl Fn(&DownTrackStats) + Send + Sync + 'static) {
        self.callbacks.lock().on_stats_update = Some(Arc::new(f));
    }

    pub fn on_rtt_update(&self, f: impl Fn(u32) + Send + Sync + 'static) {
        self.callbacks.lock().on_rtt_update = Some(Arc::new(f));
    }

    pub fn on_publication_error(&self, f: impl Fn(&TrackId) + Send + Sync + 'static) {
        self.callbacks.lock().on_publication_error = Some(Arc::new(f));
    }

    pub fn add_receiver_report_listener(&self, f: impl Fn(&ReceiverReport) + Send + Sync + 'static) {
        self.callbacks.lock().receiver_report_listeners.push(Arc::new(f));
    }

    /// Transition out of pre-negotiation once the transport has a slot for
    /// this track; packets arriving before bind are discarded
    pub fn bind(&self) {
        if self
            .state
            .compare_exchange(
                DownTrackState::PreNegotiated as u8,
                DownTrackState::Bound as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        debug!(track_id = %self.id, subscriber_id = %self.subscriber_id, "down track bound");
        let callback = self.callbacks.lock().on_binding.clone();
        if let Some(f) = callback {
            f();
        }
    }

    /// Force re-translation at the next accepted packet
    pub fn resync(&self) {
        let mut forwarder = self.forwarder.lock();
        let ts_step = self.codec.clock_rate / 30;
        forwarder.munger.resync(ts_step.max(1));
        if self.kind == TrackKind::Video {
            forwarder.selector.set_current(VideoLayer::INVALID);
        }
    }

    pub fn set_publisher_muted(&self, muted: bool) {
        self.publisher_muted.store(muted, Ordering::Release);
        if muted {
            let _ = self.state.compare_exchange(
                DownTrackState::Active as u8,
                DownTrackState::Paused as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            // park the current layer so resume can prefer it
            let mut forwarder = self.forwarder.lock();
            let current = forwarder.selector.current();
            if current.is_valid() {
                forwarder.selector.set_parked(current);
                forwarder.selector.set_current(VideoLayer::INVALID);
            }
        } else {
            let _ = self.state.compare_exchange(
                DownTrackState::Paused as u8,
                DownTrackState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            self.resync();
            // need a decodable point to resume from
            if self.kind == TrackKind::Video {
                self.send_upstream_pli(false);
            }
        }
    }

    pub fn set_subscriber_muted(&self, muted: bool) {
        self.subscriber_muted.store(muted, Ordering::Release);
        if !muted {
            self.resync();
            if self.kind == TrackKind::Video {
                self.send_upstream_pli(true);
            }
        }
    }

    /// Cap the spatial/temporal layers this subscriber wants
    pub fn set_max_spatial_layer(&self, layer: i32) {
        {
            let mut forwarder = self.forwarder.lock();
            forwarder.selector.set_max_spatial(layer);
        }
        let callback = self.callbacks.lock().on_max_layer_changed.clone();
        if let Some(f) = callback {
            f(layer);
        }
    }

    pub fn set_max_temporal_layer(&self, layer: i32) {
        self.forwarder.lock().selector.set_max_temporal(layer);
    }

    pub fn update_max_layer(&self, layer: VideoLayer) {
        {
            let mut forwarder = self.forwarder.lock();
            forwarder.selector.set_max(layer);
        }
        let callback = self.callbacks.lock().on_max_layer_changed.clone();
        if let Some(f) = callback {
            f(layer.spatial);
        }
    }

    /// Target layer the allocator wants this subscriber on
    pub fn set_target_layer(&self, layer: VideoLayer) {
        let mut forwarder = self.forwarder.lock();
        forwarder.selector.set_target(layer);
        forwarder.selector.set_request_spatial(layer.spatial);
    }

    #[must_use]
    pub fn current_layer(&self) -> VideoLayer {
        self.forwarder.lock().selector.current()
    }

    #[must_use]
    pub fn target_layer(&self) -> VideoLayer {
        self.forwarder.lock().selector.target()
    }

    #[must_use]
    pub fn get_stats(&self) -> DownTrackStats {
        DownTrackStats {
            packets: self.packets_sent.load(Ordering::Relaxed),
            bytes: self.bytes_sent.load(Ordering::Relaxed),
            padding_packets: self.padding_sent.load(Ordering::Relaxed),
            write_errors: self.write_errors_total.load(Ordering::Relaxed),
            nacks: self.nacks_seen.load(Ordering::Relaxed),
            plis: self.plis_seen.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn rtt(&self) -> u32 {
        self.rtt.load(Ordering::Relaxed)
    }

    /// Last availability snapshot pushed by the receiver
    #[must_use]
    pub fn available_bitrates(&self) -> (Vec<i32>, Bitrates) {
        self.bitrate_report.lock().clone()
    }

    /// Most recent publisher sender report seen for a layer
    #[must_use]
    pub fn upstream_sender_report(&self, layer: i32) -> Option<RtcpSenderReportData> {
        if layer < 0 {
            return None;
        }
        self.upstream_sender_reports
            .lock()
            .get(layer as usize)
            .copied()
            .flatten()
    }

    fn send_upstream_pli(&self, force: bool) {
        let target = self.forwarder.lock().selector.target();
        if let Some(receiver) = self.receiver.lock().upgrade() {
            receiver.send_pli(target.spatial.max(0), force);
        }
    }

    fn egress(&self, header: Header, payload: Bytes) -> Result<usize> {
        let packet = Packet { header, payload };
        match self.transport.write_rtp(&packet) {
            Ok(n) => {
                self.consecutive_write_errors.store(0, Ordering::Relaxed);
                Ok(n)
            }
            Err(e) => {
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_write_error();
                let consecutive = self.consecutive_write_errors.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    track_id = %self.id,
                    subscriber_id = %self.subscriber_id,
                    error = %e,
                    "down track write failed"
                );
                if consecutive == WRITE_ERROR_THRESHOLD {
                    self.metrics.record_publication_error();
                    let callback = self.callbacks.lock().on_publication_error.clone();
                    if let Some(f) = callback {
                        f(&self.id);
                    }
                }
                Err(e)
            }
        }
    }

    fn write_selected(
        &self,
        ext_pkt: &ExtPacket,
        spatial_layer: i32,
        marker: bool,
        dependency_descriptor: Option<&Bytes>,
    ) -> Result<()> {
        let (sequence_number, timestamp) = {
            let mut forwarder = self.forwarder.lock();
            forwarder.started = true;
            let tp = match forwarder.munger.update_and_get_sn_ts(ext_pkt) {
                Ok(tp) => tp,
                Err(Error::DuplicatePacket | Error::PaddingOnlyPacket) => return Ok(()),
                Err(Error::OutOfOrderSequenceNumberCacheOnly) => return Ok(()),
                Err(e) => return Err(e),
            };
            forwarder.remember(
                tp.sequence_number,
                ext_pkt.packet.header.sequence_number,
                spatial_layer,
            );
            (tp.sequence_number, tp.timestamp)
        };

        // header is rebuilt rather than copied: uplink extensions and csrcs
        // have no meaning on the subscriber's peer connection
        let mut header = Header {
            version: 2,
            padding: ext_pkt.packet.header.padding,
            marker,
            payload_type: self.payload_type,
            sequence_number,
            timestamp,
            ssrc: self.ssrc,
            ..Default::default()
        };

        // the dependency descriptor is the one extension forwarded as-is
        if let Some(dd) = dependency_descriptor {
            header.extension = true;
            header.extension_profile = DD_EXTENSION_PROFILE;
            header.extensions = vec![Extension {
                id: DD_EXTENSION_ID,
                payload: dd.clone(),
            }];
        }

        let payload = ext_pkt.packet.payload.clone();
        let size = header.marshal_size() + payload.len();
        self.egress(header, payload)?;

        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
        self.metrics.record_forwarded(self.kind.as_str(), size);

        let sent = self.packets_sent.load(Ordering::Relaxed);
        if sent % 500 == 0 {
            let stats = self.get_stats();
            let callback = self.callbacks.lock().on_stats_update.clone();
            if let Some(f) = callback {
                f(&stats);
            }
        }
        Ok(())
    }

    /// Send one padding-only packet continuing the egress stream; used for
    /// flush on close and for bandwidth probing
    pub fn write_padding_packet(&self) -> Result<()> {
        let (sequence_number, timestamp) = {
            let mut forwarder = self.forwarder.lock();
            if !forwarder.started {
                return Err(Error::NotBound);
            }
            forwarder.munger.next_padding_sn_ts()
        };

        let header = Header {
            version: 2,
            padding: true,
            payload_type: self.payload_type,
            sequence_number,
            timestamp,
            ssrc: self.ssrc,
            ..Default::default()
        };

        self.egress(header, Bytes::new())?;
        self.padding_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close, optionally flushing a final padding packet so the subscriber
    /// does not stall waiting for an RTX gap to fill
    pub fn close_with_flush(&self, flush: bool) {
        let prev = self.state.swap(DownTrackState::Closed as u8, Ordering::AcqRel);
        if prev == DownTrackState::Closed as u8 {
            return;
        }

        if flush && prev == DownTrackState::Active as u8 {
            if let Err(e) = self.write_padding_packet() {
                debug!(track_id = %self.id, error = %e, "flush on close failed");
            }
        }

        debug!(track_id = %self.id, subscriber_id = %self.subscriber_id, "down track closed");
        let callback = self.callbacks.lock().on_close.clone();
        if let Some(f) = callback {
            // a publisher-muted track may come back; anything else is final
            f(self.publisher_muted.load(Ordering::Acquire));
        }
    }

    /// Handle RTCP arriving from the subscriber
    pub fn handle_rtcp(&self, packets: &[Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>]) {
        for packet in packets {
            let any = packet.as_any();

            if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                self.handle_receiver_report(rr);
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                self.nacks_seen.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_nack();
                let mut sns = Vec::new();
                for pair in &nack.nacks {
                    sns.extend(pair.packet_list());
                }
                self.retransmit(&sns);
            } else if any.downcast_ref::<PictureLossIndication>().is_some() {
                self.plis_seen.fetch_add(1, Ordering::Relaxed);
                self.send_upstream_pli(false);
            }
        }
    }

    fn handle_receiver_report(&self, rr: &ReceiverReport) {
        let listeners = self.callbacks.lock().receiver_report_listeners.clone();
        for listener in &listeners {
            listener(rr);
        }

        for report in &rr.reports {
            if report.ssrc != self.ssrc || report.last_sender_report == 0 {
                continue;
            }

            let last_sr = *self.last_sr.lock();
            if let Some((mid, sent_at)) = last_sr {
                if mid == report.last_sender_report {
                    let elapsed_ms = sent_at.elapsed().as_millis() as u64;
                    let delay_ms = u64::from(report.delay) * 1000 / 65_536;
                    let rtt = elapsed_ms.saturating_sub(delay_ms) as u32;
                    self.rtt.store(rtt, Ordering::Relaxed);
                    let callback = self.callbacks.lock().on_rtt_update.clone();
                    if let Some(f) = callback {
                        f(rtt);
                    }
                    if let Some(receiver) = self.receiver.lock().upgrade() {
                        receiver.set_rtt(rtt);
                    }
                }
            }
        }
    }

    fn retransmit(&self, egress_sns: &[u16]) {
        let Some(receiver) = self.receiver.lock().upgrade() else {
            return;
        };

        let mut scratch = vec![0u8; RTX_SCRATCH_SIZE];
        for egress_sn in egress_sns {
            let lookup = self.forwarder.lock().lookup(*egress_sn);
            let Some((source_sn, layer)) = lookup else {
                continue;
            };

            let n = match receiver.read_rtp(&mut scratch, layer.max(0) as u8, source_sn) {
                Ok(n) => n,
                Err(_) => continue, // aged out of the ring, quiet result
            };

            let mut raw = Bytes::copy_from_slice(&scratch[..n]);
            let Ok(mut packet) = Packet::unmarshal(&mut raw) else {
                continue;
            };
            packet.header.ssrc = self.ssrc;
            packet.header.payload_type = self.payload_type;
            packet.header.sequence_number = *egress_sn;
            packet.header.timestamp = self
                .forwarder
                .lock()
                .munger
                .translate_timestamp(packet.header.timestamp);

            let _ = self.egress(packet.header, packet.payload);
        }
    }

    /// Build a sender report translating our egress stream
    #[must_use]
    pub fn create_sender_report(&self) -> Option<SenderReport> {
        if !self.is_bound() {
            return None;
        }

        let forwarder = self.forwarder.lock();
        if !forwarder.started {
            return None;
        }
        let rtp_time = forwarder.munger.last_timestamp();
        drop(forwarder);

        let now = NtpTime::now();
        *self.last_sr.lock() = Some((now.middle_bits(), std::time::Instant::now()));

        Some(SenderReport {
            ssrc: self.ssrc,
            ntp_time: now.0,
            rtp_time,
            packet_count: self.packets_sent.load(Ordering::Relaxed) as u32,
            octet_count: self.bytes_sent.load(Ordering::Relaxed) as u32,
            ..Default::default()
        })
    }

    /// SDES chunks identifying this track to the subscriber
    #[must_use]
    pub fn create_source_description_chunks(&self) -> Vec<SourceDescriptionChunk> {
        vec![
            SourceDescriptionChunk {
                source: self.ssrc,
                items: vec![SourceDescriptionItem {
                    sdes_type: SdesType::SdesCname,
                    text: Bytes::from(self.stream_id.clone()),
                }],
            },
            SourceDescriptionChunk {
                source: self.ssrc,
                items: vec![SourceDescriptionItem {
                    sdes_type: SdesType::SdesName,
                    text: Bytes::from(self.id.to_string()),
                }],
            },
        ]
    }
}

impl TrackSender for DownTrack {
    fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id.clone()
    }

    fn write_rtp(&self, ext_pkt: &ExtPacket, spatial_layer: i32) -> Result<()> {
        match self.state() {
            DownTrackState::PreNegotiated | DownTrackState::Closed | DownTrackState::Paused => {
                return Ok(());
            }
            DownTrackState::Bound | DownTrackState::Active => {}
        }

        if self.subscriber_muted.load(Ordering::Acquire) || self.publisher_muted.load(Ordering::Acquire) {
            return Ok(());
        }

        // first packet through promotes to active
        let _ = self.state.compare_exchange(
            DownTrackState::Bound as u8,
            DownTrackState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if self.kind == TrackKind::Audio {
            return self.write_selected(ext_pkt, spatial_layer, ext_pkt.packet.header.marker, None);
        }

        let (result, waiting_for_key) = {
            let mut forwarder = self.forwarder.lock();
            let result = forwarder.selector.select(ext_pkt, spatial_layer);
            if !result.is_selected {
                forwarder.munger.packet_skipped(ext_pkt);
            }
            let waiting = !forwarder.selector.current().is_valid()
                && forwarder.selector.target().is_valid();
            (result, waiting)
        };

        if !result.is_selected {
            if waiting_for_key {
                // no decodable layer yet; ask the publisher for a key frame
                self.send_upstream_pli(false);
            }
            self.metrics.record_dropped("not_selected");
            return Ok(());
        }

        if result.is_resuming {
            debug!(track_id = %self.id, subscriber_id = %self.subscriber_id, "down track resuming");
        }

        self.write_selected(
            ext_pkt,
            spatial_layer,
            result.rtp_marker,
            result.dependency_descriptor.as_ref(),
        )
    }

    fn close(&self) {
        self.close_with_flush(true);
    }

    fn up_track_layers_change(&self) {
        // pick a new target within the subscriber's cap when the current
        // target went away; the bandwidth allocator may override later
        let Some(receiver) = self.receiver.lock().upgrade() else {
            return;
        };
        let (available, _) = receiver.get_layered_bitrate();

        let mut forwarder = self.forwarder.lock();
        let max = forwarder.selector.max();
        let target = forwarder.selector.target();
        if let Some(highest) = available.iter().copied().filter(|l| max.spatial < 0 || *l <= max.spatial).max() {
            if !target.is_valid() || !available.contains(&target.spatial) {
                let temporal = if target.is_valid() { target.temporal } else { max.temporal };
                forwarder.selector.set_target(VideoLayer::new(highest, temporal.max(0)));
                forwarder.selector.set_request_spatial(highest);
            }
        }
    }

    fn up_track_max_published_layer_change(&self, max_published_layer: i32) {
        self.forwarder.lock().selector.set_max_seen_spatial(max_published_layer);
    }

    fn up_track_max_temporal_layer_seen_change(&self, max_temporal_layer_seen: i32) {
        self.forwarder.lock().selector.set_max_seen_temporal(max_temporal_layer_seen);
    }

    fn up_track_bitrate_report(&self, available_layers: &[i32], bitrates: Bitrates) {
        *self.bitrate_report.lock() = (available_layers.to_vec(), bitrates);
    }

    fn handle_rtcp_sender_report(&self, _payload_type: u8, layer: i32, sr: &RtcpSenderReportData) {
        let mut reports = self.upstream_sender_reports.lock();
        if let Some(slot) = reports.get_mut(layer.max(0) as usize) {
            *slot = Some(*sr);
        }
    }
}
