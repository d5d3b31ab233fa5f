//! Per-layer uplink packet buffer
//!
//! One buffer per publisher layer. It keeps a ring of raw packets for NACK
//! retransmission, enriches packets into [`ExtPacket`]s for the forwarding
//! loop, generates NACK/PLI feedback towards the publisher, tracks audio
//! levels and frame rates, and records sender-report data used for
//! cross-layer timestamp alignment.

use crate::error::{Error, Result};
use crate::packet::ExtPacket;
use crate::types::{DEFAULT_MAX_LAYER_SPATIAL, DEFAULT_MAX_LAYER_TEMPORAL};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

/// Boxed RTCP packet emitted through feedback callbacks
pub type RtcpPacket = Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>;

pub type RtcpFeedbackFn = Arc<dyn Fn(Vec<RtcpPacket>) + Send + Sync>;
pub type SenderReportFn = Arc<dyn Fn(&RtcpSenderReportData) + Send + Sync>;
pub type TwccObserverFn = Arc<dyn Fn(u16, Instant, bool) + Send + Sync>;

const EXT_PACKET_CHANNEL_SIZE: usize = 512;
/// Half the 16-bit sequence space; beyond this a difference is "older"
const NEWER_THRESHOLD: u16 = 1 << 15;
/// Emit a NACK batch at most once per this many received packets
const NACK_CHECK_INTERVAL: u64 = 10;
/// Retries before a missing sequence number is abandoned
const NACK_MAX_TRIES: u8 = 10;
const FRAME_RATE_WINDOW: usize = 64;

/// NTP timestamp in Q32.32 fixed point, as carried in RTCP sender reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTime(pub u64);

impl NtpTime {
    /// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
    const UNIX_OFFSET_SECS: u64 = 2_208_988_800;

    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * f64::from(1u32 << 16) * f64::from(1u32 << 16)) as u64)
    }

    /// Current wall-clock time as an NTP timestamp
    #[must_use]
    pub fn now() -> Self {
        let since_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_secs_f64(since_unix.as_secs_f64() + Self::UNIX_OFFSET_SECS as f64)
    }

    /// Middle 32 bits, as echoed in reception reports
    #[must_use]
    pub fn middle_bits(&self) -> u32 {
        (self.0 >> 16) as u32
    }

    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / f64::from(1u32 << 16) / f64::from(1u32 << 16)
    }
}

/// Data from the most recent RTCP sender report on a layer
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcpSenderReportData {
    pub ntp_timestamp: NtpTime,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub byte_count: u32,
    pub at: Option<Instant>,
}

/// Audio level measurement parameters, see `AudioConfig`
#[derive(Debug, Clone)]
pub struct AudioLevelParams {
    pub active_level: u8,
    pub min_percentile: u8,
    pub observe_duration: Duration,
    pub smooth_intervals: u32,
}

/// Cumulative uplink stream statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub packets: u64,
    pub bytes: u64,
    pub nacks: u64,
    pub plis: u64,
    pub duplicates: u64,
}

struct NackEntry {
    sn: u16,
    tries: u8,
}

struct AudioLevelState {
    params: AudioLevelParams,
    window_start: Instant,
    observed: u32,
    active: u32,
    level_sum: u64,
    smoothed: VecDeque<(f64, bool)>,
}

impl AudioLevelState {
    fn observe(&mut self, level: u8, now: Instant) {
        self.observed += 1;
        self.level_sum += u64::from(level);
        if level <= self.params.active_level {
            self.active += 1;
        }

        if now.duration_since(self.window_start) >= self.params.observe_duration && self.observed > 0 {
            let pct = self.active * 100 / self.observed;
            let avg = self.level_sum as f64 / f64::from(self.observed);
            self.smoothed.push_back((avg, pct >= u32::from(self.params.min_percentile)));
            let keep = self.params.smooth_intervals.max(1) as usize;
            while self.smoothed.len() > keep {
                self.smoothed.pop_front();
            }
            self.window_start = now;
            self.observed = 0;
            self.active = 0;
            self.level_sum = 0;
        }
    }

    fn level(&self) -> Option<(f64, bool)> {
        if self.smoothed.is_empty() {
            return None;
        }
        let level =
            self.smoothed.iter().map(|(l, _)| l).sum::<f64>() / self.smoothed.len() as f64;
        let active = self.smoothed.iter().any(|(_, a)| *a);
        Some((level, active))
    }
}

struct FrameRateState {
    // distinct frame timestamps per (spatial, temporal)
    times: Vec<Vec<VecDeque<u32>>>,
}

impl FrameRateState {
    fn new() -> Self {
        let spatial = DEFAULT_MAX_LAYER_SPATIAL as usize + 1;
        let temporal = DEFAULT_MAX_LAYER_TEMPORAL as usize + 1;
        Self {
            times: (0..spatial)
                .map(|_| (0..temporal).map(|_| VecDeque::new()).collect())
                .collect(),
        }
    }

    fn observe(&mut self, spatial: i32, temporal: i32, ts: u32) {
        let s = spatial.clamp(0, DEFAULT_MAX_LAYER_SPATIAL) as usize;
        let t = temporal.clamp(0, DEFAULT_MAX_LAYER_TEMPORAL) as usize;
        let q = &mut self.times[s][t];
        if q.back() == Some(&ts) {
            return;
        }
        q.push_back(ts);
        while q.len() > FRAME_RATE_WINDOW {
            q.pop_front();
        }
    }

    fn fps(&self, spatial: i32, clock_rate: u32) -> Vec<f32> {
        let s = spatial.clamp(0, DEFAULT_MAX_LAYER_SPATIAL) as usize;
        self.times[s]
            .iter()
            .map(|q| {
                if q.len() < 2 {
                    return 0.0;
                }
                let span = q.back().unwrap().wrapping_sub(*q.front().unwrap());
                if span == 0 {
                    return 0.0;
                }
                (q.len() - 1) as f32 * clock_rate as f32 / span as f32
            })
            .collect()
    }
}

struct Inner {
    ring: Vec<Option<(u16, Bytes)>>,
    audio_level_ext_id: Option<u8>,
    started: bool,
    highest_sn: u16,
    missing: Vec<NackEntry>,
    packets_since_nack: u64,
    stats: StreamStats,
    sender_report: Option<RtcpSenderReportData>,
    last_pli: Option<Instant>,
    pli_throttle: Duration,
    rtt: u32,
    audio_level: Option<AudioLevelState>,
    frame_rates: FrameRateState,
    on_rtcp_feedback: Option<RtcpFeedbackFn>,
    on_rtcp_sender_report: Option<SenderReportFn>,
    twcc_observer: Option<TwccObserverFn>,
    ext_tx: Option<mpsc::Sender<ExtPacket>>,
}

/// Per-layer jitter/RTX buffer
pub struct Buffer {
    mime: String,
    clock_rate: u32,
    ssrc: u32,
    is_video: bool,
    closed: AtomicBool,
    paused: AtomicBool,
    inner: Mutex<Inner>,
    ext_rx: tokio::sync::Mutex<mpsc::Receiver<ExtPacket>>,
}

impl Buffer {
    #[must_use]
    pub fn new(mime: &str, clock_rate: u32, ssrc: u32, max_packets: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(EXT_PACKET_CHANNEL_SIZE);
        let is_video = mime.to_lowercase().starts_with("video/");

        Arc::new(Self {
            mime: mime.to_string(),
            clock_rate,
            ssrc,
            is_video,
            closed: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                ring: vec![None; max_packets.max(1)],
                audio_level_ext_id: None,
                started: false,
                highest_sn: 0,
                missing: Vec::new(),
                packets_since_nack: 0,
                stats: StreamStats::default(),
                sender_report: None,
                last_pli: None,
                pli_throttle: Duration::ZERO,
                rtt: 0,
                audio_level: None,
                frame_rates: FrameRateState::new(),
                on_rtcp_feedback: None,
                on_rtcp_sender_report: None,
                twcc_observer: None,
                ext_tx: Some(tx),
            }),
            ext_rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Id of the negotiated audio-level header extension, if any
    pub fn set_audio_level_extension_id(&self, ext_id: u8) {
        self.inner.lock().audio_level_ext_id = Some(ext_id);
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[must_use]
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn set_rtt(&self, rtt: u32) {
        self.inner.lock().rtt = rtt;
    }

    pub fn set_pli_throttle(&self, throttle: Duration) {
        self.inner.lock().pli_throttle = throttle;
    }

    pub fn set_audio_level_params(&self, params: AudioLevelParams) {
        let mut inner = self.inner.lock();
        inner.audio_level = Some(AudioLevelState {
            params,
            window_start: Instant::now(),
            observed: 0,
            active: 0,
            level_sum: 0,
            smoothed: VecDeque::new(),
        });
    }

    pub fn on_rtcp_feedback(&self, f: impl Fn(Vec<RtcpPacket>) + Send + Sync + 'static) {
        self.inner.lock().on_rtcp_feedback = Some(Arc::new(f));
    }

    pub fn on_rtcp_sender_report(&self, f: impl Fn(&RtcpSenderReportData) + Send + Sync + 'static) {
        self.inner.lock().on_rtcp_sender_report = Some(Arc::new(f));
    }

    pub fn set_twcc_observer(&self, f: impl Fn(u16, Instant, bool) + Send + Sync + 'static) {
        self.inner.lock().twcc_observer = Some(Arc::new(f));
    }

    /// Feed a raw uplink packet: store it for retransmission, update loss
    /// tracking and stats, and queue the enriched form for the forwarding
    /// loop.
    pub fn write_rtp(&self, raw: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::BufferClosed);
        }

        let mut cursor = raw.clone();
        let packet = Packet::unmarshal(&mut cursor).map_err(|_| Error::MalformedPacket)?;
        let now = Instant::now();
        let sn = packet.header.sequence_number;

        let (ext_tx, feedback, twcc) = {
            let mut inner = self.inner.lock();

            if !inner.started {
                inner.started = true;
                inner.highest_sn = sn.wrapping_sub(1);
            }

            let diff = sn.wrapping_sub(inner.highest_sn);
            if diff == 0 || self.ring_holds(&inner, sn) {
                inner.stats.duplicates += 1;
                return Err(Error::DuplicatePacket);
            }

            if diff < NEWER_THRESHOLD {
                if usize::from(diff) > inner.ring.len() {
                    // a jump beyond the ring is a restart, not a loss burst
                    inner.missing.clear();
                } else {
                    // every skipped number is a loss candidate
                    for missing in 1..diff {
                        let lost = inner.highest_sn.wrapping_add(missing);
                        inner.missing.push(NackEntry { sn: lost, tries: 0 });
                    }
                }
                inner.highest_sn = sn;
            } else {
                // late packet; drop if it has already left the ring
                let age = inner.highest_sn.wrapping_sub(sn);
                if usize::from(age) >= inner.ring.len() {
                    return Err(Error::PacketTooOld);
                }
                inner.missing.retain(|m| m.sn != sn);
            }

            let slot = usize::from(sn) % inner.ring.len();
            inner.ring[slot] = Some((sn, raw.clone()));

            inner.stats.packets += 1;
            inner.stats.bytes += raw.len() as u64;

            if let Some(ext_id) = inner.audio_level_ext_id {
                if let Some(state) = inner.audio_level.as_mut() {
                    if let Some(ext) = packet.header.get_extension(ext_id) {
                        if !ext.is_empty() && !self.paused.load(Ordering::Acquire) {
                            state.observe(ext[0] & 0x7F, now);
                        }
                    }
                }
            }

            inner.packets_since_nack += 1;
            let feedback = if inner.packets_since_nack >= NACK_CHECK_INTERVAL {
                inner.packets_since_nack = 0;
                self.drain_nacks(&mut inner)
            } else {
                None
            };

            (inner.ext_tx.clone(), feedback, inner.twcc_observer.clone())
        };

        if let Some(observer) = twcc {
            observer(sn, now, packet.header.marker);
        }
        if let Some(nack) = feedback {
            self.emit_rtcp(vec![nack]);
        }

        let ext = ExtPacket::from_packet(&self.mime, packet, raw, now);
        if self.is_video {
            let mut inner = self.inner.lock();
            let spatial = ext.spatial.max(0);
            let temporal = ext.video_layer.temporal.max(0);
            let ts = ext.packet.header.timestamp;
            inner.frame_rates.observe(spatial, temporal, ts);
        }

        if let Some(tx) = ext_tx {
            if let Err(e) = tx.try_send(ext) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(ssrc = self.ssrc, "ext packet channel full, dropping packet");
                    }
                    mpsc::error::TrySendError::Closed(_) => return Err(Error::BufferClosed),
                }
            }
        }

        Ok(())
    }

    fn ring_holds(&self, inner: &Inner, sn: u16) -> bool {
        let slot = usize::from(sn) % inner.ring.len();
        matches!(&inner.ring[slot], Some((stored, _)) if *stored == sn)
    }

    fn drain_nacks(&self, inner: &mut Inner) -> Option<RtcpPacket> {
        if self.paused.load(Ordering::Acquire) || inner.missing.is_empty() {
            return None;
        }

        let mut sns = Vec::with_capacity(inner.missing.len());
        inner.missing.retain_mut(|entry| {
            entry.tries += 1;
            sns.push(entry.sn);
            entry.tries < NACK_MAX_TRIES
        });

        if sns.is_empty() {
            return None;
        }
        inner.stats.nacks += 1;

        sns.sort_unstable();
        let mut pairs: Vec<NackPair> = Vec::new();
        for sn in sns {
            if let Some(last) = pairs.last_mut() {
                let distance = sn.wrapping_sub(last.packet_id);
                if distance > 0 && distance <= 16 {
                    last.lost_packets |= 1 << (distance - 1);
                    continue;
                }
            }
            pairs.push(NackPair {
                packet_id: sn,
                lost_packets: 0,
            });
        }

        Some(Box::new(TransportLayerNack {
            sender_ssrc: 0,
            media_ssrc: self.ssrc,
            nacks: pairs,
        }))
    }

    fn emit_rtcp(&self, packets: Vec<RtcpPacket>) {
        let callback = self.inner.lock().on_rtcp_feedback.clone();
        if let Some(f) = callback {
            f(packets);
        }
    }

    /// Issue a PLI towards the publisher, respecting the per-layer throttle
    pub fn send_pli(&self, force: bool) {
        let emit = {
            let mut inner = self.inner.lock();
            let throttled = match inner.last_pli {
                Some(at) => at.elapsed() < inner.pli_throttle,
                None => false,
            };
            if throttled && !force {
                false
            } else {
                inner.last_pli = Some(Instant::now());
                inner.stats.plis += 1;
                true
            }
        };

        if emit {
            debug!(ssrc = self.ssrc, force, "sending PLI");
            self.emit_rtcp(vec![Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: self.ssrc,
            })]);
        }
    }

    /// Copy a buffered packet for retransmission
    pub fn get_packet(&self, buf: &mut [u8], sn: u16) -> Result<usize> {
        let inner = self.inner.lock();
        let slot = usize::from(sn) % inner.ring.len();
        match &inner.ring[slot] {
            Some((stored, raw)) if *stored == sn => {
                if buf.len() < raw.len() {
                    return Err(Error::PacketNotFound);
                }
                buf[..raw.len()].copy_from_slice(raw);
                Ok(raw.len())
            }
            _ => Err(Error::PacketNotFound),
        }
    }

    /// Next enriched packet, or `BufferClosed` at end of stream
    pub async fn read_extended(&self) -> Result<ExtPacket> {
        let mut rx = self.ext_rx.lock().await;
        rx.recv().await.ok_or(Error::BufferClosed)
    }

    /// Record sender-report data arriving on this layer's RTCP stream
    pub fn set_sender_report(&self, ntp_timestamp: NtpTime, rtp_timestamp: u32, packet_count: u32, byte_count: u32) {
        let report = RtcpSenderReportData {
            ntp_timestamp,
            rtp_timestamp,
            packet_count,
            byte_count,
            at: Some(Instant::now()),
        };

        let callback = {
            let mut inner = self.inner.lock();
            inner.sender_report = Some(report);
            inner.on_rtcp_sender_report.clone()
        };

        if let Some(f) = callback {
            f(&report);
        }
    }

    #[must_use]
    pub fn get_sender_report_data(&self) -> Option<RtcpSenderReportData> {
        self.inner.lock().sender_report
    }

    /// Smoothed audio level and activity flag; `None` until a full window
    /// has been observed
    #[must_use]
    pub fn get_audio_level(&self) -> Option<(f64, bool)> {
        self.inner.lock().audio_level.as_ref().and_then(AudioLevelState::level)
    }

    /// Frames/second per temporal layer for a spatial layer
    #[must_use]
    pub fn get_temporal_layer_fps_for_spatial(&self, spatial: i32) -> Vec<f32> {
        self.inner.lock().frame_rates.fps(spatial, self.clock_rate)
    }

    #[must_use]
    pub fn get_stats(&self) -> StreamStats {
        self.inner.lock().stats
    }

    /// Close the buffer; the forwarding loop observes end-of-stream on its
    /// next read
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.lock().ext_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::header::Header;
    use webrtc::util::Marshal;

    fn raw_packet(sn: u16, ts: u32, payload_len: usize) -> Bytes {
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: 111,
                sequence_number: sn,
                timestamp: ts,
                ssrc: 0xCAFE,
                ..Default::default()
            },
            payload: Bytes::from(vec![0xABu8; payload_len]),
        };
        packet.marshal().unwrap()
    }

    fn test_buffer() -> Arc<Buffer> {
        Buffer::new("audio/opus", 48_000, 0xCAFE, 16)
    }

    #[test]
    fn duplicates_are_discarded() {
        let buffer = test_buffer();
        buffer.write_rtp(raw_packet(10, 1000, 5)).unwrap();
        assert!(matches!(
            buffer.write_rtp(raw_packet(10, 1000, 5)),
            Err(Error::DuplicatePacket)
        ));
        assert_eq!(buffer.get_stats().packets, 1);
        assert_eq!(buffer.get_stats().duplicates, 1);
    }

    #[test]
    fn wraparound_is_treated_as_newer() {
        let buffer = test_buffer();
        buffer.write_rtp(raw_packet(65_534, 1000, 5)).unwrap();
        buffer.write_rtp(raw_packet(65_535, 1480, 5)).unwrap();
        buffer.write_rtp(raw_packet(0, 1960, 5)).unwrap();
        buffer.write_rtp(raw_packet(1, 2440, 5)).unwrap();
        assert_eq!(buffer.get_stats().packets, 4);

        let mut scratch = [0u8; 256];
        assert!(buffer.get_packet(&mut scratch, 0).is_ok());
        assert!(buffer.get_packet(&mut scratch, 65_535).is_ok());
    }

    #[test]
    fn too_old_packets_are_rejected() {
        let buffer = test_buffer();
        buffer.write_rtp(raw_packet(100, 1000, 5)).unwrap();
        // ring holds 16 packets; 100-17 is outside
        assert!(matches!(
            buffer.write_rtp(raw_packet(83, 0, 5)),
            Err(Error::PacketTooOld)
        ));
        // within the ring a late packet is accepted
        buffer.write_rtp(raw_packet(99, 520, 5)).unwrap();
    }

    #[test]
    fn rtx_lookup_reports_missing_packets() {
        let buffer = test_buffer();
        buffer.write_rtp(raw_packet(7, 1000, 5)).unwrap();
        let mut scratch = [0u8; 256];
        let n = buffer.get_packet(&mut scratch, 7).unwrap();
        assert!(n > 0);
        assert!(matches!(
            buffer.get_packet(&mut scratch, 8),
            Err(Error::PacketNotFound)
        ));
    }

    #[test]
    fn gap_generates_nack_feedback() {
        let buffer = test_buffer();
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        buffer.on_rtcp_feedback(move |packets| {
            seen_in_cb.lock().push(packets.len() as u32);
        });

        buffer.write_rtp(raw_packet(1, 0, 5)).unwrap();
        // skip 2..=4 and push enough packets to hit the nack interval
        for sn in 5..15 {
            buffer.write_rtp(raw_packet(sn, u32::from(sn) * 480, 5)).unwrap();
        }
        assert!(!seen.lock().is_empty());
    }

    #[test]
    fn pli_is_throttled_unless_forced() {
        let buffer = test_buffer();
        buffer.set_pli_throttle(Duration::from_secs(60));
        let count = Arc::new(Mutex::new(0u32));
        let count_in_cb = count.clone();
        buffer.on_rtcp_feedback(move |_| {
            *count_in_cb.lock() += 1;
        });

        buffer.send_pli(false);
        buffer.send_pli(false); // throttled
        buffer.send_pli(true); // bypasses
        assert_eq!(*count.lock(), 2);
    }

    #[tokio::test]
    async fn read_extended_returns_packets_then_eof() {
        let buffer = test_buffer();
        buffer.write_rtp(raw_packet(42, 1000, 3)).unwrap();

        let ext = buffer.read_extended().await.unwrap();
        assert_eq!(ext.packet.header.sequence_number, 42);

        buffer.close();
        assert!(matches!(buffer.read_extended().await, Err(Error::BufferClosed)));
        assert!(matches!(
            buffer.write_rtp(raw_packet(43, 1480, 3)),
            Err(Error::BufferClosed)
        ));
    }

    #[test]
    fn audio_level_extension_is_observed() {
        use webrtc::rtp::header::Extension;

        let buffer = test_buffer();
        buffer.set_audio_level_extension_id(1);
        buffer.set_audio_level_params(AudioLevelParams {
            active_level: 35,
            min_percentile: 40,
            observe_duration: Duration::ZERO,
            smooth_intervals: 1,
        });

        for i in 0..3u16 {
            let packet = Packet {
                header: Header {
                    version: 2,
                    payload_type: 111,
                    sequence_number: 200 + i,
                    timestamp: u32::from(i) * 480,
                    ssrc: 0xCAFE,
                    extension: true,
                    extension_profile: 0xBEDE,
                    extensions: vec![Extension {
                        // V=1, level 20 dBov (louder than the threshold)
                        payload: Bytes::from_static(&[0x80 | 20]),
                        id: 1,
                    }],
                    ..Default::default()
                },
                payload: Bytes::from_static(&[1, 2, 3]),
            };
            buffer.write_rtp(packet.marshal().unwrap()).unwrap();
        }

        let (level, active) = buffer.get_audio_level().unwrap();
        assert!(active);
        assert!((level - 20.0).abs() < 1e-9);
    }

    #[test]
    fn sender_report_data_is_stored_and_forwarded() {
        let buffer = test_buffer();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_cb = seen.clone();
        buffer.on_rtcp_sender_report(move |sr| {
            *seen_in_cb.lock() = Some(sr.rtp_timestamp);
        });

        buffer.set_sender_report(NtpTime::from_secs_f64(1000.0), 90_000, 10, 1000);
        assert_eq!(*seen.lock(), Some(90_000));
        let stored = buffer.get_sender_report_data().unwrap();
        assert_eq!(stored.rtp_timestamp, 90_000);
        assert!((stored.ntp_timestamp.as_secs_f64() - 1000.0).abs() < 1e-6);
    }
}
