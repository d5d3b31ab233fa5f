//! RED (RFC 2198) audio redundancy
//!
//! Two wrapper receivers share this module: [`RedReceiver`] packs recent
//! primary packets alongside the current one for subscribers that negotiated
//! RED, and [`RedPrimaryReceiver`] unpacks a RED uplink back into primary
//! packets, recovering single losses from the redundancy blocks.

mod decoder;
mod encoder;

pub use decoder::RedPrimaryReceiver;
pub use encoder::RedReceiver;

use crate::error::{Error, Result};
use crate::receiver::Receiver;
use crate::spreader::{DownTrackSpreader, TrackSender};
use castmux_core::{SubscriberId, TrackId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::info;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;

/// State shared by both wrapper receivers: a weak handle to the wrapped
/// receiver, cached identity so accessors survive the parent, an own
/// spreader and a closed flag.
pub(crate) struct WrapperCore {
    parent: Weak<Receiver>,
    track_id: TrackId,
    stream_id: String,
    codec: RTCRtpCodecParameters,
    kind: crate::types::TrackKind,
    track_info: crate::types::TrackInfo,
    closed: AtomicBool,
    pub(crate) spreader: DownTrackSpreader,
}

impl WrapperCore {
    fn new(parent: &Arc<Receiver>, lb_threshold: usize) -> Self {
        use crate::receiver::TrackReceiver;
        Self {
            track_id: parent.track_id(),
            stream_id: parent.stream_id(),
            codec: parent.codec(),
            kind: parent.kind(),
            track_info: parent.track_info(),
            parent: Arc::downgrade(parent),
            closed: AtomicBool::new(false),
            spreader: DownTrackSpreader::new(lb_threshold),
        }
    }

    fn parent(&self) -> Option<Arc<Receiver>> {
        self.parent.upgrade()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn add_down_track(&self, sender: Arc<dyn TrackSender>) -> Result<()> {
        if self.is_closed() {
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

        self.spreader.store(sender);
        Ok(())
    }

    fn delete_down_track(&self, subscriber_id: &SubscriberId) {
        if self.is_closed() {
            return;
        }
        self.spreader.free(subscriber_id);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for dt in self.spreader.reset_and_get_down_tracks().iter() {
            dt.close();
        }
    }

    fn can_close(&self) -> bool {
        self.is_closed() || self.spreader.down_track_count() == 0
    }
}

/// Both wrappers present the parent's read surface; retransmission lookups
/// always refuse (synthesized streams have no retransmittable history).
macro_rules! impl_wrapped_receiver {
    ($wrapper:ident) => {
        impl crate::receiver::TrackReceiver for $wrapper {
            fn track_id(&self) -> castmux_core::TrackId {
                self.core.track_id.clone()
            }

            fn stream_id(&self) -> String {
                self.core.stream_id.clone()
            }

            fn codec(&self) -> webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters {
                self.core.codec.clone()
            }

            fn kind(&self) -> crate::types::TrackKind {
                self.core.kind
            }

            fn track_info(&self) -> crate::types::TrackInfo {
                self.core.track_info.clone()
            }

            fn is_closed(&self) -> bool {
                self.core.is_closed()
            }

            fn read_rtp(&self, _buf: &mut [u8], _layer: u8, _sn: u16) -> crate::error::Result<usize> {
                // red encodings do not support nack
                Err(crate::error::Error::PacketNotFound)
            }

            fn get_layered_bitrate(&self) -> (Vec<i32>, crate::types::Bitrates) {
                self.core
                    .parent()
                    .map(|p| crate::receiver::TrackReceiver::get_layered_bitrate(&*p))
                    .unwrap_or_default()
            }

            fn get_audio_level(&self) -> Option<(f64, bool)> {
                self.core
                    .parent()
                    .and_then(|p| crate::receiver::TrackReceiver::get_audio_level(&*p))
            }

            fn send_pli(&self, layer: i32, force: bool) {
                if let Some(p) = self.core.parent() {
                    crate::receiver::TrackReceiver::send_pli(&*p, layer, force);
                }
            }

            fn set_up_track_paused(&self, paused: bool) {
                if let Some(p) = self.core.parent() {
                    crate::receiver::TrackReceiver::set_up_track_paused(&*p, paused);
                }
            }

            fn set_max_expected_spatial_layer(&self, layer: i32) {
                if let Some(p) = self.core.parent() {
                    crate::receiver::TrackReceiver::set_max_expected_spatial_layer(&*p, layer);
                }
            }

            fn set_rtt(&self, rtt: u32) {
                if let Some(p) = self.core.parent() {
                    crate::receiver::TrackReceiver::set_rtt(&*p, rtt);
                }
            }

            fn add_down_track(
                &self,
                sender: std::sync::Arc<dyn crate::spreader::TrackSender>,
            ) -> crate::error::Result<()> {
                self.core.add_down_track(sender)
            }

            fn delete_down_track(&self, subscriber_id: &castmux_core::SubscriberId) {
                self.core.delete_down_track(subscriber_id);
            }

            fn get_temporal_layer_fps_for_spatial(&self, layer: i32) -> Vec<f32> {
                self.core
                    .parent()
                    .map(|p| crate::receiver::TrackReceiver::get_temporal_layer_fps_for_spatial(&*p, layer))
                    .unwrap_or_default()
            }

            fn get_reference_layer_rtp_timestamp(
                &self,
                ts: u32,
                layer: i32,
                reference_layer: i32,
            ) -> crate::error::Result<u32> {
                let p = self
                    .core
                    .parent()
                    .ok_or(crate::error::Error::ReceiverClosed)?;
                crate::receiver::TrackReceiver::get_reference_layer_rtp_timestamp(
                    &*p,
                    ts,
                    layer,
                    reference_layer,
                )
            }

            fn get_primary_receiver_for_red(
                self: std::sync::Arc<Self>,
            ) -> std::sync::Arc<dyn crate::receiver::TrackReceiver> {
                self
            }

            fn get_red_receiver(
                self: std::sync::Arc<Self>,
            ) -> std::sync::Arc<dyn crate::receiver::TrackReceiver> {
                self
            }
        }
    };
}

pub(crate) use impl_wrapped_receiver;

/// History depth of the encoder; bounded by what fits a 14-bit ts offset
pub(crate) const MAX_RED_COUNT: usize = 2;
pub(crate) const MTU_SIZE: usize = 1500;

// chrome and other native webrtc clients negotiate opus at payload 111, so a
// fixed block payload type avoids re-encoding the header blocks per down
// track with a different opus payload type
pub(crate) const OPUS_PT: u8 = 111;

/// One redundancy block parsed from a RED payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RedBlock {
    pub ts_offset: u32,
    pub start: usize,
    pub len: usize,
}

/// Encode `red_pkts` (oldest first) as redundancy ahead of `primary`.
///
/// ```text
///  0                   1                    2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3  4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |F|   block PT  |  timestamp offset         |   block length    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// F=1 while further header blocks follow; the final block header is the
/// single byte `0|PT`. Returns the encoded length.
pub(crate) fn encode_red_for_primary(
    red_pkts: &[&Packet],
    primary: &Packet,
    red_payload: &mut [u8],
) -> Result<usize> {
    let mut payload_size = primary.payload.len() + 1;
    for p in red_pkts {
        payload_size += p.payload.len() + 4;
    }

    // encode the primary alone when redundancy would overflow the buffer
    let red_pkts: &[&Packet] = if payload_size > red_payload.len() {
        &[]
    } else {
        red_pkts
    };

    let mut index = 0;
    for p in red_pkts {
        let mut header = u32::from(0x80 | OPUS_PT);
        header <<= 14;
        header |= primary.header.timestamp.wrapping_sub(p.header.timestamp) & 0x3FFF;
        header <<= 10;
        header |= p.payload.len() as u32 & 0x3FF;
        red_payload[index..index + 4].copy_from_slice(&header.to_be_bytes());
        index += 4;
    }

    // last block header
    if red_payload.len() <= index {
        return Err(Error::RedPayloadTooLarge(payload_size));
    }
    red_payload[index] = OPUS_PT;
    index += 1;

    for p in red_pkts.iter().copied().chain(std::iter::once(primary)) {
        if red_payload.len() < index + p.payload.len() {
            return Err(Error::RedPayloadTooLarge(p.payload.len()));
        }
        red_payload[index..index + p.payload.len()].copy_from_slice(&p.payload);
        index += p.payload.len();
    }

    Ok(index)
}

/// Parse a RED payload into its redundancy blocks (oldest first) and the
/// byte range of the primary encoding
pub(crate) fn parse_red_payload(payload: &[u8]) -> Result<(Vec<RedBlock>, usize)> {
    let mut blocks = Vec::with_capacity(MAX_RED_COUNT);
    let mut index = 0;

    loop {
        if index >= payload.len() {
            return Err(Error::MalformedRedPayload("truncated header block"));
        }

        if payload[index] & 0x80 == 0 {
            // final single-byte header; primary payload follows the blocks
            index += 1;
            break;
        }

        if index + 4 > payload.len() {
            return Err(Error::MalformedRedPayload("short header block"));
        }
        let header = u32::from_be_bytes([
            payload[index],
            payload[index + 1],
            payload[index + 2],
            payload[index + 3],
        ]);
        blocks.push(RedBlock {
            ts_offset: (header >> 10) & 0x3FFF,
            start: 0,
            len: (header & 0x3FF) as usize,
        });
        index += 4;
    }

    for block in &mut blocks {
        if index + block.len > payload.len() {
            return Err(Error::MalformedRedPayload("truncated data block"));
        }
        block.start = index;
        index += block.len;
    }

    Ok((blocks, index))
}

/// Extract only the primary encoding from a RED payload
pub(crate) fn extract_primary_payload(payload: &[u8]) -> Result<&[u8]> {
    let (_, primary_start) = parse_red_payload(payload)?;
    Ok(&payload[primary_start..])
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use bytes::Bytes;
    use webrtc::rtp::header::Header;
    use webrtc::util::Marshal;

    pub const TS_STEP: u32 = 48_000 / 1000 * 10;

    /// Packets whose payload is their own marshaled header, matching nothing
    /// but unique per sequence number
    pub fn generate_pkts(mut header: Header, count: usize, ts_step: u32) -> Vec<Packet> {
        let mut pkts = Vec::with_capacity(count);
        for _ in 0..count {
            let hbuf = header.marshal().unwrap();
            pkts.push(Packet {
                header: header.clone(),
                payload: hbuf,
            });
            header.sequence_number = header.sequence_number.wrapping_add(1);
            header.timestamp = header.timestamp.wrapping_add(ts_step);
        }
        pkts
    }

    pub fn base_header() -> Header {
        Header {
            version: 2,
            payload_type: OPUS_PT,
            sequence_number: 65_534,
            timestamp: (1u32 << 31) - 2 * TS_STEP,
            ssrc: 0x5EED,
            ..Default::default()
        }
    }

    /// RED-encode a packet sequence the way the encoder would, with
    /// `red_count` prior packets as redundancy
    pub fn generate_red_pkts(pkts: &[Packet], red_count: usize) -> Vec<Packet> {
        let mut red_pkts = Vec::with_capacity(pkts.len());
        for (i, pkt) in pkts.iter().enumerate() {
            let from = i.saturating_sub(red_count);
            let encoding: Vec<&Packet> = pkts[from..i].iter().collect();
            let mut buf = vec![0u8; MTU_SIZE];
            let encoded = encode_red_for_primary(&encoding, pkt, &mut buf).unwrap();
            buf.truncate(encoded);
            red_pkts.push(Packet {
                header: pkt.header.clone(),
                payload: Bytes::from(buf),
            });
        }
        red_pkts
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn round_trip_primary_extraction() {
        let pkts = generate_pkts(base_header(), 10, TS_STEP);
        let red_pkts = generate_red_pkts(&pkts, 2);

        for (red, original) in red_pkts.iter().zip(&pkts) {
            let primary = extract_primary_payload(&red.payload).unwrap();
            assert_eq!(primary, original.payload.as_ref());
        }
    }

    #[test]
    fn bounded_overhead() {
        let pkts = generate_pkts(base_header(), 10, TS_STEP);
        let red_pkts = generate_red_pkts(&pkts, 2);

        for (i, red) in red_pkts.iter().enumerate() {
            let history: usize = pkts[i.saturating_sub(2)..i].iter().map(|p| p.payload.len()).sum();
            let blocks = i.min(2);
            assert!(red.payload.len() <= pkts[i].payload.len() + history + 1 + 4 * blocks);
        }
    }

    #[test]
    fn parse_reports_block_layout() {
        let pkts = generate_pkts(base_header(), 3, TS_STEP);
        let red_pkts = generate_red_pkts(&pkts, 2);

        let (blocks, primary_start) = parse_red_payload(&red_pkts[2].payload).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].ts_offset, 2 * TS_STEP);
        assert_eq!(blocks[1].ts_offset, TS_STEP);
        assert_eq!(
            &red_pkts[2].payload[blocks[0].start..blocks[0].start + blocks[0].len],
            pkts[0].payload.as_ref()
        );
        assert_eq!(&red_pkts[2].payload[primary_start..], pkts[2].payload.as_ref());
    }

    #[test]
    fn malformed_payloads_error() {
        assert!(parse_red_payload(&[]).is_err());
        assert!(parse_red_payload(&[0x80 | OPUS_PT, 0x01]).is_err());
        // claims a 100-byte block with no data
        let bogus = [0x80 | OPUS_PT, 0x00, 0x00, 100, OPUS_PT];
        assert!(parse_red_payload(&bogus).is_err());
    }
}
