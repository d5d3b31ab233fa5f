//! Extended RTP packet model
//!
//! The buffer enriches every uplink packet with decoded metadata before it is
//! fanned out: codec descriptor, key-frame flag and the packet's SVC layer
//! coordinates. Down-track selectors only ever look at this enriched form.

use crate::types::VideoLayer;
use bytes::Bytes;
use std::time::Instant;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

/// Minimal view of the AV1 dependency descriptor header extension.
///
/// Only the mandatory fields are decoded; the raw bytes are carried along so
/// a down track can forward the descriptor unmodified.
#[derive(Debug, Clone, Default)]
pub struct Av1Descriptor {
    pub start_of_frame: bool,
    pub end_of_frame: bool,
    pub template_id: u8,
    pub frame_number: u16,
    pub raw: Bytes,
}

impl Av1Descriptor {
    /// Parse the three mandatory descriptor bytes; `None` for short payloads
    #[must_use]
    pub fn parse(raw: &Bytes) -> Option<Self> {
        if raw.len() < 3 {
            return None;
        }
        Some(Self {
            start_of_frame: raw[0] & 0x80 != 0,
            end_of_frame: raw[0] & 0x40 != 0,
            template_id: raw[0] & 0x3F,
            frame_number: (u16::from(raw[1]) << 8) | u16::from(raw[2]),
            raw: raw.clone(),
        })
    }
}

/// Codec-specific descriptor decoded from the payload
#[derive(Debug, Clone)]
pub enum CodecDescriptor {
    None,
    Vp8(Vp8Packet),
    Vp9(Vp9Packet),
    Av1(Av1Descriptor),
    H264,
}

impl CodecDescriptor {
    #[must_use]
    pub fn as_vp8(&self) -> Option<&Vp8Packet> {
        match self {
            Self::Vp8(d) => Some(d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_vp9(&self) -> Option<&Vp9Packet> {
        match self {
            Self::Vp9(d) => Some(d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_av1(&self) -> Option<&Av1Descriptor> {
        match self {
            Self::Av1(d) => Some(d),
            _ => None,
        }
    }
}

/// An RTP packet enriched with decoded metadata
#[derive(Debug, Clone)]
pub struct ExtPacket {
    pub arrival: Instant,
    pub packet: Packet,
    /// Marshaled wire form, kept for size accounting and RTX
    pub raw_packet: Bytes,
    pub key_frame: bool,
    /// SVC/simulcast coordinates of this packet; `INVALID` when the codec
    /// carries no layer information
    pub video_layer: VideoLayer,
    /// Spatial layer for tracker dispatch; `-1` when the uplink layer index
    /// applies (non-SVC)
    pub spatial: i32,
    pub descriptor: CodecDescriptor,
}

impl ExtPacket {
    /// Enrich a decoded RTP packet for the given codec mime type
    #[must_use]
    pub fn from_packet(mime: &str, packet: Packet, raw_packet: Bytes, arrival: Instant) -> Self {
        let mut ep = Self {
            arrival,
            packet,
            raw_packet,
            key_frame: false,
            video_layer: VideoLayer::INVALID,
            spatial: -1,
            descriptor: CodecDescriptor::None,
        };

        match mime.to_lowercase().as_str() {
            "video/vp8" => {
                let mut vp8 = Vp8Packet::default();
                if let Ok(frame) = vp8.depacketize(&ep.packet.payload) {
                    // P bit of the VP8 frame header: 0 = key frame; only
                    // meaningful on the first packet of the first partition
                    ep.key_frame =
                        vp8.s == 1 && vp8.pid == 0 && !frame.is_empty() && frame[0] & 0x01 == 0;
                    ep.video_layer = VideoLayer::new(-1, i32::from(vp8.tid));
                    ep.descriptor = CodecDescriptor::Vp8(vp8);
                }
            }
            "video/vp9" => {
                let mut vp9 = Vp9Packet::default();
                if vp9.depacketize(&ep.packet.payload).is_ok() {
                    ep.key_frame = !vp9.p && vp9.b;
                    ep.video_layer = VideoLayer::new(i32::from(vp9.sid), i32::from(vp9.tid));
                    ep.spatial = i32::from(vp9.sid);
                    ep.descriptor = CodecDescriptor::Vp9(vp9);
                }
            }
            "video/h264" => {
                ep.key_frame = is_h264_keyframe(&ep.packet.payload);
                ep.descriptor = CodecDescriptor::H264;
            }
            _ => {}
        }

        ep
    }

    /// Attach an AV1 dependency descriptor extracted from header extensions
    pub fn with_av1_descriptor(mut self, dd: Av1Descriptor) -> Self {
        self.key_frame = self.key_frame || (dd.start_of_frame && dd.frame_number == 0);
        self.descriptor = CodecDescriptor::Av1(dd);
        self
    }
}

/// IDR detection, including STAP-A aggregates
#[must_use]
pub fn is_h264_keyframe(payload: &Bytes) -> bool {
    if payload.is_empty() {
        return false;
    }

    const NALU_TYPE_MASK: u8 = 0x1F;
    const TYPE_SPS: u8 = 7;
    const TYPE_IDR: u8 = 5;
    const TYPE_STAP_A: u8 = 24;

    match payload[0] & NALU_TYPE_MASK {
        TYPE_SPS | TYPE_IDR => true,
        TYPE_STAP_A => {
            let mut offset = 1;
            while offset + 2 < payload.len() {
                let size = (usize::from(payload[offset]) << 8) | usize::from(payload[offset + 1]);
                offset += 2;
                if offset >= payload.len() || size == 0 {
                    break;
                }
                match payload[offset] & NALU_TYPE_MASK {
                    TYPE_SPS | TYPE_IDR => return true,
                    _ => offset += size,
                }
            }
            false
        }
        _ => false,
    }
}
