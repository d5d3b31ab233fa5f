use super::{Base, SelectorResult};
use crate::packet::ExtPacket;

/// H.264 simulcast selector
///
/// Treated as single-layer per uplink: no temporal structure is parsed, and
/// layer moves (or resyncs) only complete at IDR boundaries.
#[derive(Debug, Default)]
pub struct H264 {
    pub(crate) base: Base,
}

impl H264 {
    pub fn select(&mut self, ext_pkt: &ExtPacket, layer: i32) -> SelectorResult {
        self.base.select_simulcast(ext_pkt, layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CodecDescriptor;
    use crate::types::VideoLayer;
    use bytes::Bytes;
    use std::time::Instant;
    use webrtc::rtp::header::Header;
    use webrtc::rtp::packet::Packet;

    fn h264_packet(key_frame: bool) -> ExtPacket {
        ExtPacket {
            arrival: Instant::now(),
            packet: Packet {
                header: Header {
                    version: 2,
                    sequence_number: 3,
                    timestamp: 9000,
                    ssrc: 0xABCD,
                    ..Default::default()
                },
                payload: Bytes::from_static(&[0x65, 0, 0]),
            },
            raw_packet: Bytes::new(),
            key_frame,
            video_layer: VideoLayer::INVALID,
            spatial: -1,
            descriptor: CodecDescriptor::H264,
        }
    }

    #[test]
    fn resumes_only_at_idr() {
        let mut selector = H264::default();
        selector.base.target_layer = VideoLayer::new(0, 0);

        assert!(!selector.select(&h264_packet(false), 0).is_selected);

        let result = selector.select(&h264_packet(true), 0);
        assert!(result.is_selected);
        assert!(result.is_resuming);
        assert_eq!(selector.base.current_layer.spatial, 0);

        // once locked, delta frames flow
        assert!(selector.select(&h264_packet(false), 0).is_selected);
    }

    #[test]
    fn parked_layer_takes_precedence_on_resume() {
        let mut selector = H264::default();
        selector.base.current_layer = VideoLayer::INVALID;
        selector.base.target_layer = VideoLayer::new(1, 0);
        selector.base.parked_layer = VideoLayer::new(0, 0);

        // key frame on the target layer is ignored while parked elsewhere
        assert!(!selector.select(&h264_packet(true), 1).is_selected);

        let result = selector.select(&h264_packet(true), 0);
        assert!(result.is_selected);
        assert!(!selector.base.parked_layer.is_valid());
    }
}
