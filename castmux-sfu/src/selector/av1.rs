use super::{Base, SelectorResult};
use crate::packet::ExtPacket;
use crate::types::VideoLayer;

/// AV1 SVC selector
///
/// Switch decisions ride on the dependency descriptor: upward moves complete
/// at frames that start a decode target (start-of-frame on a key picture),
/// downward moves at end-of-frame. The descriptor bytes are surfaced in the
/// result so the down track forwards them with the rewritten packet.
#[derive(Debug, Default)]
pub struct Av1 {
    pub(crate) base: Base,
}

impl Av1 {
    pub fn select(&mut self, ext_pkt: &ExtPacket, _layer: i32) -> SelectorResult {
        let mut result = SelectorResult::default();

        let Some(dd) = ext_pkt.descriptor.as_av1() else {
            return result;
        };

        let mut current_layer = self.base.current_layer;
        if self.base.current_layer != self.base.target_layer {
            let mut updated_layer = self.base.current_layer;

            if !self.base.current_layer.is_valid() {
                if !ext_pkt.key_frame || !dd.start_of_frame {
                    return result;
                }
                updated_layer = if ext_pkt.video_layer.is_valid() {
                    ext_pkt.video_layer
                } else {
                    VideoLayer::new(self.base.target_layer.spatial.max(0), self.base.target_layer.temporal.max(0))
                };
            } else {
                let packet_layer = ext_pkt.video_layer;

                // decode-target switch points: a key picture start lets the
                // stream move up, a frame end lets it settle down
                if self.base.current_layer.spatial < self.base.target_layer.spatial
                    && packet_layer.spatial > self.base.current_layer.spatial
                    && packet_layer.spatial <= self.base.target_layer.spatial
                    && ext_pkt.key_frame
                    && dd.start_of_frame
                {
                    current_layer.spatial = packet_layer.spatial;
                    updated_layer.spatial = packet_layer.spatial;
                }
                if self.base.current_layer.spatial > self.base.target_layer.spatial && dd.end_of_frame {
                    updated_layer.spatial = self.base.target_layer.spatial;
                }

                if self.base.current_layer.temporal < self.base.target_layer.temporal
                    && packet_layer.temporal > self.base.current_layer.temporal
                    && packet_layer.temporal <= self.base.target_layer.temporal
                    && dd.start_of_frame
                {
                    current_layer.temporal = packet_layer.temporal;
                    updated_layer.temporal = packet_layer.temporal;
                }
                if self.base.current_layer.temporal > self.base.target_layer.temporal && dd.end_of_frame {
                    updated_layer.temporal = self.base.target_layer.temporal;
                }
            }

            if updated_layer != self.base.current_layer {
                if !self.base.current_layer.is_valid() && updated_layer.is_valid() {
                    result.is_resuming = true;
                }
                if self.base.current_layer.spatial != self.base.request_spatial
                    && updated_layer.spatial == self.base.request_spatial
                {
                    result.is_switching_to_request_spatial = true;
                }
                if self.base.current_layer.spatial != self.base.max_layer.spatial
                    && updated_layer.spatial == self.base.max_layer.spatial
                {
                    result.is_switching_to_max_spatial = true;
                }

                if !self.base.current_layer.is_valid() {
                    current_layer = updated_layer;
                }
                self.base.current_layer = updated_layer;
            }
        }

        result.rtp_marker = ext_pkt.packet.header.marker
            || (dd.end_of_frame && self.base.target_layer.spatial <= self.base.current_layer.spatial);
        result.is_selected = !ext_pkt.video_layer.is_valid()
            || !ext_pkt.video_layer.greater_than(current_layer);
        result.is_relevant = true;
        result.dependency_descriptor = Some(dd.raw.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Av1Descriptor, CodecDescriptor};
    use bytes::Bytes;
    use std::time::Instant;
    use webrtc::rtp::header::Header;
    use webrtc::rtp::packet::Packet;

    fn av1_packet(layer: VideoLayer, start: bool, end: bool, key_frame: bool) -> ExtPacket {
        ExtPacket {
            arrival: Instant::now(),
            packet: Packet {
                header: Header {
                    version: 2,
                    sequence_number: 11,
                    timestamp: 500,
                    ssrc: 0x0A01,
                    ..Default::default()
                },
                payload: Bytes::from_static(&[0u8; 6]),
            },
            raw_packet: Bytes::new(),
            key_frame,
            video_layer: layer,
            spatial: layer.spatial,
            descriptor: CodecDescriptor::Av1(Av1Descriptor {
                start_of_frame: start,
                end_of_frame: end,
                template_id: 1,
                frame_number: 9,
                raw: Bytes::from_static(&[0xC1, 0x00, 0x09]),
            }),
        }
    }

    #[test]
    fn adopts_layer_at_key_picture_start() {
        let mut selector = Av1::default();
        selector.base.target_layer = VideoLayer::new(1, 1);

        assert!(!selector.select(&av1_packet(VideoLayer::new(0, 0), true, false, false), 0).is_selected);

        let result = selector.select(&av1_packet(VideoLayer::new(0, 0), true, false, true), 0);
        assert!(result.is_selected);
        assert!(result.is_resuming);
        assert!(result.dependency_descriptor.is_some());
    }

    #[test]
    fn downswitch_at_end_of_frame() {
        let mut selector = Av1::default();
        selector.base.current_layer = VideoLayer::new(2, 0);
        selector.base.target_layer = VideoLayer::new(1, 0);

        selector.select(&av1_packet(VideoLayer::new(2, 0), false, false, false), 0);
        assert_eq!(selector.base.current_layer.spatial, 2);

        let result = selector.select(&av1_packet(VideoLayer::new(2, 0), false, true, false), 0);
        assert_eq!(selector.base.current_layer.spatial, 1);
        assert!(result.rtp_marker);
    }
}
