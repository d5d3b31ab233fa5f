use super::{Base, SelectorResult};
use crate::packet::ExtPacket;
use crate::types::VideoLayer;
use tracing::info;

/// VP9 SVC selector
///
/// All spatial layers share one bitstream, so switching must respect picture
/// boundaries: temporal up only at upswitch points (`U && B`), temporal down
/// only at end of picture (`E`), spatial up only at non-predicted picture
/// starts (`!P && B`), spatial down at end of picture.
#[derive(Debug, Default)]
pub struct Vp9 {
    pub(crate) base: Base,
}

impl Vp9 {
    pub fn select(&mut self, ext_pkt: &ExtPacket, _layer: i32) -> SelectorResult {
        let mut result = SelectorResult::default();

        let Some(vp9) = ext_pkt.descriptor.as_vp9() else {
            return result;
        };

        let mut current_layer = self.base.current_layer;
        if self.base.current_layer != self.base.target_layer {
            let mut updated_layer = self.base.current_layer;

            if !self.base.current_layer.is_valid() {
                if !ext_pkt.key_frame {
                    return result;
                }

                updated_layer = ext_pkt.video_layer;
            } else {
                if self.base.current_layer.temporal != self.base.target_layer.temporal {
                    if self.base.current_layer.temporal < self.base.target_layer.temporal {
                        // temporal scale up
                        if ext_pkt.video_layer.temporal > self.base.current_layer.temporal
                            && ext_pkt.video_layer.temporal <= self.base.target_layer.temporal
                            && vp9.u
                            && vp9.b
                        {
                            current_layer.temporal = ext_pkt.video_layer.temporal;
                            updated_layer.temporal = ext_pkt.video_layer.temporal;
                        }
                    } else {
                        // temporal scale down
                        if vp9.e {
                            updated_layer.temporal = self.base.target_layer.temporal;
                        }
                    }
                }

                if self.base.current_layer.spatial != self.base.target_layer.spatial {
                    if self.base.current_layer.spatial < self.base.target_layer.spatial {
                        // spatial scale up
                        if ext_pkt.video_layer.spatial > self.base.current_layer.spatial
                            && ext_pkt.video_layer.spatial <= self.base.target_layer.spatial
                            && !vp9.p
                            && vp9.b
                        {
                            current_layer.spatial = ext_pkt.video_layer.spatial;
                            updated_layer.spatial = ext_pkt.video_layer.spatial;
                        }
                    } else {
                        // spatial scale down
                        if vp9.e {
                            updated_layer.spatial = self.base.target_layer.spatial;
                        }
                    }
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
                    info!(
                        current = %self.base.current_layer,
                        target = %self.base.target_layer,
                        max = %self.base.max_layer,
                        layer = ext_pkt.video_layer.spatial,
                        req = self.base.request_spatial,
                        max_seen = %self.base.max_seen_layer,
                        feed = ext_pkt.packet.header.ssrc,
                        "reached max layer",
                    );
                }

                if !self.base.current_layer.is_valid() {
                    current_layer = updated_layer;
                }
                self.base.current_layer = updated_layer;
            }
        }

        result.rtp_marker = ext_pkt.packet.header.marker;
        if vp9.e
            && ext_pkt.video_layer.spatial == current_layer.spatial
            && (vp9.p || self.base.target_layer.spatial <= self.base.current_layer.spatial)
        {
            result.rtp_marker = true;
        }
        result.is_selected = !ext_pkt.video_layer.greater_than(current_layer);
        result.is_relevant = true;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CodecDescriptor;
    use bytes::Bytes;
    use std::time::Instant;
    use webrtc::rtp::codecs::vp9::Vp9Packet;
    use webrtc::rtp::header::Header;
    use webrtc::rtp::packet::Packet;

    struct Vp9Flags {
        p: bool,
        b: bool,
        e: bool,
        u: bool,
    }

    fn vp9_packet(layer: VideoLayer, flags: Vp9Flags, key_frame: bool) -> ExtPacket {
        let descriptor = Vp9Packet {
            p: flags.p,
            b: flags.b,
            e: flags.e,
            u: flags.u,
            sid: layer.spatial as u8,
            tid: layer.temporal as u8,
            ..Default::default()
        };

        ExtPacket {
            arrival: Instant::now(),
            packet: Packet {
                header: Header {
                    version: 2,
                    marker: flags.e,
                    sequence_number: 1,
                    timestamp: 1000,
                    ssrc: 0xBEEF,
                    ..Default::default()
                },
                payload: Bytes::from_static(&[0u8; 10]),
            },
            raw_packet: Bytes::new(),
            key_frame,
            video_layer: layer,
            spatial: layer.spatial,
            descriptor: CodecDescriptor::Vp9(descriptor),
        }
    }

    #[test]
    fn waits_for_key_frame_without_current_layer() {
        let mut selector = Vp9::default();
        selector.base.target_layer = VideoLayer::new(0, 0);

        let delta = vp9_packet(
            VideoLayer::new(0, 0),
            Vp9Flags { p: true, b: true, e: false, u: false },
            false,
        );
        let result = selector.select(&delta, 0);
        assert!(!result.is_selected);

        let key = vp9_packet(
            VideoLayer::new(0, 0),
            Vp9Flags { p: false, b: true, e: false, u: false },
            true,
        );
        let result = selector.select(&key, 0);
        assert!(result.is_selected);
        assert!(result.is_resuming);
        assert_eq!(selector.base.current_layer, VideoLayer::new(0, 0));
    }

    #[test]
    fn promotes_through_temporal_then_spatial_upswitch_points() {
        let mut selector = Vp9::default();
        selector.base.current_layer = VideoLayer::new(0, 0);
        selector.base.target_layer = VideoLayer::new(1, 2);
        selector.base.max_layer = VideoLayer::new(2, 3);

        // temporal up: U && B with temporal within (current, target]
        let up = vp9_packet(
            VideoLayer::new(0, 1),
            Vp9Flags { p: true, b: true, e: false, u: true },
            false,
        );
        let result = selector.select(&up, 0);
        assert!(result.is_selected);
        assert_eq!(selector.base.current_layer, VideoLayer::new(0, 1));

        // spatial up: !P && B with spatial within (current, target]
        let spatial_up = vp9_packet(
            VideoLayer::new(1, 0),
            Vp9Flags { p: false, b: true, e: false, u: false },
            true,
        );
        let result = selector.select(&spatial_up, 0);
        assert!(result.is_selected);
        assert_eq!(selector.base.current_layer, VideoLayer::new(1, 1));

        // end of picture at the current spatial completes the epoch with a
        // forced marker
        let end = vp9_packet(
            VideoLayer::new(1, 1),
            Vp9Flags { p: true, b: false, e: true, u: false },
            false,
        );
        let result = selector.select(&end, 0);
        assert!(result.is_selected);
        assert!(result.rtp_marker);
    }

    #[test]
    fn temporal_down_waits_for_end_of_picture() {
        let mut selector = Vp9::default();
        selector.base.current_layer = VideoLayer::new(1, 2);
        selector.base.target_layer = VideoLayer::new(1, 0);

        let mid = vp9_packet(
            VideoLayer::new(1, 2),
            Vp9Flags { p: true, b: false, e: false, u: false },
            false,
        );
        selector.select(&mid, 0);
        assert_eq!(selector.base.current_layer.temporal, 2);

        let end = vp9_packet(
            VideoLayer::new(1, 1),
            Vp9Flags { p: true, b: false, e: true, u: false },
            false,
        );
        selector.select(&end, 0);
        assert_eq!(selector.base.current_layer.temporal, 0);
    }

    #[test]
    fn higher_layers_than_current_are_dropped() {
        let mut selector = Vp9::default();
        selector.base.current_layer = VideoLayer::new(0, 0);
        selector.base.target_layer = VideoLayer::new(0, 0);

        let above = vp9_packet(
            VideoLayer::new(1, 0),
            Vp9Flags { p: true, b: true, e: false, u: false },
            false,
        );
        let result = selector.select(&above, 0);
        assert!(!result.is_selected);
        assert!(result.is_relevant);

        let at = vp9_packet(
            VideoLayer::new(0, 0),
            Vp9Flags { p: true, b: true, e: false, u: false },
            false,
        );
        assert!(selector.select(&at, 0).is_selected);
    }
}
