use super::{Base, SelectorResult, TemporalLayerSelector};
use crate::packet::ExtPacket;

/// VP8 simulcast selector
///
/// Spatial layers are independent encodings, so spatial moves ride on key
/// frames of the target uplink. Temporal filtering uses `TID` and the
/// layer-sync bit; a brief temporal overshoot while waiting for a switch
/// point is tolerated.
#[derive(Debug)]
pub struct Vp8 {
    pub(crate) base: Base,
    temporal: TemporalLayerSelector,
}

impl Default for Vp8 {
    fn default() -> Self {
        Self::new()
    }
}

impl Vp8 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Base::default(),
            temporal: TemporalLayerSelector::Vp8,
        }
    }

    pub fn select(&mut self, ext_pkt: &ExtPacket, layer: i32) -> SelectorResult {
        let mut result = self.base.select_simulcast(ext_pkt, layer);
        if !result.is_selected {
            return result;
        }

        let (packet_temporal, updated_current) = self.temporal.select(
            ext_pkt,
            self.base.current_layer.temporal,
            self.base.target_layer.temporal,
        );
        self.base.current_layer.temporal = updated_current;

        // overshoot is okay for VP8: keep forwarding one temporal above the
        // current layer rather than starving while waiting for a sync point
        if packet_temporal > self.base.current_layer.temporal.max(0) + 1 {
            result.is_selected = false;
        }
        result
    }

    pub fn select_temporal(&mut self, ext_pkt: &ExtPacket) -> i32 {
        let (packet_temporal, updated_current) = self.temporal.select(
            ext_pkt,
            self.base.current_layer.temporal,
            self.base.target_layer.temporal,
        );
        self.base.current_layer.temporal = updated_current;
        packet_temporal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CodecDescriptor;
    use crate::types::VideoLayer;
    use bytes::Bytes;
    use std::time::Instant;
    use webrtc::rtp::codecs::vp8::Vp8Packet;
    use webrtc::rtp::header::Header;
    use webrtc::rtp::packet::Packet;

    fn vp8_packet(tid: u8, layer_sync: bool, key_frame: bool) -> ExtPacket {
        let descriptor = Vp8Packet {
            x: 1,
            t: 1,
            tid,
            y: u8::from(layer_sync),
            ..Default::default()
        };

        ExtPacket {
            arrival: Instant::now(),
            packet: Packet {
                header: Header {
                    version: 2,
                    sequence_number: 7,
                    timestamp: 3000,
                    ssrc: 0xFEED,
                    ..Default::default()
                },
                payload: Bytes::from_static(&[0u8; 12]),
            },
            raw_packet: Bytes::new(),
            key_frame,
            video_layer: VideoLayer::new(-1, i32::from(tid)),
            spatial: -1,
            descriptor: CodecDescriptor::Vp8(descriptor),
        }
    }

    fn selector_at(current: VideoLayer, target: VideoLayer) -> Vp8 {
        let mut selector = Vp8::new();
        selector.base.current_layer = current;
        selector.base.target_layer = target;
        selector
    }

    #[test]
    fn overshoot_is_okay_for_vp8_only() {
        use super::super::VideoLayerSelector;
        assert!(VideoLayerSelector::for_mime("video/VP8").is_overshoot_okay());
        assert!(!VideoLayerSelector::for_mime("video/VP9").is_overshoot_okay());
        assert!(!VideoLayerSelector::for_mime("video/AV1").is_overshoot_okay());
    }

    #[test]
    fn spatial_switch_requires_key_frame_on_target_uplink() {
        let mut selector = selector_at(VideoLayer::new(0, 0), VideoLayer::new(1, 0));

        let delta = vp8_packet(0, false, false);
        assert!(!selector.select(&delta, 1).is_selected);
        assert_eq!(selector.base.current_layer.spatial, 0);

        let key = vp8_packet(0, false, true);
        let result = selector.select(&key, 1);
        assert!(result.is_selected);
        assert_eq!(selector.base.current_layer.spatial, 1);
    }

    #[test]
    fn temporal_up_waits_for_layer_sync() {
        let mut selector = selector_at(VideoLayer::new(0, 0), VideoLayer::new(0, 2));

        selector.select(&vp8_packet(1, false, false), 0);
        assert_eq!(selector.base.current_layer.temporal, 0);

        selector.select(&vp8_packet(2, true, false), 0);
        assert_eq!(selector.base.current_layer.temporal, 2);
    }

    #[test]
    fn temporal_down_is_immediate() {
        let mut selector = selector_at(VideoLayer::new(0, 2), VideoLayer::new(0, 0));
        selector.select(&vp8_packet(1, false, false), 0);
        assert_eq!(selector.base.current_layer.temporal, 0);
    }
}
