//! Codec-aware video layer selection
//!
//! Each down track owns one selector. The selector decides, packet by packet,
//! whether the subscriber should receive the packet given the current and
//! target layers, and flags the transitions the down track must react to
//! (resume, switch completion, forced marker bits).
//!
//! State shared by all codecs lives in [`Base`]; codec rules are variants of
//! the [`VideoLayerSelector`] enum.

mod av1;
mod h264;
mod null;
mod temporal;
mod vp8;
mod vp9;

pub use av1::Av1;
pub use h264::H264;
pub use null::Null;
pub use temporal::TemporalLayerSelector;
pub use vp8::Vp8;
pub use vp9::Vp9;

use crate::packet::ExtPacket;
use crate::types::VideoLayer;
use bytes::Bytes;

/// Outcome of consulting the selector for one packet
#[derive(Debug, Clone, Default)]
pub struct SelectorResult {
    pub is_selected: bool,
    pub is_relevant: bool,
    pub is_resuming: bool,
    pub is_switching_to_request_spatial: bool,
    pub is_switching_to_max_spatial: bool,
    pub rtp_marker: bool,
    /// Rewritten dependency descriptor to attach on egress (AV1)
    pub dependency_descriptor: Option<Bytes>,
}

/// Layer state common to every codec variant
#[derive(Debug, Clone)]
pub struct Base {
    pub(crate) current_layer: VideoLayer,
    pub(crate) target_layer: VideoLayer,
    pub(crate) request_spatial: i32,
    pub(crate) max_layer: VideoLayer,
    pub(crate) max_seen_layer: VideoLayer,
    pub(crate) parked_layer: VideoLayer,
}

impl Default for Base {
    fn default() -> Self {
        Self {
            current_layer: VideoLayer::INVALID,
            target_layer: VideoLayer::INVALID,
            request_spatial: -1,
            max_layer: VideoLayer::INVALID,
            max_seen_layer: VideoLayer::INVALID,
            parked_layer: VideoLayer::INVALID,
        }
    }
}

impl Base {
    /// Simulcast selection shared by VP8 and H264: each spatial layer is an
    /// independent encoding, so spatial switches happen only at key frames of
    /// the target (or parked) layer's uplink.
    fn select_simulcast(&mut self, ext_pkt: &ExtPacket, layer: i32) -> SelectorResult {
        let mut result = SelectorResult::default();

        if self.current_layer.spatial != self.target_layer.spatial {
            let mut found = false;
            if self.parked_layer.is_valid() {
                if self.parked_layer.spatial == layer && ext_pkt.key_frame {
                    found = true;
                }
            } else if layer == self.target_layer.spatial && ext_pkt.key_frame {
                found = true;
            }

            if found {
                if !self.current_layer.is_valid() {
                    result.is_resuming = true;
                }

                if self.current_layer.spatial != self.request_spatial && layer == self.request_spatial {
                    result.is_switching_to_request_spatial = true;
                }
                if self.current_layer.spatial != self.max_layer.spatial && layer == self.max_layer.spatial {
                    result.is_switching_to_max_spatial = true;
                }

                self.current_layer.spatial = layer;
                if self.current_layer.temporal < 0 {
                    self.current_layer.temporal = 0;
                }
                self.parked_layer = VideoLayer::INVALID;
            }
        }

        if self.current_layer.spatial != layer {
            return result;
        }

        result.is_relevant = true;
        result.rtp_marker = ext_pkt.packet.header.marker;
        result.is_selected = true;
        result
    }
}

/// Tagged selector over the supported codecs
pub enum VideoLayerSelector {
    Null(Null),
    Vp8(Vp8),
    Vp9(Vp9),
    Av1(Av1),
    H264(H264),
}

impl VideoLayerSelector {
    /// Selector for a codec mime type; unknown codecs get the null selector
    #[must_use]
    pub fn for_mime(mime: &str) -> Self {
        match mime.to_lowercase().as_str() {
            "video/vp8" => Self::Vp8(Vp8::default()),
            "video/vp9" => Self::Vp9(Vp9::default()),
            "video/av1" => Self::Av1(Av1::default()),
            "video/h264" => Self::H264(H264::default()),
            _ => Self::Null(Null::default()),
        }
    }

    fn base(&self) -> &Base {
        match self {
            Self::Null(s) => &s.base,
            Self::Vp8(s) => &s.base,
            Self::Vp9(s) => &s.base,
            Self::Av1(s) => &s.base,
            Self::H264(s) => &s.base,
        }
    }

    fn base_mut(&mut self) -> &mut Base {
        match self {
            Self::Null(s) => &mut s.base,
            Self::Vp8(s) => &mut s.base,
            Self::Vp9(s) => &mut s.base,
            Self::Av1(s) => &mut s.base,
            Self::H264(s) => &mut s.base,
        }
    }

    /// Whether briefly exceeding the requested temporal layer is acceptable
    #[must_use]
    pub fn is_overshoot_okay(&self) -> bool {
        matches!(self, Self::Vp8(_))
    }

    pub fn select(&mut self, ext_pkt: &ExtPacket, layer: i32) -> SelectorResult {
        match self {
            Self::Null(s) => s.select(ext_pkt, layer),
            Self::Vp8(s) => s.select(ext_pkt, layer),
            Self::Vp9(s) => s.select(ext_pkt, layer),
            Self::Av1(s) => s.select(ext_pkt, layer),
            Self::H264(s) => s.select(ext_pkt, layer),
        }
    }

    /// Temporal layer this packet should be forwarded at
    pub fn select_temporal(&mut self, ext_pkt: &ExtPacket) -> i32 {
        match self {
            Self::Vp8(s) => s.select_temporal(ext_pkt),
            _ => {
                let base = self.base();
                if base.current_layer.is_valid() {
                    base.current_layer.temporal
                } else {
                    ext_pkt.video_layer.temporal
                }
            }
        }
    }

    pub fn set_current(&mut self, layer: VideoLayer) {
        self.base_mut().current_layer = layer;
    }

    #[must_use]
    pub fn current(&self) -> VideoLayer {
        self.base().current_layer
    }

    pub fn set_target(&mut self, layer: VideoLayer) {
        self.base_mut().target_layer = layer;
    }

    #[must_use]
    pub fn target(&self) -> VideoLayer {
        self.base().target_layer
    }

    pub fn set_request_spatial(&mut self, layer: i32) {
        self.base_mut().request_spatial = layer;
    }

    #[must_use]
    pub fn request_spatial(&self) -> i32 {
        self.base().request_spatial
    }

    pub fn set_max(&mut self, layer: VideoLayer) {
        self.base_mut().max_layer = layer;
    }

    pub fn set_max_spatial(&mut self, layer: i32) {
        self.base_mut().max_layer.spatial = layer;
    }

    pub fn set_max_temporal(&mut self, layer: i32) {
        self.base_mut().max_layer.temporal = layer;
    }

    #[must_use]
    pub fn max(&self) -> VideoLayer {
        self.base().max_layer
    }

    pub fn set_max_seen(&mut self, layer: VideoLayer) {
        self.base_mut().max_seen_layer = layer;
    }

    pub fn set_max_seen_spatial(&mut self, layer: i32) {
        self.base_mut().max_seen_layer.spatial = layer;
    }

    pub fn set_max_seen_temporal(&mut self, layer: i32) {
        self.base_mut().max_seen_layer.temporal = layer;
    }

    #[must_use]
    pub fn max_seen(&self) -> VideoLayer {
        self.base().max_seen_layer
    }

    pub fn set_parked(&mut self, layer: VideoLayer) {
        self.base_mut().parked_layer = layer;
    }

    #[must_use]
    pub fn parked(&self) -> VideoLayer {
        self.base().parked_layer
    }
}
