//! Common data-plane types
//!
//! Spatial/temporal layer coordinates, aggregated bitrates and track
//! descriptions shared by receivers, trackers and selectors.

use castmux_core::TrackId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest spatial layer index a track may publish
pub const DEFAULT_MAX_LAYER_SPATIAL: i32 = 2;
/// Highest temporal layer index a track may publish
pub const DEFAULT_MAX_LAYER_TEMPORAL: i32 = 3;

pub const INVALID_LAYER_SPATIAL: i32 = -1;
pub const INVALID_LAYER_TEMPORAL: i32 = -1;

/// Bytes/second per `[spatial][temporal]` cell; for SVC codecs both axes are
/// cumulative (upper cells include the contribution of lower ones)
pub type Bitrates =
    [[i64; DEFAULT_MAX_LAYER_TEMPORAL as usize + 1]; DEFAULT_MAX_LAYER_SPATIAL as usize + 1];

/// A spatial/temporal layer coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoLayer {
    pub spatial: i32,
    pub temporal: i32,
}

impl VideoLayer {
    pub const INVALID: Self = Self {
        spatial: INVALID_LAYER_SPATIAL,
        temporal: INVALID_LAYER_TEMPORAL,
    };

    #[must_use]
    pub const fn new(spatial: i32, temporal: i32) -> Self {
        Self { spatial, temporal }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.spatial != INVALID_LAYER_SPATIAL && self.temporal != INVALID_LAYER_TEMPORAL
    }

    /// Lexicographic greater-than on `(spatial, temporal)`
    #[must_use]
    pub fn greater_than(&self, other: Self) -> bool {
        self.spatial > other.spatial
            || (self.spatial == other.spatial && self.temporal > other.temporal)
    }

    /// Lexicographic greater-or-equal on `(spatial, temporal)`
    #[must_use]
    pub fn greater_than_or_equal(&self, other: Self) -> bool {
        self.spatial > other.spatial
            || (self.spatial == other.spatial && self.temporal >= other.temporal)
    }
}

impl fmt::Display for VideoLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.spatial, self.temporal)
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Where a track originates; selects stream-tracker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Camera,
    Microphone,
    ScreenShare,
    Unknown,
}

/// One published simulcast/SVC layer as announced by the publisher
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PublishedLayerInfo {
    pub spatial: i32,
    /// Announced bitrate in bits/second, 0 when unknown
    pub bitrate: u32,
}

/// Static description of a published track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub kind: TrackKind,
    pub source: TrackSource,
    pub layers: Vec<PublishedLayerInfo>,
}

impl TrackInfo {
    /// Highest spatial layer the publisher announced, or invalid when none
    #[must_use]
    pub fn max_announced_spatial_layer(&self) -> i32 {
        self.layers
            .iter()
            .map(|l| l.spatial)
            .max()
            .unwrap_or(INVALID_LAYER_SPATIAL)
    }
}

/// Map a simulcast restriction identifier to a spatial layer.
///
/// Publishers announce quarter/half/full encodings as `q`/`h`/`f`; a missing
/// or unknown RID means the track is not simulcast and maps to layer 0.
#[must_use]
pub fn rid_to_spatial_layer(rid: &str) -> i32 {
    match rid {
        "" | "q" => 0,
        "h" => 1,
        "f" => 2,
        _ => 0,
    }
}

/// True for codecs that carry all spatial layers in a single bitstream
#[must_use]
pub fn is_svc_codec(mime: &str) -> bool {
    matches!(mime.to_lowercase().as_str(), "video/av1" | "video/vp9")
}

/// True for RED-wrapped audio codecs
#[must_use]
pub fn is_red_codec(mime: &str) -> bool {
    mime.to_lowercase().ends_with("red")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_comparisons_are_lexicographic() {
        let low = VideoLayer::new(0, 2);
        let high = VideoLayer::new(1, 0);
        assert!(high.greater_than(low));
        assert!(!low.greater_than(high));
        assert!(VideoLayer::new(1, 1).greater_than(VideoLayer::new(1, 0)));
        assert!(VideoLayer::new(1, 1).greater_than_or_equal(VideoLayer::new(1, 1)));
        assert!(!VideoLayer::INVALID.is_valid());
    }

    #[test]
    fn codec_classification() {
        assert!(is_svc_codec("video/VP9"));
        assert!(is_svc_codec("video/AV1"));
        assert!(!is_svc_codec("video/VP8"));
        assert!(is_red_codec("audio/RED"));
        assert!(!is_red_codec("audio/opus"));
    }

    #[test]
    fn rid_mapping() {
        assert_eq!(rid_to_spatial_layer("q"), 0);
        assert_eq!(rid_to_spatial_layer("h"), 1);
        assert_eq!(rid_to_spatial_layer("f"), 2);
        assert_eq!(rid_to_spatial_layer(""), 0);
    }
}
