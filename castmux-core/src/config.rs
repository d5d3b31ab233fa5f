//! Application configuration
//!
//! All sections carry serde defaults so a partial file (or none at all) yields
//! a working configuration. Values can be overridden from the environment with
//! a `CASTMUX_` prefix, e.g. `CASTMUX_RTC__PACKET_BUFFER_SIZE=1000`.

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rtc: RtcConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub signal_relay: SignalRelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// Number of packets buffered per layer for NACK retransmission
    pub packet_buffer_size: usize,
    pub pli_throttle: PliThrottleConfig,
    pub congestion_control: CongestionControlConfig,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            packet_buffer_size: 500,
            pli_throttle: PliThrottleConfig::default(),
            congestion_control: CongestionControlConfig::default(),
        }
    }
}

/// Minimum interval between PLIs, per simulcast quality
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PliThrottleConfig {
    pub low_quality_ms: u64,
    pub mid_quality_ms: u64,
    pub high_quality_ms: u64,
}

impl Default for PliThrottleConfig {
    fn default() -> Self {
        Self {
            low_quality_ms: 500,
            mid_quality_ms: 1000,
            high_quality_ms: 1000,
        }
    }
}

impl PliThrottleConfig {
    /// Throttle duration for a spatial layer; layers above the known range use
    /// the mid-quality interval
    #[must_use]
    pub fn for_layer(&self, layer: i32) -> Duration {
        let ms = match layer {
            0 => self.low_quality_ms,
            2 => self.high_quality_ms,
            _ => self.mid_quality_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionControlConfig {
    /// Enables the pluggable bandwidth estimator
    pub enabled: bool,
    /// Allows dropping a subscription to zero spatial layers under pressure
    pub allow_pause: bool,
}

impl Default for CongestionControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_pause: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Minimum level to be considered active, 0-127, where 0 is loudest (dBov)
    pub active_level: u8,
    /// A participant is considered active if it exceeded `active_level` more
    /// than this percentage of the observation window
    pub min_percentile: u8,
    /// Interval between audio level updates, in ms
    pub update_interval_ms: u32,
    /// Smoothing window for reported levels, 0 to disable
    pub smooth_intervals: u32,
    /// Enable RED encoding down tracks for opus-only up tracks
    pub active_red_encoding: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            active_level: 35,
            min_percentile: 40,
            update_interval_ms: 400,
            smooth_intervals: 2,
            active_red_encoding: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub stream_tracker: StreamTrackersConfig,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            stream_tracker: StreamTrackersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTrackerKind {
    Packet,
    Frame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackerPacketConfig {
    /// Number of samples needed per cycle
    pub samples_required: u32,
    /// Number of cycles needed to be declared active
    pub cycles_required: u32,
    pub cycle_duration_ms: u64,
}

impl Default for StreamTrackerPacketConfig {
    fn default() -> Self {
        Self {
            samples_required: 5,
            cycles_required: 20,
            cycle_duration_ms: 500,
        }
    }
}

impl StreamTrackerPacketConfig {
    #[must_use]
    pub fn cycle_duration(&self) -> Duration {
        Duration::from_millis(self.cycle_duration_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackerFrameConfig {
    pub min_fps: f64,
}

impl Default for StreamTrackerFrameConfig {
    fn default() -> Self {
        Self { min_fps: 5.0 }
    }
}

/// Per-source tracker strategy and thresholds, keyed by spatial layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackerConfig {
    pub kind: StreamTrackerKind,
    pub bitrate_report_interval_ms: HashMap<i32, u64>,
    pub packet_tracker: HashMap<i32, StreamTrackerPacketConfig>,
    pub frame_tracker: HashMap<i32, StreamTrackerFrameConfig>,
}

impl StreamTrackerConfig {
    #[must_use]
    pub fn bitrate_report_interval(&self, layer: i32) -> Option<Duration> {
        self.bitrate_report_interval_ms
            .get(&layer)
            .map(|ms| Duration::from_millis(*ms))
    }

    fn video() -> Self {
        let mut packet_tracker = HashMap::new();
        packet_tracker.insert(
            0,
            StreamTrackerPacketConfig {
                samples_required: 1,
                cycles_required: 4,
                cycle_duration_ms: 500,
            },
        );
        for layer in [1, 2] {
            packet_tracker.insert(
                layer,
                StreamTrackerPacketConfig {
                    samples_required: 5,
                    cycles_required: 20,
                    cycle_duration_ms: 500,
                },
            );
        }

        Self {
            kind: StreamTrackerKind::Packet,
            bitrate_report_interval_ms: (0..3).map(|l| (l, 1000)).collect(),
            packet_tracker,
            frame_tracker: (0..3).map(|l| (l, StreamTrackerFrameConfig { min_fps: 5.0 })).collect(),
        }
    }

    fn screenshare() -> Self {
        Self {
            kind: StreamTrackerKind::Packet,
            bitrate_report_interval_ms: (0..3).map(|l| (l, 4000)).collect(),
            packet_tracker: (0..3)
                .map(|l| {
                    (
                        l,
                        StreamTrackerPacketConfig {
                            samples_required: 1,
                            cycles_required: 1,
                            cycle_duration_ms: 2000,
                        },
                    )
                })
                .collect(),
            frame_tracker: (0..3).map(|l| (l, StreamTrackerFrameConfig { min_fps: 0.5 })).collect(),
        }
    }
}

impl Default for StreamTrackerConfig {
    fn default() -> Self {
        Self::video()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackersConfig {
    pub video: StreamTrackerConfig,
    pub screenshare: StreamTrackerConfig,
}

impl Default for StreamTrackersConfig {
    fn default() -> Self {
        Self {
            video: StreamTrackerConfig::video(),
            screenshare: StreamTrackerConfig::screenshare(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalRelayConfig {
    pub min_retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
    pub retry_timeout_ms: u64,
    /// Bound of the inbound message channel
    pub stream_buffer_size: usize,
}

impl Default for SignalRelayConfig {
    fn default() -> Self {
        Self {
            min_retry_interval_ms: 500,
            max_retry_interval_ms: 4000,
            retry_timeout_ms: 7500,
            stream_buffer_size: 1000,
        }
    }
}

impl SignalRelayConfig {
    #[must_use]
    pub fn min_retry_interval(&self) -> Duration {
        Duration::from_millis(self.min_retry_interval_ms)
    }

    #[must_use]
    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval_ms)
    }

    #[must_use]
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Output format: "json" (production) or "pretty" (development)
    pub format: String,
    /// Optional log file path
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let settings = builder
            .add_source(Environment::with_prefix("CASTMUX").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.rtc.packet_buffer_size, 500);
        assert_eq!(config.rtc.pli_throttle.for_layer(0), Duration::from_millis(500));
        assert_eq!(config.rtc.pli_throttle.for_layer(1), Duration::from_millis(1000));
        assert_eq!(config.rtc.pli_throttle.for_layer(7), Duration::from_millis(1000));
        assert!(config.rtc.congestion_control.enabled);
        assert!(!config.rtc.congestion_control.allow_pause);
        assert_eq!(config.audio.active_level, 35);
        assert_eq!(config.signal_relay.retry_timeout(), Duration::from_millis(7500));
    }

    #[test]
    fn video_tracker_thresholds_differ_from_screenshare() {
        let trackers = StreamTrackersConfig::default();
        assert_eq!(trackers.video.packet_tracker[&0].cycles_required, 4);
        assert_eq!(trackers.video.packet_tracker[&1].samples_required, 5);
        assert_eq!(trackers.screenshare.packet_tracker[&0].cycle_duration(), Duration::from_secs(2));
        assert_eq!(trackers.video.bitrate_report_interval(1), Some(Duration::from_secs(1)));
        assert_eq!(trackers.video.bitrate_report_interval(9), None);
    }

    #[test]
    fn partial_json_round_trip_keeps_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"rtc": {"packet_buffer_size": 64}}"#).unwrap();
        assert_eq!(parsed.rtc.packet_buffer_size, 64);
        assert_eq!(parsed.audio.active_level, 35);
    }
}
