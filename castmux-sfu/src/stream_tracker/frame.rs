//! Frame-rate liveness strategy
//!
//! A layer is live when it produces at least `min_fps` frames per second,
//! measured from RTP timestamps and the codec clock rate. Frames are counted
//! by distinct timestamps; wall time does not enter the measurement.

use super::StreamStatus;
use castmux_core::config::StreamTrackerFrameConfig;

#[derive(Debug)]
pub struct FrameTracker {
    config: StreamTrackerFrameConfig,
    clock_rate: u32,
    initialized: bool,
    base_ts: u32,
    newest_ts: u32,
    frames_in_cycle: u32,
    status: StreamStatus,
}

impl FrameTracker {
    #[must_use]
    pub fn new(config: StreamTrackerFrameConfig, clock_rate: u32) -> Self {
        Self {
            config,
            clock_rate,
            initialized: false,
            base_ts: 0,
            newest_ts: 0,
            frames_in_cycle: 0,
            status: StreamStatus::Stopped,
        }
    }

    /// Record a packet; only packets that open a new timestamp count as frames
    pub fn observe(&mut self, ts: u32) -> Option<StreamStatus> {
        if !self.initialized {
            self.initialized = true;
            self.base_ts = ts;
            self.newest_ts = ts;
            self.frames_in_cycle = 1;
            return self.transition(StreamStatus::Active);
        }

        if ts == self.newest_ts {
            return None;
        }

        // only advance for newer timestamps; reordered packets of an already
        // counted frame don't add frames
        if ts.wrapping_sub(self.newest_ts) < (1 << 31) {
            self.newest_ts = ts;
            self.frames_in_cycle += 1;
        }
        None
    }

    /// Close the current measurement window
    pub fn cycle(&mut self) -> Option<StreamStatus> {
        if !self.initialized {
            return None;
        }

        let span = self.newest_ts.wrapping_sub(self.base_ts);
        let result = if self.frames_in_cycle == 0 || span == 0 {
            self.transition(StreamStatus::Stopped)
        } else {
            let seconds = f64::from(span) / f64::from(self.clock_rate);
            let fps = f64::from(self.frames_in_cycle - 1) / seconds;
            if fps >= self.config.min_fps {
                self.transition(StreamStatus::Active)
            } else {
                self.transition(StreamStatus::Stopped)
            }
        };

        self.base_ts = self.newest_ts;
        self.frames_in_cycle = if self.frames_in_cycle > 0 { 1 } else { 0 };
        result
    }

    pub fn reset(&mut self) {
        self.initialized = false;
        self.frames_in_cycle = 0;
        self.status = StreamStatus::Stopped;
    }

    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.status
    }

    fn transition(&mut self, to: StreamStatus) -> Option<StreamStatus> {
        if self.status == to {
            return None;
        }
        self.status = to;
        Some(to)
    }
}
