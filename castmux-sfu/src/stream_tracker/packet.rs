//! Packet-count liveness strategy
//!
//! A layer is live when at least `samples_required` packets arrive in each of
//! `cycles_required` consecutive windows of `cycle_duration`. A window with no
//! packets at all stops the layer immediately.

use super::StreamStatus;
use castmux_core::config::StreamTrackerPacketConfig;

#[derive(Debug)]
pub struct PacketTracker {
    config: StreamTrackerPacketConfig,
    initialized: bool,
    packets_in_cycle: u32,
    good_cycles: u32,
    status: StreamStatus,
}

impl PacketTracker {
    #[must_use]
    pub fn new(config: StreamTrackerPacketConfig) -> Self {
        Self {
            config,
            initialized: false,
            packets_in_cycle: 0,
            good_cycles: 0,
            status: StreamStatus::Stopped,
        }
    }

    /// Record one packet. The first packet after a reset declares the layer
    /// active right away so newly started layers are usable without waiting
    /// a full qualification period.
    pub fn observe(&mut self) -> Option<StreamStatus> {
        self.packets_in_cycle += 1;

        if !self.initialized {
            self.initialized = true;
            return self.transition(StreamStatus::Active);
        }
        None
    }

    /// Close the current window; called every `cycle_duration`
    pub fn cycle(&mut self) -> Option<StreamStatus> {
        if !self.initialized {
            return None;
        }

        let packets = self.packets_in_cycle;
        self.packets_in_cycle = 0;

        if packets == 0 {
            self.good_cycles = 0;
            return self.transition(StreamStatus::Stopped);
        }

        if packets >= self.config.samples_required {
            self.good_cycles = self.good_cycles.saturating_add(1);
            if self.good_cycles >= self.config.cycles_required {
                return self.transition(StreamStatus::Active);
            }
        } else {
            self.good_cycles = 0;
        }

        None
    }

    pub fn reset(&mut self) {
        self.initialized = false;
        self.packets_in_cycle = 0;
        self.good_cycles = 0;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn config(samples: u32, cycles: u32) -> StreamTrackerPacketConfig {
        StreamTrackerPacketConfig {
            samples_required: samples,
            cycles_required: cycles,
            cycle_duration_ms: 500,
        }
    }

    #[test]
    fn first_packet_declares_active() {
        let mut tracker = PacketTracker::new(config(5, 20));
        assert_eq!(tracker.observe(), Some(StreamStatus::Active));
        assert_eq!(tracker.observe(), None);
        assert_eq!(tracker.status(), StreamStatus::Active);
    }

    #[test]
    fn empty_cycle_stops_the_layer() {
        let mut tracker = PacketTracker::new(config(1, 1));
        tracker.observe();
        assert_eq!(tracker.cycle(), None); // had one packet
        assert_eq!(tracker.cycle(), Some(StreamStatus::Stopped));
        assert_eq!(tracker.status(), StreamStatus::Stopped);
    }

    #[test]
    fn sustained_cycles_reactivate_after_stop() {
        let mut tracker = PacketTracker::new(config(2, 2));
        tracker.observe();
        tracker.cycle(); // 1 packet < samples_required, stays active
        assert_eq!(tracker.cycle(), Some(StreamStatus::Stopped));

        for _ in 0..2 {
            tracker.observe();
            tracker.observe();
        }
        // both packets landed in one window; need two good windows
        assert_eq!(tracker.cycle(), None);
        tracker.observe();
        tracker.observe();
        assert_eq!(tracker.cycle(), Some(StreamStatus::Active));
    }

    #[test]
    fn reset_requalifies_from_scratch() {
        let mut tracker = PacketTracker::new(config(1, 4));
        tracker.observe();
        assert_eq!(tracker.status(), StreamStatus::Active);
        tracker.reset();
        assert_eq!(tracker.status(), StreamStatus::Stopped);
        assert_eq!(tracker.observe(), Some(StreamStatus::Active));
    }
}
