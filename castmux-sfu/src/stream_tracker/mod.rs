//! Per-layer stream liveness and bitrate tracking
//!
//! A [`StreamTracker`] wraps one of two interchangeable liveness strategies
//! (packet counting or frame-rate measurement) and adds byte accounting for
//! bitrate reports. The [`manager::StreamTrackerManager`] owns one tracker per
//! spatial layer.

mod frame;
mod manager;
mod packet;

pub use frame::FrameTracker;
pub use manager::{StreamTrackerManager, StreamTrackerManagerListener};
pub use packet::PacketTracker;

use crate::types::DEFAULT_MAX_LAYER_TEMPORAL;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Whether a layer is currently delivering media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Stopped,
    Active,
}

/// Liveness strategy, selected by configuration
#[derive(Debug)]
pub enum TrackerStrategy {
    Packet(PacketTracker),
    Frame(FrameTracker),
}

impl TrackerStrategy {
    fn observe(&mut self, ts: u32) -> Option<StreamStatus> {
        match self {
            Self::Packet(t) => t.observe(),
            Self::Frame(t) => t.observe(ts),
        }
    }

    fn cycle(&mut self) -> Option<StreamStatus> {
        match self {
            Self::Packet(t) => t.cycle(),
            Self::Frame(t) => t.cycle(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Packet(t) => t.reset(),
            Self::Frame(t) => t.reset(),
        }
    }

    fn status(&self) -> StreamStatus {
        match self {
            Self::Packet(t) => t.status(),
            Self::Frame(t) => t.status(),
        }
    }
}

const TEMPORAL_LAYERS: usize = DEFAULT_MAX_LAYER_TEMPORAL as usize + 1;

pub type StatusChangedFn = Box<dyn Fn(StreamStatus) + Send + Sync>;
pub type BitrateAvailableFn = Box<dyn Fn() + Send + Sync>;

struct TrackerInner {
    strategy: TrackerStrategy,
    bytes_accumulated: [i64; TEMPORAL_LAYERS],
    bytes_reported: [i64; TEMPORAL_LAYERS],
    report_window: Duration,
    last_report_at: Instant,
    reported_once: bool,
}

/// Liveness and bitrate tracker for a single spatial layer
pub struct StreamTracker {
    cycle_duration: Duration,
    bitrate_report_interval: Duration,
    paused: AtomicBool,
    inner: Mutex<TrackerInner>,
    cancel: Mutex<Option<CancellationToken>>,
    on_status_changed: Mutex<Option<StatusChangedFn>>,
    on_bitrate_available: Mutex<Option<BitrateAvailableFn>>,
}

impl StreamTracker {
    #[must_use]
    pub fn new(
        strategy: TrackerStrategy,
        cycle_duration: Duration,
        bitrate_report_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cycle_duration,
            bitrate_report_interval,
            paused: AtomicBool::new(false),
            inner: Mutex::new(TrackerInner {
                strategy,
                bytes_accumulated: [0; TEMPORAL_LAYERS],
                bytes_reported: [0; TEMPORAL_LAYERS],
                report_window: bitrate_report_interval,
                last_report_at: Instant::now(),
                reported_once: false,
            }),
            cancel: Mutex::new(None),
            on_status_changed: Mutex::new(None),
            on_bitrate_available: Mutex::new(None),
        })
    }

    pub fn on_status_changed(&self, f: StatusChangedFn) {
        *self.on_status_changed.lock() = Some(f);
    }

    pub fn on_bitrate_available(&self, f: BitrateAvailableFn) {
        *self.on_bitrate_available.lock() = Some(f);
    }

    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.inner.lock().strategy.status()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Record one packet on this layer
    pub fn observe(&self, temporal: i32, raw_size: usize, _payload_size: usize, _marker: bool, ts: u32) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }

        let transition = {
            let mut inner = self.inner.lock();
            let t = temporal.clamp(0, DEFAULT_MAX_LAYER_TEMPORAL) as usize;
            inner.bytes_accumulated[t] += raw_size as i64;
            inner.strategy.observe(ts)
        };

        if let Some(status) = transition {
            self.notify_status(status);
        }
    }

    /// Bytes/second per temporal layer from the last report window,
    /// cumulative across temporal layers
    #[must_use]
    pub fn bitrate_temporal_cumulative(&self) -> [i64; TEMPORAL_LAYERS] {
        let inner = self.inner.lock();
        let secs = inner.report_window.as_secs_f64();
        let mut rates = [0i64; TEMPORAL_LAYERS];
        if secs <= 0.0 || !inner.reported_once {
            return rates;
        }

        let mut cumulative = 0i64;
        for (t, rate) in rates.iter_mut().enumerate() {
            cumulative += inner.bytes_reported[t];
            if inner.bytes_reported[t] != 0 || cumulative != 0 {
                *rate = (cumulative as f64 / secs) as i64;
            }
        }
        rates
    }

    /// Start the cycle/bitrate ticker loop
    pub fn start(self: &Arc<Self>) {
        let mut cancel_slot = self.cancel.lock();
        if cancel_slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *cancel_slot = Some(cancel.clone());
        drop(cancel_slot);

        let tracker = Arc::downgrade(self);
        let cycle_duration = self.cycle_duration;
        let bitrate_interval = self.bitrate_report_interval;
        tokio::spawn(async move {
            let mut cycle_tick = tokio::time::interval(cycle_duration);
            let mut bitrate_tick = tokio::time::interval(bitrate_interval);
            cycle_tick.tick().await;
            bitrate_tick.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = cycle_tick.tick() => {
                        let Some(tracker) = tracker.upgrade() else { return };
                        tracker.tick_cycle();
                    }
                    _ = bitrate_tick.tick() => {
                        let Some(tracker) = tracker.upgrade() else { return };
                        tracker.tick_bitrate();
                    }
                }
            }
        });
    }

    /// Stop the ticker loop; the tracker can be restarted
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }

    /// Forget qualification state so the layer is declared available again on
    /// its first packet
    pub fn reset(&self) {
        self.inner.lock().strategy.reset();
    }

    fn tick_cycle(&self) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let transition = self.inner.lock().strategy.cycle();
        if let Some(status) = transition {
            self.notify_status(status);
        }
    }

    fn tick_bitrate(&self) {
        let first = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            inner.report_window = now.duration_since(inner.last_report_at);
            inner.last_report_at = now;
            inner.bytes_reported = inner.bytes_accumulated;
            inner.bytes_accumulated = [0; TEMPORAL_LAYERS];
            let first = !inner.reported_once;
            inner.reported_once = true;
            first
        };

        if first {
            if let Some(f) = self.on_bitrate_available.lock().as_ref() {
                f();
            }
        }
    }

    fn notify_status(&self, status: StreamStatus) {
        debug!(?status, "stream tracker status changed");
        if let Some(f) = self.on_status_changed.lock().as_ref() {
            f(status);
        }
    }
}
