//! Capture telemetry: windowed dropped-frame counter and fps estimate.
//!
//! Written only by the capture thread, readable from any thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Length of one dropped-frame window
pub const DROP_WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct DroppedWindow {
    index: AtomicU64,
    count: AtomicU64,
}

pub struct Telemetry {
    origin: Instant,
    dropped: CachePadded<DroppedWindow>,
    fps: CachePadded<AtomicCell<f32>>,
    frames_total: AtomicU64,
    dropped_total: AtomicU64,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self::with_origin(Instant::now())
    }

    pub fn with_origin(origin: Instant) -> Self {
        Self {
            origin,
            dropped: CachePadded::new(DroppedWindow::default()),
            fps: CachePadded::new(AtomicCell::new(0.0)),
            frames_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    fn window_index(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.origin).as_millis() / DROP_WINDOW.as_millis()) as u64
    }

    pub fn record_dropped(&self) {
        self.record_dropped_at(Instant::now());
    }

    /// Counts one dropped frame into the window containing `now`, starting a
    /// fresh window at zero if the previous one has ended
    pub fn record_dropped_at(&self, now: Instant) {
        let index = self.window_index(now);
        if self.dropped.index.load(Ordering::Acquire) != index {
            self.dropped.count.store(0, Ordering::Release);
            self.dropped.index.store(index, Ordering::Release);
        }
        self.dropped.count.fetch_add(1, Ordering::AcqRel);
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("argus_frames_dropped_total").increment(1);
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames_at(Instant::now())
    }

    /// Dropped frames in the current window; zero once the window the
    /// counter belongs to has passed
    pub fn dropped_frames_at(&self, now: Instant) -> u64 {
        if self.dropped.index.load(Ordering::Acquire) == self.window_index(now) {
            self.dropped.count.load(Ordering::Acquire)
        } else {
            0
        }
    }

    pub fn record_frame(&self) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("argus_frames_captured_total").increment(1);
    }

    pub fn set_fps(&self, fps: f32) {
        self.fps.store(fps);
        metrics::gauge!("argus_capture_fps").set(fps as f64);
    }

    pub fn fps(&self) -> f32 {
        self.fps.load()
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

/// Moving-average fps over the last N inter-frame intervals
pub struct FpsEstimator {
    intervals: HeapRb<f32>,
    last: Option<Instant>,
}

impl FpsEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            intervals: HeapRb::new(window.max(1)),
            last: None,
        }
    }

    /// Records a good frame at `now` and returns the updated estimate, once
    /// at least one interval is known
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        let previous = self.last.replace(now);
        let interval = now.saturating_duration_since(previous?).as_secs_f32();
        if interval > 0.0 {
            self.intervals.push_overwrite(interval);
        }
        self.estimate()
    }

    pub fn estimate(&self) -> Option<f32> {
        let count = self.intervals.occupied_len();
        if count == 0 {
            return None;
        }
        let total: f32 = self.intervals.iter().sum();
        (total > 0.0).then(|| count as f32 / total)
    }

    /// Forgets history, e.g. after the stream restarted
    pub fn reset(&mut self) {
        self.intervals.clear();
        self.last = None;
    }
}
