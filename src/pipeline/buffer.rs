//! Bounded blocking frame hand-off between the capture thread and its consumer

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};

/// Largest capacity accepted; the buffer exists to hand over the latest frame
/// with minimal lag, not to queue
pub const MAX_CAPACITY: usize = 4;

/// How often a blocked producer re-checks its quit flag
const QUIT_POLL: Duration = Duration::from_millis(50);

/// Creates a bounded SPSC frame buffer of `capacity` slots (clamped to 1..=4)
pub fn frame_buffer<T>(capacity: usize) -> (FrameProducer<T>, FrameConsumer<T>) {
    let capacity = capacity.clamp(1, MAX_CAPACITY);
    let (tx, rx) = flume::bounded(capacity);
    (
        FrameProducer { tx, capacity },
        FrameConsumer { rx, capacity },
    )
}

/// Outcome of a blocking push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// Quit was requested while waiting for a free slot
    Cancelled,
    /// The consumer is gone
    Disconnected,
}

pub struct FrameProducer<T> {
    tx: Sender<T>,
    capacity: usize,
}

impl<T> FrameProducer<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Blocks while the buffer is full. Never drops a frame; gives up only
    /// when `quit` is raised or the consumer disconnected.
    pub fn push(&self, item: T, quit: &AtomicBool) -> PushOutcome {
        let mut item = item;
        loop {
            match self.tx.send_timeout(item, QUIT_POLL) {
                Ok(()) => return PushOutcome::Pushed,
                Err(SendTimeoutError::Disconnected(_)) => return PushOutcome::Disconnected,
                Err(SendTimeoutError::Timeout(back)) => {
                    if quit.load(Ordering::Acquire) {
                        return PushOutcome::Cancelled;
                    }
                    item = back;
                }
            }
        }
    }
}

pub struct FrameConsumer<T> {
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> FrameConsumer<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocks until a frame arrives or `timeout` elapses
    pub fn take(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_take(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drains everything buffered and keeps the newest
    pub fn take_latest(&self) -> Option<T> {
        let mut latest = None;
        while let Some(item) = self.try_take() {
            latest = Some(item);
        }
        latest
    }
}
