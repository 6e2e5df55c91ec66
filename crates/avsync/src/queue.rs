//! Thread-safe bounded queues for packets and decoded frames.
//!
//! The pipeline uses [`TimedQueue`] as the hand-off between stages:
//! - read thread → packet queue (one per stream)
//! - decode thread → frame queue (one per stream)
//! - render pull drains the frame queue (non-blocking)
//!
//! Every queue carries a *serial*. A seek flushes the queue under a new serial, and any
//! push tagged with an older serial is rejected, including one that was already blocked
//! waiting for space. `close()` wakes every waiter for shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;

use crate::frame::{AudioFrame, Packet, Timed, VideoFrame};

/// What to do when a push would exceed the queue ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the producer until space frees up (on-demand playback).
    Block,
    /// Evict the oldest entries to make room (live playback).
    DropOldest,
}

/// Occupancy ceiling of a queue.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueueLimits {
    /// Maximum number of queued entries.
    pub max_items: usize,
    /// Maximum summed duration in seconds. A single entry is always admitted.
    pub max_duration: f64,
}

impl QueueLimits {
    pub fn new(max_items: usize, max_duration: f64) -> Self {
        Self {
            max_items: max_items.max(1),
            max_duration: if max_duration.is_finite() && max_duration > 0.0 {
                max_duration
            } else {
                f64::INFINITY
            },
        }
    }
}

/// Result of a push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Entry queued; `evicted` older entries were dropped to make room.
    Queued { evicted: usize },
    /// The queue was flushed under a newer serial; the entry was discarded.
    Stale,
    /// The queue is closed; the entry was discarded.
    Closed,
}

/// Snapshot of queue contents.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Occupancy {
    pub count: usize,
    /// Summed duration of queued entries, in seconds.
    pub duration: f64,
}

/// Bounded FIFO of timed entries.
///
/// ## Design
/// - Any number of producers and consumers.
/// - A single [`Condvar`] signals every state change (push, pop, flush, close).
/// - `done` and `serial` live under the same mutex as the entries so that waiters can
///   never miss a flush or close.
pub struct TimedQueue<T> {
    label: &'static str,
    inner: Mutex<QueueInner<T>>,
    cv: Condvar,
    limits: QueueLimits,
    policy: OverflowPolicy,
    doorbell: Option<Sender<()>>,
    overflow_log_ms: AtomicU64,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    duration: f64,
    serial: u64,
    done: bool,
}

/// Queue of coded packets feeding one decode thread.
pub type PacketQueue = TimedQueue<Packet>;
/// Queue of decoded audio waiting for the audio sink.
pub type AudioFrameQueue = TimedQueue<AudioFrame>;
/// Queue of decoded pictures waiting for the video sink.
pub type VideoFrameQueue = TimedQueue<VideoFrame>;

impl<T: Timed> TimedQueue<T> {
    pub fn new(label: &'static str, limits: QueueLimits, policy: OverflowPolicy) -> Self {
        Self {
            label,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                duration: 0.0,
                serial: 0,
                done: false,
            }),
            cv: Condvar::new(),
            limits,
            policy,
            doorbell: None,
            overflow_log_ms: AtomicU64::new(0),
        }
    }

    /// Ring `doorbell` (without blocking) whenever occupancy changes.
    ///
    /// A `bounded(1)` channel coalesces bursts into a single wake-up.
    pub fn with_doorbell(mut self, doorbell: Sender<()>) -> Self {
        self.doorbell = Some(doorbell);
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Serial currently accepted by [`TimedQueue::push`].
    pub fn serial(&self) -> u64 {
        self.inner.lock().unwrap().serial
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current count and buffered duration (best-effort snapshot).
    pub fn occupancy(&self) -> Occupancy {
        let g = self.inner.lock().unwrap();
        Occupancy {
            count: g.items.len(),
            duration: g.duration,
        }
    }

    /// Whether the queue has been closed for shutdown.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Mark the queue closed and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        drop(g);
        self.cv.notify_all();
        self.ring();
    }

    /// Drop every entry and start accepting pushes tagged with `serial` only.
    pub fn flush(&self, serial: u64) {
        let mut g = self.inner.lock().unwrap();
        g.items.clear();
        g.duration = 0.0;
        g.serial = serial;
        drop(g);
        self.cv.notify_all();
        self.ring();
    }

    /// Push one entry produced under `serial`.
    ///
    /// With [`OverflowPolicy::Block`] this waits until the entry fits, the queue is
    /// flushed under another serial, or the queue is closed.
    pub fn push(&self, item: T, serial: u64) -> PushOutcome {
        let item_duration = sanitize(item.duration());
        let mut g = self.inner.lock().unwrap();
        let mut evicted = 0;

        loop {
            if g.done {
                return PushOutcome::Closed;
            }
            if g.serial != serial {
                return PushOutcome::Stale;
            }
            if self.fits(&g, item_duration) {
                break;
            }
            match self.policy {
                OverflowPolicy::Block => {
                    g = self.cv.wait(g).unwrap();
                }
                OverflowPolicy::DropOldest => {
                    if let Some(old) = g.items.pop_front() {
                        g.duration = (g.duration - sanitize(old.duration())).max(0.0);
                        evicted += 1;
                    }
                }
            }
        }

        g.items.push_back(item);
        g.duration += item_duration;
        drop(g);
        self.cv.notify_all();
        self.ring();
        if evicted > 0 {
            self.log_overflow(evicted);
        }
        PushOutcome::Queued { evicted }
    }

    /// Pop the oldest entry without blocking.
    pub fn pop(&self) -> Option<T> {
        let mut g = self.inner.lock().unwrap();
        let item = self.take_front(&mut g)?;
        drop(g);
        self.cv.notify_all();
        self.ring();
        Some(item)
    }

    /// Pop the oldest entry, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or when the queue is closed and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.pop_tagged(timeout).map(|(item, _serial)| item)
    }

    /// Like [`TimedQueue::pop_timeout`], also returning the serial the entry was queued
    /// under. Consumers tag everything they derive from the entry with that serial.
    pub fn pop_tagged(&self, timeout: Duration) -> Option<(T, u64)> {
        let mut g = self.inner.lock().unwrap();
        if g.items.is_empty() && !g.done {
            let (ng, _timeout) = self.cv.wait_timeout(g, timeout).unwrap();
            g = ng;
        }
        let item = self.take_front(&mut g)?;
        let serial = g.serial;
        drop(g);
        self.cv.notify_all();
        self.ring();
        Some((item, serial))
    }

    /// Presentation time of the oldest entry.
    pub fn peek_pts(&self) -> Option<f64> {
        let g = self.inner.lock().unwrap();
        g.items.front().map(|item| item.pts())
    }

    /// Pop every entry due at `time` (pts `<= time`).
    ///
    /// Returns the newest due entry together with how many older due entries were
    /// discarded in its favour. Entries still in the future stay queued.
    pub fn pop_through(&self, time: f64) -> (Option<T>, usize) {
        let mut g = self.inner.lock().unwrap();
        let mut latest = None;
        let mut skipped = 0;
        while g.items.front().is_some_and(|item| item.pts() <= time) {
            if let Some(item) = self.take_front(&mut g) {
                if latest.replace(item).is_some() {
                    skipped += 1;
                }
            }
        }
        drop(g);
        if latest.is_some() {
            self.cv.notify_all();
            self.ring();
        }
        (latest, skipped)
    }

    fn fits(&self, g: &QueueInner<T>, item_duration: f64) -> bool {
        if g.items.len() >= self.limits.max_items {
            return false;
        }
        g.items.is_empty() || g.duration + item_duration <= self.limits.max_duration
    }

    fn take_front(&self, g: &mut QueueInner<T>) -> Option<T> {
        let item = g.items.pop_front()?;
        if g.items.is_empty() {
            g.duration = 0.0;
        } else {
            g.duration = (g.duration - sanitize(item.duration())).max(0.0);
        }
        Some(item)
    }

    fn ring(&self) {
        if let Some(doorbell) = &self.doorbell {
            let _ = doorbell.try_send(());
        }
    }

    fn log_overflow(&self, evicted: usize) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_millis(0))
            .as_millis() as u64;
        let last = self.overflow_log_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.overflow_log_ms.store(now, Ordering::Relaxed);
            tracing::info!(
                queue = self.label,
                evicted,
                max_items = self.limits.max_items,
                "live queue overflow, dropped oldest"
            );
        }
    }
}

fn sanitize(duration: f64) -> f64 {
    if duration.is_finite() && duration > 0.0 {
        duration
    } else {
        0.0
    }
}
