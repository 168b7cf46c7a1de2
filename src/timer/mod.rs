//! Fixed-tick timeout queue, one per worker.
//!
//! Every entry waits the same duration, so insertion order is expiry order
//! and a FIFO is enough. Cancelling clears the callback in place and leaves a
//! tombstone that [`TimerQueue::process`] pops without invoking. An entry
//! fires no earlier than `tick` after insertion and at most one processing
//! interval later.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Handle returned by [`TimerQueue::add`] for cancellation.
pub type TimerKey = usize;

type Callback = Box<dyn FnOnce()>;

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// FIFO of deadlines that all share one tick.
///
/// # Examples
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use std::time::{Duration, Instant};
/// use corvid::timer::TimerQueue;
///
/// let fired = Rc::new(Cell::new(false));
/// let mut timers = TimerQueue::new(Duration::from_secs(5));
/// let start = Instant::now();
///
/// let flag = Rc::clone(&fired);
/// timers.add_at(start, move || flag.set(true));
///
/// timers.process_at(start + Duration::from_secs(4));
/// assert!(!fired.get());
/// timers.process_at(start + Duration::from_secs(5));
/// assert!(fired.get());
/// ```
pub struct TimerQueue {
    entries: VecDeque<(Instant, Option<Callback>)>,
    /// Key of the entry at the front of `entries`.
    step: TimerKey,
    tick: Duration,
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("len", &self.entries.len())
            .field("step", &self.step)
            .field("tick", &self.tick)
            .finish()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl TimerQueue {
    pub fn new(tick: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            step: 0,
            tick,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Registers `callback` to run one tick from now.
    pub fn add<F>(&mut self, callback: F) -> TimerKey
    where
        F: FnOnce() + 'static,
    {
        self.add_at(Instant::now(), callback)
    }

    /// Registers `callback` as if inserted at `now`.
    ///
    /// `now` must not be earlier than the last insertion.
    pub fn add_at<F>(&mut self, now: Instant, callback: F) -> TimerKey
    where
        F: FnOnce() + 'static,
    {
        self.entries.push_back((now, Some(Box::new(callback))));
        self.step + self.entries.len() - 1
    }

    /// Cancels a pending entry. Unknown, fired and cancelled keys are ignored.
    pub fn cancel(&mut self, key: TimerKey) {
        if key < self.step {
            return;
        }
        if let Some((_, callback)) = self.entries.get_mut(key - self.step) {
            *callback = None;
        }
    }

    /// Fires every entry that is at least one tick old.
    pub fn process(&mut self) -> usize {
        self.process_at(Instant::now())
    }

    /// Like [`process`](Self::process) with an explicit clock; returns the
    /// number of callbacks invoked.
    pub fn process_at(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some((inserted, _)) = self.entries.front() {
            if now.saturating_duration_since(*inserted) < self.tick {
                break;
            }
            if let Some((_, Some(callback))) = self.entries.pop_front() {
                callback();
                fired += 1;
            }
            self.step += 1;
        }
        fired
    }

    /// Number of queued entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that would still fire.
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|(_, cb)| cb.is_some()).count()
    }
}
