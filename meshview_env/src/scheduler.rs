//! Deterministic continuation scheduler.
//!
//! The core is single-threaded and cooperative: everything that "happens
//! later" (heartbeat ticks, job steps, classification steps) is queued here
//! as a task value with a due time. The scheduler is a min-heap keyed by
//! `(due, id)`; ids are strictly increasing, so two tasks due at the same
//! instant run in the order they were scheduled.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use crate::error::EnvError;

/// Identifier of a scheduled continuation. Strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl TimerId {
    /// Return the raw value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T#{}", self.0)
    }
}

/// A task together with the instant it becomes due.
#[derive(Debug, Clone)]
pub struct Scheduled<T> {
    pub id: TimerId,
    pub due: Duration,
    pub task: T,
}

/// Ordering: smallest `(due, id)` first.
///
/// `BinaryHeap` is a max-heap, so the comparison is reversed. The task
/// payload takes no part in ordering.
impl<T> Ord for Scheduled<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.due == other.due
    }
}

impl<T> Eq for Scheduled<T> {}

/// The scheduling seam used by the engine.
///
/// `after(delay, task)` is the only way to defer work. The owner drives the
/// queue by repeatedly popping due tasks; nothing runs on its own.
pub trait Scheduler<T>: Send {
    /// Current logical time.
    fn now(&self) -> Duration;

    /// Queues `task` to become due `delay` after now.
    fn after(&mut self, delay: Duration, task: T) -> TimerId;

    /// Due time of the earliest queued task.
    fn next_due(&self) -> Option<Duration>;

    /// Removes the earliest task if it is due at or before `until`, moving
    /// the clock to its due time.
    fn pop_due(&mut self, until: Duration) -> Option<Scheduled<T>>;

    /// Moves the clock forward to `to`.
    ///
    /// # Errors
    /// Returns [`EnvError::ClockRewind`] if `to` is before now.
    fn advance_to(&mut self, to: Duration) -> Result<(), EnvError>;

    /// Number of queued tasks.
    fn pending(&self) -> usize;
}

/// Virtual-time implementation of [`Scheduler`].
///
/// Time only moves when the owner pops a task or advances the clock, so
/// tests can step through hours of simulated activity instantly.
#[derive(Debug)]
pub struct VirtualScheduler<T> {
    now: Duration,
    next_id: u64,
    queue: BinaryHeap<Scheduled<T>>,
}

impl<T> VirtualScheduler<T> {
    /// Create a new, empty scheduler at time zero.
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_id: 0,
            queue: BinaryHeap::new(),
        }
    }

    /// Drops every queued task.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl<T> Default for VirtualScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Scheduler<T> for VirtualScheduler<T> {
    fn now(&self) -> Duration {
        self.now
    }

    fn after(&mut self, delay: Duration, task: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let due = self.now.saturating_add(delay);
        self.queue.push(Scheduled { id, due, task });
        id
    }

    fn next_due(&self) -> Option<Duration> {
        self.queue.peek().map(|s| s.due)
    }

    fn pop_due(&mut self, until: Duration) -> Option<Scheduled<T>> {
        if self.queue.peek()?.due > until {
            return None;
        }
        let next = self.queue.pop()?;
        // A task scheduled with zero delay while the clock was already past
        // its due time must not pull the clock backwards.
        self.now = self.now.max(next.due);
        Some(next)
    }

    fn advance_to(&mut self, to: Duration) -> Result<(), EnvError> {
        if to < self.now {
            return Err(EnvError::rewind(to, self.now));
        }
        self.now = to;
        Ok(())
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}
