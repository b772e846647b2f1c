//! Timer queue ordered by virtual time.

use std::{collections::BTreeMap, fmt, time::Duration};

/// Priority assigned to timers scheduled without an explicit priority.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Work invoked on the dispatcher's own context when a timer fires.
pub(crate) type Callback = Box<dyn FnOnce()>;

/// Position of a timer in the queue.
///
/// Timers are ordered by `(at, priority, sequence)`. Lower priorities fire first and
/// `sequence`, assigned at insertion, breaks remaining ties in FIFO order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Key {
    at: Duration,
    priority: i32,
    sequence: u64,
}

/// Handle to a scheduled timer, used to cancel it before it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(Key);

impl TimerHandle {
    /// Returns the virtual time at which the timer fires.
    pub fn deadline(&self) -> Duration {
        self.0.at
    }

    /// Returns the insertion sequence of the timer.
    pub fn sequence(&self) -> u64 {
        self.0.sequence
    }
}

/// Queue of pending timers.
///
/// Cancelling a timer drops its callback immediately rather than leaving a tombstone
/// behind, so anything the callback captured is released as soon as it is no longer needed.
#[derive(Default)]
pub(crate) struct Dispatcher {
    queue: BTreeMap<Key, Callback>,
    sequence: u64,
}

impl Dispatcher {
    /// Insert a timer firing at `at`.
    pub(crate) fn insert(&mut self, at: Duration, priority: i32, callback: Callback) -> TimerHandle {
        let key = Key {
            at,
            priority,
            sequence: self.sequence,
        };
        self.sequence = self
            .sequence
            .checked_add(1)
            .expect("timer sequence overflow");
        self.queue.insert(key, callback);
        TimerHandle(key)
    }

    /// Remove a timer that has not fired yet.
    ///
    /// Returns `None` if the timer already fired or was already cancelled.
    pub(crate) fn cancel(&mut self, handle: TimerHandle) -> Option<Callback> {
        self.queue.remove(&handle.0)
    }

    /// Remove the earliest timer.
    pub(crate) fn pop(&mut self) -> Option<(Duration, Callback)> {
        self.queue
            .pop_first()
            .map(|(key, callback)| (key.at, callback))
    }

    /// Returns the time of the earliest timer.
    pub(crate) fn peek(&self) -> Option<Duration> {
        self.queue.first_key_value().map(|(key, _)| key.at)
    }

    /// Returns the number of pending timers.
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Remove every pending timer, returning their callbacks so the caller can drop them
    /// outside of any borrow.
    pub(crate) fn drain(&mut self) -> Vec<Callback> {
        std::mem::take(&mut self.queue).into_values().collect()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.queue.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}
