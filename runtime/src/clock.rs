//! Virtual time.

use std::{cell::Cell, time::Duration};
use tracing::trace;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// The current virtual time of a simulation, measured from the start of the run.
///
/// Time is kept as an exact [Duration] (integer nanoseconds) so repeated sleeps never
/// accumulate floating-point drift.
#[derive(Debug, Default)]
pub(crate) struct Clock {
    time: Cell<Duration>,
}

impl Clock {
    /// Returns the current virtual time.
    pub(crate) fn now(&self) -> Duration {
        self.time.get()
    }

    /// Move the clock forward to `to`.
    ///
    /// The dispatcher only ever fires timers in order, so `to` is never in the past.
    pub(crate) fn advance(&self, to: Duration) {
        let current = self.time.get();
        assert!(to >= current, "clock moved backwards: {to:?} < {current:?}");
        if to > current {
            trace!(now = ?to, "time advanced");
        }
        self.time.set(to);
    }
}

/// Convert a delay expressed in seconds into a [Duration].
///
/// The value is rounded to the nearest nanosecond. Returns `None` when `secs` is negative,
/// not finite, or too large to represent.
pub(crate) fn to_duration(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let nanos = (secs * NANOS_PER_SEC).round();
    if nanos >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}
