use super::Event;
use crate::{
    clock::to_duration,
    deterministic::{Executor, Simulation},
    Error,
};
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};
use tracing::trace;

struct Inner {
    count: i64,
    queue: VecDeque<Event>,
}

/// Counting semaphore for cooperative threads.
///
/// Blocked waiters are released in the order they started waiting. The count goes negative
/// while threads are blocked: `-count` is the number of queued waiters.
#[derive(Clone)]
pub struct Semaphore {
    executor: Rc<Executor>,
    inner: Rc<RefCell<Inner>>,
}

impl Semaphore {
    /// Create a semaphore with `initial` units available.
    pub fn new(context: &Simulation, initial: u32) -> Self {
        Self::with_executor(context.executor().clone(), initial)
    }

    pub(crate) fn with_executor(executor: Rc<Executor>, initial: u32) -> Self {
        Self {
            executor,
            inner: Rc::new(RefCell::new(Inner {
                count: i64::from(initial),
                queue: VecDeque::new(),
            })),
        }
    }

    /// Returns the signed count.
    pub fn count(&self) -> i64 {
        self.inner.borrow().count
    }

    /// Returns the number of blocked waiters.
    pub fn waiting(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Take one unit, blocking for at most `timeout` seconds if none is available.
    ///
    /// A wait that fails, or whose future is dropped before it completes, leaves the count
    /// and the queue as they were before the call.
    pub async fn wait(&self, timeout: Option<f64>) -> Result<(), Error> {
        if let Some(secs) = timeout {
            to_duration(secs).ok_or(Error::InvalidDuration(secs))?;
        }
        self.executor.current().ok_or(Error::NotInThread)?;

        // Take a unit (or a place in the queue)
        let event = {
            let mut inner = self.inner.borrow_mut();
            inner.count -= 1;
            if inner.count >= 0 {
                return Ok(());
            }
            let event = Event::with_executor(self.executor.clone());
            inner.queue.push_back(event.clone());
            event
        };
        trace!(event = event.id(), "semaphore exhausted");

        // Give the place (or the unit) back on failure or when dropped
        let mut release = Release {
            semaphore: self,
            event: &event,
            acquired: false,
        };
        event.wait(timeout).await?;
        release.acquired = true;
        Ok(())
    }

    /// Return one unit, releasing the longest-blocked waiter if there is one.
    pub fn post(&self) {
        let next = {
            let mut inner = self.inner.borrow_mut();
            inner.count += 1;
            let mut next = None;
            while let Some(event) = inner.queue.pop_front() {
                if event.waiting() > 0 {
                    next = Some(event);
                    break;
                }
                trace!(event = event.id(), "skipped abandoned waiter");
            }
            next
        };
        if let Some(event) = next {
            event.notify(());
        }
    }
}

/// Undoes an unfinished [Semaphore::wait].
///
/// A waiter still queued gives its place back. A waiter that was handed a unit it never
/// observed passes the unit on.
struct Release<'a> {
    semaphore: &'a Semaphore,
    event: &'a Event,
    acquired: bool,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        let queued = {
            let mut inner = self.semaphore.inner.borrow_mut();
            let before = inner.queue.len();
            inner.queue.retain(|queued| queued != self.event);
            let queued = inner.queue.len() != before;
            if queued {
                inner.count += 1;
            }
            queued
        };
        if !queued {
            trace!(event = self.event.id(), "passing on unused unit");
            self.semaphore.post();
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Semaphore")
            .field("count", &inner.count)
            .field("waiting", &inner.queue.len())
            .finish()
    }
}
