use crate::{
    clock::to_duration,
    deterministic::{Executor, Simulation},
    dispatcher::{TimerHandle, DEFAULT_PRIORITY},
    thread::suspend,
    Error, Kind, ThreadId,
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    mem::take,
    rc::Rc,
};
use tracing::trace;

type Outcome<T> = Rc<RefCell<Option<Result<T, Error>>>>;

struct Waiter<T> {
    ticket: u64,
    thread: ThreadId,
    watchdog: Option<TimerHandle>,
    outcome: Outcome<T>,
}

struct Waiters<T> {
    next: u64,
    queue: VecDeque<Waiter<T>>,
}

/// Withdraws a waiter whose wait future is dropped before an outcome is delivered.
struct Abandon<'a, T> {
    executor: &'a Executor,
    waiters: &'a RefCell<Waiters<T>>,
    ticket: u64,
}

impl<T> Drop for Abandon<'_, T> {
    fn drop(&mut self) {
        let waiter = {
            let mut waiters = self.waiters.borrow_mut();
            let position = waiters
                .queue
                .iter()
                .position(|waiter| waiter.ticket == self.ticket);
            position.and_then(|position| waiters.queue.remove(position))
        };
        let Some(waiter) = waiter else {
            return;
        };
        if let Some(watchdog) = waiter.watchdog {
            self.executor.cancel(watchdog);
        }
        trace!(thread = %waiter.thread, ticket = self.ticket, "wait abandoned");
    }
}

/// Condition variable that cooperative threads can wait on, with an optional timeout.
///
/// [Event::notify] releases every thread waiting at that moment, in the order they started
/// waiting, handing each of them `payload`. A waiter that times out is removed before it
/// resumes, so a notification arriving afterwards never reaches it.
pub struct Event<T = ()> {
    id: u64,
    executor: Rc<Executor>,
    waiters: Rc<RefCell<Waiters<T>>>,
}

impl<T: Clone + 'static> Event<T> {
    /// Create an event with no waiters.
    pub fn new(context: &Simulation) -> Self {
        Self::with_executor(context.executor().clone())
    }

    pub(crate) fn with_executor(executor: Rc<Executor>) -> Self {
        Self {
            id: executor.next_object(),
            executor,
            waiters: Rc::new(RefCell::new(Waiters {
                next: 0,
                queue: VecDeque::new(),
            })),
        }
    }

    /// Returns the identifier of the event (used in journal records).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the number of threads currently waiting.
    pub fn waiting(&self) -> usize {
        self.waiters.borrow().queue.len()
    }

    /// Returns `true` if `thread` is currently waiting on this event.
    pub fn is_waiting(&self, thread: ThreadId) -> bool {
        self.waiters
            .borrow()
            .queue
            .iter()
            .any(|waiter| waiter.thread == thread)
    }

    /// Suspend the current thread until the event is notified or `timeout` seconds elapse.
    ///
    /// Returns the payload passed to [Event::notify], [Error::Timeout] if the timeout elapsed
    /// first, [Error::InvalidDuration] if `timeout` is negative or not finite, and
    /// [Error::NotInThread] outside of a cooperative thread.
    pub async fn wait(&self, timeout: Option<f64>) -> Result<T, Error> {
        let delay = timeout
            .map(|secs| to_duration(secs).ok_or(Error::InvalidDuration(secs)))
            .transpose()?;
        let thread = self.executor.current().ok_or(Error::NotInThread)?;
        let ticket = {
            let mut waiters = self.waiters.borrow_mut();
            let ticket = waiters.next;
            waiters.next += 1;
            ticket
        };
        self.executor
            .record(Some(thread), Kind::Wait, format!("event {}", self.id));

        // Arm the watchdog
        let watchdog = delay.map(|delay| {
            let id = self.id;
            let executor = self.executor.clone();
            let waiters = self.waiters.clone();
            self.executor.schedule(
                delay,
                DEFAULT_PRIORITY,
                Box::new(move || {
                    let waiter = {
                        let mut waiters = waiters.borrow_mut();
                        let position = waiters
                            .queue
                            .iter()
                            .position(|waiter| waiter.ticket == ticket);
                        position.and_then(|position| waiters.queue.remove(position))
                    };
                    let Some(waiter) = waiter else {
                        return;
                    };
                    *waiter.outcome.borrow_mut() = Some(Err(Error::Timeout));
                    executor.metrics().timeouts.inc();
                    executor.record(Some(waiter.thread), Kind::Timeout, format!("event {id}"));
                    executor.resume(waiter.thread);
                }),
            )
        });

        // Park until one of the two outcomes is delivered
        let outcome: Outcome<T> = Rc::new(RefCell::new(None));
        self.waiters.borrow_mut().queue.push_back(Waiter {
            ticket,
            thread,
            watchdog,
            outcome: outcome.clone(),
        });
        let _abandon = Abandon {
            executor: &self.executor,
            waiters: &self.waiters,
            ticket,
        };
        loop {
            suspend().await;
            let result = outcome.borrow_mut().take();
            if let Some(result) = result {
                return result;
            }
            trace!(thread = %thread, event = self.id, "spurious resume");
        }
    }

    /// Release every thread currently waiting, in the order they started waiting.
    ///
    /// Each waiter runs until it suspends again or terminates before the next one is
    /// released. Returns the number of threads released.
    pub fn notify(&self, payload: T) -> usize {
        let waiters = take(&mut self.waiters.borrow_mut().queue);
        let current = self.executor.current();
        self.executor.record(
            current,
            Kind::Notify,
            format!("event {} waiters={}", self.id, waiters.len()),
        );
        for waiter in &waiters {
            if let Some(watchdog) = waiter.watchdog {
                self.executor.cancel(watchdog);
            }
        }

        let released = waiters.len();
        for waiter in waiters {
            *waiter.outcome.borrow_mut() = Some(Ok(payload.clone()));
            self.executor.metrics().notifications.inc();
            self.executor
                .record(Some(waiter.thread), Kind::Release, format!("event {}", self.id));
            self.executor.resume(waiter.thread);
        }
        released
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            executor: self.executor.clone(),
            waiters: self.waiters.clone(),
        }
    }
}

impl<T> PartialEq for Event<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.waiters, &other.waiters)
    }
}

impl<T> Eq for Event<T> {}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("waiting", &self.waiters.borrow().queue.len())
            .finish()
    }
}
