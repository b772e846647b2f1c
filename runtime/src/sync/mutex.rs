use super::Semaphore;
use crate::{
    deterministic::{Executor, Simulation},
    Error, Kind, ThreadId,
};
use std::{cell::Cell, fmt, rc::Rc};
use tracing::warn;

/// Mutual exclusion lock for cooperative threads.
///
/// The lock remembers which thread holds it: only the holder may unlock it.
#[derive(Clone)]
pub struct Mutex {
    id: u64,
    executor: Rc<Executor>,
    semaphore: Semaphore,
    holder: Rc<Cell<Option<ThreadId>>>,
}

impl Mutex {
    /// Create an unlocked mutex.
    pub fn new(context: &Simulation) -> Self {
        let executor = context.executor().clone();
        Self {
            id: executor.next_object(),
            semaphore: Semaphore::with_executor(executor.clone(), 1),
            executor,
            holder: Rc::new(Cell::new(None)),
        }
    }

    /// Returns `true` if some thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.holder.get().is_some()
    }

    /// Returns the thread holding the lock.
    pub fn holder(&self) -> Option<ThreadId> {
        self.holder.get()
    }

    /// Acquire the lock, blocking for at most `timeout` seconds.
    ///
    /// A lock attempt that fails leaves the mutex untouched.
    pub async fn lock(&self, timeout: Option<f64>) -> Result<(), Error> {
        let thread = self.executor.current().ok_or(Error::NotInThread)?;
        self.semaphore.wait(timeout).await?;
        self.holder.set(Some(thread));
        self.executor
            .record(Some(thread), Kind::Lock, format!("mutex {}", self.id));
        Ok(())
    }

    /// Release the lock, handing it to the longest-blocked thread if there is one.
    ///
    /// Fails with [Error::NotHeld] if the mutex is not locked or the caller is not the
    /// holder.
    pub fn unlock(&self) -> Result<(), Error> {
        let current = self.executor.current();
        let holder = self.holder.get();
        if holder.is_none() || holder != current {
            warn!(mutex = self.id, ?holder, ?current, "unlock by non-holder");
            return Err(Error::NotHeld);
        }
        self.holder.set(None);
        self.executor
            .record(current, Kind::Unlock, format!("mutex {}", self.id));
        self.semaphore.post();
        Ok(())
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("id", &self.id)
            .field("holder", &self.holder.get())
            .field("waiting", &self.semaphore.waiting())
            .finish()
    }
}
