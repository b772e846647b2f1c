//! Cooperative threads.

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

/// Identifier of a cooperative thread, unique within a simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a cooperative thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Allocated but not yet given control.
    Created,
    /// Holding control. At most one thread is running at any instant: a thread that hands
    /// control to another is suspended until control comes back.
    Running,
    /// Parked at a suspension point, or waiting for a thread it resumed to hand control back.
    Suspended,
    /// The body returned.
    Terminated,
}

/// The party that regains control when a thread next suspends or terminates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Party {
    Dispatcher,
    Thread(ThreadId),
}

impl From<Option<ThreadId>> for Party {
    fn from(current: Option<ThreadId>) -> Self {
        current.map_or(Party::Dispatcher, Party::Thread)
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Dispatcher => write!(f, "dispatcher"),
            Party::Thread(id) => write!(f, "thread {id}"),
        }
    }
}

/// Type-erased thread body.
pub(crate) type Body = Pin<Box<dyn Future<Output = ()>>>;

/// Kernel-side record of a cooperative thread.
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) label: String,
    pub(crate) state: Cell<State>,
    pub(crate) parent: Cell<Party>,

    // Taken out while the body is being polled, so a second resumption of a running
    // thread is detected instead of re-entering its future.
    pub(crate) body: RefCell<Option<Body>>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, label: String, body: Body) -> Self {
        Self {
            id,
            label,
            state: Cell::new(State::Created),
            parent: Cell::new(Party::Dispatcher),
            body: RefCell::new(Some(body)),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state.get())
            .field("parent", &self.parent.get())
            .finish()
    }
}

/// Handle to a cooperative thread, returned by [crate::Spawner::new_thread].
///
/// The handle observes the thread and collects the value its body returned.
pub struct Handle<T> {
    thread: Rc<Thread>,
    output: Rc<RefCell<Option<T>>>,
}

impl<T> Handle<T> {
    pub(crate) fn new(thread: Rc<Thread>, output: Rc<RefCell<Option<T>>>) -> Self {
        Self { thread, output }
    }

    /// Returns the identifier of the thread.
    pub fn id(&self) -> ThreadId {
        self.thread.id
    }

    /// Returns the label the thread was created with.
    pub fn label(&self) -> &str {
        &self.thread.label
    }

    /// Returns the current state of the thread.
    pub fn state(&self) -> State {
        self.thread.state.get()
    }

    /// Returns the party that resumed the thread most recently.
    pub fn resume_target(&self) -> Party {
        self.thread.parent.get()
    }

    /// Returns `true` once the body has returned.
    pub fn is_finished(&self) -> bool {
        self.state() == State::Terminated
    }

    /// Take the value returned by the body, if it has returned and the value was not
    /// already taken.
    pub fn take(&self) -> Option<T> {
        self.output.borrow_mut().take()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            thread: self.thread.clone(),
            output: self.output.clone(),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.thread).finish()
    }
}

/// Give control back to whoever resumed the current thread.
///
/// The first poll parks the thread; the next poll (issued by whoever resumes it) completes.
pub(crate) fn suspend() -> Suspend {
    Suspend { yielded: false }
}

pub(crate) struct Suspend {
    yielded: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    #[test]
    fn test_suspend_yields_once() {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut suspend = suspend();
        assert!(Pin::new(&mut suspend).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut suspend).poll(&mut cx).is_ready());
    }

    #[test]
    fn test_party_from_current() {
        assert_eq!(Party::from(None), Party::Dispatcher);
        assert_eq!(
            Party::from(Some(ThreadId::new(3))),
            Party::Thread(ThreadId::new(3))
        );
        assert_eq!(Party::Thread(ThreadId::new(3)).to_string(), "thread 3");
    }

    #[test]
    fn test_handle_output() {
        let thread = Rc::new(Thread::new(
            ThreadId::new(1),
            "worker".into(),
            Box::pin(async {}),
        ));
        let output = Rc::new(RefCell::new(None));
        let handle = Handle::new(thread.clone(), output.clone());
        assert_eq!(handle.state(), State::Created);
        assert_eq!(handle.label(), "worker");
        assert!(handle.take().is_none());

        *output.borrow_mut() = Some(5);
        thread.state.set(State::Terminated);
        assert!(handle.is_finished());
        assert_eq!(handle.clone().take(), Some(5));
        assert_eq!(handle.take(), None);
    }
}
