//! Synchronization primitives for cooperative threads.
//!
//! Every primitive is built on [Event]: a thread that cannot proceed parks itself on an event
//! and is handed control again, synchronously, by whoever notifies it (or by the dispatcher
//! when its timeout elapses).

mod event;
pub use event::Event;
mod mutex;
pub use mutex::Mutex;
mod semaphore;
pub use semaphore::Semaphore;
