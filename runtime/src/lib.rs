//! Run cooperative threads against a deterministic virtual clock.
//!
//! This crate provides a discrete-event simulation kernel. Application code runs inside
//! cooperative threads that only give up control at explicit suspension points
//! ([Clock::sleep], [Event::wait], [Semaphore::wait], [Mutex::lock]). A single dispatcher owns
//! a queue of timers ordered by virtual time and resolves which thread runs next, so every run
//! with the same inputs produces the same interleaving.
//!
//! # Terminology
//!
//! The runtime is composed of a [deterministic::Runner] that drives the dispatcher and a
//! [deterministic::Simulation] context that implements [Clock], [Spawner] and [Metrics]. The
//! context is cheap to clone and is handed to every thread body.
//!
//! # Example
//!
//! ```rust
//! use tempo_runtime::{deterministic::Executor, Clock, Event, Spawner};
//!
//! let (runner, context, _) = Executor::default();
//! let ready: Event<u32> = Event::new(&context);
//! context.new_thread({
//!     let ready = ready.clone();
//!     move |context| async move {
//!         let value = ready.wait(Some(1.0)).await.unwrap();
//!         assert_eq!(value, 7);
//!         assert_eq!(context.now(), 0.25);
//!     }
//! });
//! context.new_thread(move |context| async move {
//!     context.sleep(0.25).await.unwrap();
//!     ready.notify(7);
//! });
//! let report = runner.run().unwrap();
//! assert_eq!(report.threads_terminated, 2);
//! ```

use prometheus_client::registry::Metric;
use std::{future::Future, time::Duration};
use thiserror::Error;

mod audit;
pub use audit::Auditor;
mod clock;
pub mod deterministic;
mod dispatcher;
pub use dispatcher::{TimerHandle, DEFAULT_PRIORITY};
mod journal;
pub use journal::{Kind, Record};
mod sync;
pub use sync::{Event, Mutex, Semaphore};
mod telemetry;
mod thread;
pub use thread::{Handle, Party, State, ThreadId};

/// Prefix for runtime metrics.
const METRICS_PREFIX: &str = "runtime";

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid delay: {0}")]
    InvalidDelay(f64),
    #[error("invalid duration: {0}")]
    InvalidDuration(f64),
    #[error("timeout")]
    Timeout,
    #[error("not held")]
    NotHeld,
    #[error("not in a thread")]
    NotInThread,
    #[error("deadlock: {} threads blocked forever", .0.len())]
    Deadlock(Vec<ThreadId>),
    #[error("deadline exceeded: {0:?}")]
    DeadlineExceeded(Duration),
}

/// Interface that any simulation context must implement to create cooperative threads.
pub trait Spawner: Clone + 'static {
    /// Create a new thread running `f` and immediately transfer control to it.
    ///
    /// The caller regains control once the new thread reaches its first suspension point
    /// or returns. The thread receives its own context, labelled like the caller's.
    fn new_thread<F, Fut, T>(&self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static;
}

/// Interface that any simulation context must implement to expose virtual time.
pub trait Clock: Clone + 'static {
    /// Returns the current virtual time, measured from the start of the run.
    fn current(&self) -> Duration;

    /// Returns the current virtual time in seconds.
    fn now(&self) -> f64 {
        self.current().as_secs_f64()
    }

    /// Suspend the calling thread for `secs` of virtual time.
    ///
    /// Fails with [Error::InvalidDuration] if `secs` is negative or not finite and with
    /// [Error::NotInThread] if not called from a cooperative thread.
    fn sleep(&self, secs: f64) -> impl Future<Output = Result<(), Error>> + 'static;
}

/// Interface to register and export metrics.
pub trait Metrics: Clone + 'static {
    /// Create a new instance of `Metrics` with the given label appended to the end
    /// of the current `Metrics` label.
    ///
    /// This is commonly used to create a nested context for `register`.
    ///
    /// It is not permitted for any implementation to use `METRICS_PREFIX` as the start of a
    /// label (reserved for metrics for the runtime).
    fn with_label(&self, label: &str) -> Self;

    /// Get the current label of the context.
    fn label(&self) -> String;

    /// Register a metric with the runtime.
    ///
    /// Any registered metric will include (as a prefix) the label of the current context.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Encode all metrics into a buffer.
    fn encode(&self) -> String;
}
