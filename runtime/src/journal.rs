//! Structured log of everything that happened during a run.

use crate::ThreadId;
use std::{fmt, time::Duration};

/// What a [Record] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A thread was created.
    Spawn,
    /// A thread's body returned.
    Exit,
    /// A thread went to sleep.
    Sleep,
    /// A sleeping thread woke up.
    Wake,
    /// A thread started waiting on an event.
    Wait,
    /// A thread notified an event.
    Notify,
    /// A waiting thread was released by a notification.
    Release,
    /// A waiting thread gave up after its timeout elapsed.
    Timeout,
    /// A thread acquired a mutex.
    Lock,
    /// A thread released a mutex.
    Unlock,
    /// A record written by application code.
    App(&'static str),
}

impl Kind {
    /// Returns the name of the kind, as it appears in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Spawn => "spawn",
            Kind::Exit => "exit",
            Kind::Sleep => "sleep",
            Kind::Wake => "wake",
            Kind::Wait => "wait",
            Kind::Notify => "notify",
            Kind::Release => "release",
            Kind::Timeout => "timeout",
            Kind::Lock => "lock",
            Kind::Unlock => "unlock",
            Kind::App(name) => name,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single entry of the journal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Virtual time at which the record was written.
    pub time: Duration,
    /// Thread the record is about (`None` for the dispatcher).
    pub thread: Option<ThreadId>,
    pub kind: Kind,
    pub detail: String,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>10.6} ", self.time.as_secs_f64())?;
        match self.thread {
            Some(id) => write!(f, "thread {id} ")?,
            None => write!(f, "dispatcher ")?,
        }
        write!(f, "{}", self.kind)?;
        if !self.detail.is_empty() {
            write!(f, " {}", self.detail)?;
        }
        Ok(())
    }
}

/// Append-only sequence of [Record]s.
#[derive(Debug, Default)]
pub(crate) struct Journal {
    enabled: bool,
    records: Vec<Record>,
}

impl Journal {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, record: Record) {
        if self.enabled {
            self.records.push(record);
        }
    }

    pub(crate) fn records(&self) -> &[Record] {
        &self.records
    }
}
