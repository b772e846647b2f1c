//! Metrics maintained by the kernel.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct Work {
    pub(crate) label: String,
}

#[derive(Debug)]
pub(crate) struct Metrics {
    pub(crate) threads_spawned: Family<Work, Counter>,
    pub(crate) threads_running: Family<Work, Gauge>,
    pub(crate) thread_resumes: Family<Work, Counter>,
    pub(crate) timers_scheduled: Counter,
    pub(crate) timers_fired: Counter,
    pub(crate) timers_cancelled: Counter,
    pub(crate) notifications: Counter,
    pub(crate) timeouts: Counter,
}

impl Metrics {
    pub(crate) fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            threads_spawned: Family::default(),
            threads_running: Family::default(),
            thread_resumes: Family::default(),
            timers_scheduled: Counter::default(),
            timers_fired: Counter::default(),
            timers_cancelled: Counter::default(),
            notifications: Counter::default(),
            timeouts: Counter::default(),
        };
        registry.register(
            "threads_spawned",
            "Total number of threads spawned",
            metrics.threads_spawned.clone(),
        );
        registry.register(
            "threads_running",
            "Number of threads that have not terminated",
            metrics.threads_running.clone(),
        );
        registry.register(
            "thread_resumes",
            "Total number of times a thread was given control",
            metrics.thread_resumes.clone(),
        );
        registry.register(
            "timers_scheduled",
            "Total number of timers scheduled",
            metrics.timers_scheduled.clone(),
        );
        registry.register(
            "timers_fired",
            "Total number of timers fired",
            metrics.timers_fired.clone(),
        );
        registry.register(
            "timers_cancelled",
            "Total number of timers cancelled before firing",
            metrics.timers_cancelled.clone(),
        );
        registry.register(
            "notifications",
            "Total number of threads released by a notification",
            metrics.notifications.clone(),
        );
        registry.register(
            "timeouts",
            "Total number of waits that timed out",
            metrics.timeouts.clone(),
        );
        metrics
    }
}
