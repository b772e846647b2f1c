use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
};
use std::net::Ipv4Addr;
use tempo_runtime::Metrics as _;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct Route {
    pub(crate) source: String,
    pub(crate) dest: String,
}

impl Route {
    pub(crate) fn new(source: Ipv4Addr, dest: Ipv4Addr) -> Self {
        Self {
            source: source.to_string(),
            dest: dest.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Metrics {
    pub(crate) packets_sent: Family<Route, Counter>,
    pub(crate) packets_delivered: Family<Route, Counter>,
    pub(crate) bytes_transmitted: Family<Route, Counter>,
}

impl Metrics {
    pub(crate) fn init(context: &tempo_runtime::deterministic::Simulation) -> Self {
        let metrics = Self::default();
        context.register(
            "packets_sent",
            "Total number of packets handed to a link",
            metrics.packets_sent.clone(),
        );
        context.register(
            "packets_delivered",
            "Total number of packets delivered to their destination host",
            metrics.packets_delivered.clone(),
        );
        context.register(
            "bytes_transmitted",
            "Total number of payload bytes put on a link",
            metrics.bytes_transmitted.clone(),
        );
        metrics
    }
}
