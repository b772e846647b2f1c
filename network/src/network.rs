use crate::{metrics::Metrics, Error, Host, Link, Packet};
use bytes::Bytes;
use std::{cell::Cell, net::Ipv4Addr};
use tempo_runtime::{deterministic::Simulation, Metrics as _};
use tracing::debug;

/// Propagation delay of the loopback link every host is created with, in seconds.
const LOOPBACK_DELAY: f64 = 1e-6;

/// Bandwidth of the loopback link every host is created with, in bytes per second.
const LOOPBACK_BANDWIDTH: f64 = 1e9;

/// Factory for the hosts, links, and packets of one simulation.
pub struct Network {
    context: Simulation,
    next_packet: Cell<u64>,
    metrics: Metrics,
}

impl Network {
    /// Create a network whose links run on `context`.
    ///
    /// Network metrics are registered under the `network` label.
    pub fn new(context: &Simulation) -> Self {
        let metrics = Metrics::init(&context.with_label("network"));
        Self {
            context: context.with_label("link"),
            next_packet: Cell::new(0),
            metrics,
        }
    }

    /// Create a host with address `ip` and a loopback link.
    pub fn host(&self, ip: Ipv4Addr) -> Host {
        let host = Host::new(self.context.clone(), ip, self.metrics.clone());
        let loopback = Link::new(
            self.context.clone(),
            &host,
            &host,
            LOOPBACK_DELAY,
            LOOPBACK_BANDWIDTH,
            self.metrics.clone(),
        );
        host.add_route(loopback);
        debug!(%ip, "created host");
        host
    }

    /// Create a unidirectional link from `source` to `dest` and register it as `source`'s
    /// route to `dest`.
    ///
    /// `bandwidth` (bytes per second) must be positive and finite; `prop_delay` (seconds)
    /// must be finite and not negative.
    pub fn link(
        &self,
        source: &Host,
        dest: &Host,
        prop_delay: f64,
        bandwidth: f64,
    ) -> Result<Link, Error> {
        if !bandwidth.is_finite() || bandwidth <= 0.0 {
            return Err(Error::InvalidBandwidth(bandwidth));
        }
        if !prop_delay.is_finite() || prop_delay < 0.0 {
            return Err(Error::InvalidDelay(prop_delay));
        }
        let link = Link::new(
            self.context.clone(),
            source,
            dest,
            prop_delay,
            bandwidth,
            self.metrics.clone(),
        );
        source.add_route(link.clone());
        debug!(%link, prop_delay, bandwidth, "created link");
        Ok(link)
    }

    /// Create a packet with the next identifier.
    pub fn packet(&self, origin: Ipv4Addr, dest: Ipv4Addr, payload: impl Into<Bytes>) -> Packet {
        let id = self.next_packet.get();
        self.next_packet.set(id + 1);
        Packet::new(id, origin, dest, payload.into())
    }
}
