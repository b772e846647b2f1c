use crate::{metrics::Metrics, Error, Link, Packet};
use std::{cell::RefCell, collections::BTreeMap, net::Ipv4Addr, rc::Rc};
use tempo_runtime::deterministic::Simulation;
use tracing::{debug, warn};

pub(crate) struct Inner {
    ip: Ipv4Addr,
    context: Simulation,
    routes: RefCell<BTreeMap<Ipv4Addr, Link>>,
    inbox: RefCell<Vec<Packet>>,
    metrics: Metrics,
}

/// An endpoint with exactly one IPv4 address.
///
/// A host forwards each packet it sends on the link registered for the packet's destination
/// and keeps every packet delivered to it.
#[derive(Clone)]
pub struct Host {
    inner: Rc<Inner>,
}

impl Host {
    pub(crate) fn new(context: Simulation, ip: Ipv4Addr, metrics: Metrics) -> Self {
        Self {
            inner: Rc::new(Inner {
                ip,
                context,
                routes: RefCell::new(BTreeMap::new()),
                inbox: RefCell::new(Vec::new()),
                metrics,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::rc::Weak<Inner> {
        Rc::downgrade(&self.inner)
    }

    /// Returns the address of the host.
    pub fn ip(&self) -> Ipv4Addr {
        self.inner.ip
    }

    /// Returns the link used to reach `dest`, if any.
    pub fn route(&self, dest: Ipv4Addr) -> Option<Link> {
        self.inner.routes.borrow().get(&dest).cloned()
    }

    /// Register `link` as the route to its destination, replacing any previous route.
    pub(crate) fn add_route(&self, link: Link) {
        let previous = self.inner.routes.borrow_mut().insert(link.dest(), link);
        if let Some(previous) = previous {
            debug!(host = %self.inner.ip, dest = %previous.dest(), "replaced route");
        }
    }

    /// Send `packet` over the link registered for its destination.
    ///
    /// Returns [Error::NoRoute] if this host has no link to the destination.
    pub fn send(&self, packet: Packet) -> Result<(), Error> {
        let dest = packet.dest();
        let Some(link) = self.route(dest) else {
            warn!(host = %self.inner.ip, %dest, "no route");
            return Err(Error::NoRoute(dest));
        };
        self.inner.context.record(
            "send-packet",
            format!("host {} packet {} to {}", self.inner.ip, packet.id(), dest),
        );
        self.inner
            .metrics
            .packets_sent
            .get_or_create(&link.route())
            .inc();
        link.enqueue(packet);
        Ok(())
    }

    /// Accept a packet that finished propagating over a link.
    pub(crate) fn deliver(&self, packet: Packet) {
        if packet.dest() != self.inner.ip {
            warn!(host = %self.inner.ip, dest = %packet.dest(), "received packet for another host");
        }
        self.inner.context.record(
            "recv-packet",
            format!(
                "host {} packet {} from {}",
                self.inner.ip,
                packet.id(),
                packet.origin()
            ),
        );
        self.inner.inbox.borrow_mut().push(packet);
    }

    /// Returns every packet delivered to this host, in delivery order.
    pub fn received(&self) -> Vec<Packet> {
        self.inner.inbox.borrow().clone()
    }
}
