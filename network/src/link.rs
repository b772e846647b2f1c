use crate::{
    host,
    metrics::{Metrics, Route},
    Error, Host, Packet,
};
use std::{
    net::Ipv4Addr,
    rc::{Rc, Weak},
};
use tempo_runtime::{deterministic::Simulation, Clock, Handle, Mutex, Spawner};
use tracing::warn;

struct Inner {
    source: Ipv4Addr,
    dest: Ipv4Addr,
    host: Weak<host::Inner>,
    prop_delay: f64,
    bandwidth: f64,
    mutex: Mutex,
    context: Simulation,
    metrics: Metrics,
}

/// A unidirectional link between two hosts.
///
/// Packets are transmitted one at a time, in the order they were enqueued, at `bandwidth`
/// bytes per second. Once transmitted, a packet takes `prop_delay` seconds to reach the
/// destination.
#[derive(Clone)]
pub struct Link {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("source", &self.inner.source)
            .field("dest", &self.inner.dest)
            .field("prop_delay", &self.inner.prop_delay)
            .field("bandwidth", &self.inner.bandwidth)
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Create a link without validating its parameters.
    pub(crate) fn new(
        context: Simulation,
        source: &Host,
        dest: &Host,
        prop_delay: f64,
        bandwidth: f64,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                source: source.ip(),
                dest: dest.ip(),
                host: dest.downgrade(),
                prop_delay,
                bandwidth,
                mutex: Mutex::new(&context),
                context,
                metrics,
            }),
        }
    }

    /// Returns the address of the sending host.
    pub fn source(&self) -> Ipv4Addr {
        self.inner.source
    }

    /// Returns the address of the receiving host.
    pub fn dest(&self) -> Ipv4Addr {
        self.inner.dest
    }

    /// Returns the propagation delay, in seconds.
    pub fn prop_delay(&self) -> f64 {
        self.inner.prop_delay
    }

    /// Returns the bandwidth, in bytes per second.
    pub fn bandwidth(&self) -> f64 {
        self.inner.bandwidth
    }

    /// Returns `true` while a packet is being transmitted.
    pub fn is_busy(&self) -> bool {
        self.inner.mutex.is_locked()
    }

    pub(crate) fn route(&self) -> Route {
        Route::new(self.inner.source, self.inner.dest)
    }

    /// Queue `packet` for transmission.
    ///
    /// The packet is carried by its own thread, which runs until the packet waits for the
    /// link or starts transmitting.
    pub fn enqueue(&self, packet: Packet) -> Handle<Result<(), Error>> {
        let link = self.clone();
        self.inner.context.new_thread(move |context| async move {
            let id = packet.id();
            let result = link.carry(&context, packet).await;
            if let Err(err) = &result {
                warn!(link = %link, packet = id, ?err, "failed to carry packet");
            }
            result
        })
    }

    async fn carry(&self, context: &Simulation, packet: Packet) -> Result<(), Error> {
        let id = packet.id();

        // Wait for the link to be free
        self.record(context, "queue-start", id);
        self.inner.mutex.lock(None).await?;
        self.record(context, "queue-end", id);

        // Put the packet on the wire
        self.record(context, "transmit-start", id);
        context
            .sleep(packet.size() as f64 / self.inner.bandwidth)
            .await?;
        self.record(context, "transmit-end", id);
        self.inner
            .metrics
            .bytes_transmitted
            .get_or_create(&self.route())
            .inc_by(packet.size() as u64);
        self.inner.mutex.unlock()?;

        // Let it reach the other end
        self.record(context, "propagate-start", id);
        context.sleep(self.inner.prop_delay).await?;
        self.record(context, "propagate-end", id);
        let Some(host) = self.inner.host.upgrade() else {
            warn!(link = %self, packet = id, "destination host dropped");
            return Ok(());
        };
        self.inner
            .metrics
            .packets_delivered
            .get_or_create(&self.route())
            .inc();
        Host::from_inner(host).deliver(packet);
        Ok(())
    }

    fn record(&self, context: &Simulation, kind: &'static str, packet: u64) {
        context.record(kind, format!("link {self} packet {packet}"));
    }
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.inner.source, self.inner.dest)
    }
}
