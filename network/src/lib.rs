//! Model hosts exchanging packets over bandwidth-limited links.
//!
//! Every [Link] is unidirectional and serializes transmissions with a mutex: a packet first
//! waits for the link to be free, then occupies it for `size / bandwidth` seconds, then
//! propagates for `prop_delay` seconds (during which the next packet may already transmit)
//! before it is delivered to the destination [Host].
//!
//! Every step is written to the simulation journal, so a run can be replayed and inspected.
//!
//! # Example
//!
//! ```rust
//! use std::net::Ipv4Addr;
//! use tempo_network::Network;
//! use tempo_runtime::deterministic::Executor;
//!
//! let (runner, context, _) = Executor::default();
//! let network = Network::new(&context);
//! let client = network.host(Ipv4Addr::new(123, 0, 0, 0));
//! let server = network.host(Ipv4Addr::new(101, 0, 0, 0));
//! network.link(&client, &server, 0.1, 1e6).unwrap();
//!
//! let packet = network.packet(client.ip(), server.ip(), vec![0u8; 1500]);
//! client.send(packet).unwrap();
//! let report = runner.run().unwrap();
//! assert_eq!(report.now.as_secs_f64(), 0.1015);
//! assert_eq!(server.received().len(), 1);
//! ```

use std::net::Ipv4Addr;
use thiserror::Error;

mod host;
pub use host::Host;
mod link;
pub use link::Link;
mod metrics;
mod network;
pub use network::Network;
mod packet;
pub use packet::Packet;

/// Errors that can occur when interacting with the network.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),
    #[error("invalid bandwidth (must be positive): {0}")]
    InvalidBandwidth(f64),
    #[error("invalid propagation delay (must not be negative): {0}")]
    InvalidDelay(f64),
    #[error("runtime error: {0}")]
    Runtime(#[from] tempo_runtime::Error),
}
