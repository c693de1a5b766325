//! The onion-routing core of a bawang relay.
//!
//! A node does two jobs at once.  For its local client it *initiates*
//! tunnels: multi-hop circuits built with a layered Diffie–Hellman
//! handshake, one shared secret per hop.  For everyone else it
//! *forwards*: each `CREATE` cell arriving on a link with an unknown
//! tunnel id makes a new [tunnel segment](segment), which either
//! terminates the circuit here or passes cells along, one encryption
//! layer thinner in the outbound direction and one layer thicker on the
//! way back.
//!
//! The [`Router`] owns everything: links, tunnels, segments, and the
//! local client's subscriptions.  Cross-tunnel state transitions all go
//! through it, and its round scheduler periodically rebuilds live
//! tunnels with fresh hops and keeps a cover tunnel up while the node
//! is otherwise idle.
//!
//! Transport and peer sampling are injected through the
//! [`LinkConnector`] and [`PeerSampler`] seams, so the whole core runs
//! against in-memory streams in tests.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unwrap_used)]

pub mod event;
pub mod link;
pub mod peer;
pub mod router;
pub mod segment;
pub mod tunnel;

mod err;
mod rounds;

pub use err::Error;
pub use event::{ApiConnId, Event, TunnelOp};
pub use peer::{BoxedPeerStream, LinkConnector, Peer, PeerSampler, PeerStream};
pub use router::Router;

use std::time::Duration;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Re-export: tunnel ids are allocated and compared all over the core.
pub use bawang_cell::TunnelId;

/// Configuration of the onion-routing core.
///
/// Validated by [`Router::new`]; the durations come straight from the
/// node's config file.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Total hop count of every tunnel this node builds, destination
    /// included.  At least 3, at most
    /// [`MAX_LAYERS`](bawang_crypto::MAX_LAYERS).
    pub tunnel_length: usize,
    /// Bound on each handshake step while building or extending.
    pub build_timeout: Duration,
    /// Period of the round scheduler.
    pub round_duration: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            tunnel_length: 3,
            build_timeout: Duration::from_secs(15),
            round_duration: Duration::from_secs(60),
        }
    }
}
