//! Events delivered to local API connections.
//!
//! The core never speaks the client API protocol itself; it hands
//! [`Event`]s to whichever connections subscribed to a tunnel, and the
//! API frontend turns them into wire messages.

use bawang_cell::TunnelId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one local API connection, unique for the lifetime of
/// the process.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ApiConnId(u64);

impl ApiConnId {
    /// Return a fresh connection id.
    pub(crate) fn next() -> Self {
        /// Source of connection ids.
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ApiConnId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ApiConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "api-conn {}", self.0)
    }
}

/// The operation a failure report refers to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum TunnelOp {
    /// Building a tunnel.
    Build,
    /// Sending or relaying payload.
    Data,
    /// Producing cover traffic.
    Cover,
    /// Destroying a tunnel.
    Destroy,
}

/// Something a subscribed API connection needs to hear about.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// A remote initiator's tunnel now terminates at this node.
    Incoming {
        /// The tunnel's local id.
        tunnel_id: TunnelId,
    },
    /// Payload arrived on a tunnel.
    Data {
        /// The tunnel the payload arrived on.
        tunnel_id: TunnelId,
        /// The payload.
        data: Vec<u8>,
    },
    /// A tunnel was torn down (by either side, or by round GC).
    Destroyed {
        /// The tunnel that is gone.
        tunnel_id: TunnelId,
    },
    /// An operation on a tunnel failed; the tunnel is gone.
    Error {
        /// What the node was doing when it failed.
        op: TunnelOp,
        /// The affected tunnel.
        tunnel_id: TunnelId,
    },
}
