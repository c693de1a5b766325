//! Define an error type for the bawang-proto crate.

use bawang_cell::TunnelId;
use std::sync::Arc;
use thiserror::Error;

/// An error produced by the onion-routing core.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A cell or sub-cell could not be encoded or decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] bawang_cell::Error),
    /// A cryptographic operation failed.
    #[error("crypto failure: {0}")]
    Crypto(#[from] bawang_crypto::Error),
    /// A read or write on a link's transport failed.
    #[error("transport error: {0}")]
    Transport(#[source] Arc<std::io::Error>),
    /// A handshake step did not complete within `build_timeout`.
    #[error("handshake timed out")]
    Timeout,
    /// Valid framing but a cryptographic mismatch: a bad shared-key
    /// hash, a replayed counter, or a relay cell no layer could
    /// authenticate.  Fatal for the affected tunnel; never retried.
    #[error("misbehaving peer: {0}")]
    MisbehavingPeer(&'static str),
    /// An operation referenced a tunnel id this node does not know.
    #[error("no such tunnel: {0}")]
    InvalidTunnel(TunnelId),
    /// The configured tunnel length is below the minimum of 3.
    #[error("tunnel length {0} is too short; need at least 3 hops")]
    NotEnoughHops(usize),
    /// The configured tunnel length exceeds the layer budget of a cell.
    #[error("tunnel length {0} exceeds the cell layer budget")]
    TooManyHops(usize),
    /// Cover traffic was requested while a user tunnel exists.
    #[error("cover traffic not allowed while user tunnels exist")]
    SendCoverNotAllowed,
    /// Cover traffic was requested before any cover tunnel was built.
    #[error("no cover tunnel available")]
    NoCoverTunnel,
    /// The peer sampler could not produce a peer.
    #[error("peer sampling failed: {0}")]
    Sampling(String),
    /// The tunnel went away while an operation was in flight.
    #[error("tunnel closed")]
    TunnelClosed,
    /// The link went away while an operation was in flight.
    #[error("link closed")]
    LinkClosed,
    /// The router is shutting down.
    #[error("router shutting down")]
    ShuttingDown,
}

impl Error {
    /// Wrap an I/O error from a link transport.
    pub(crate) fn transport(e: std::io::Error) -> Self {
        Error::Transport(Arc::new(e))
    }
}
