//! Peers, and the seams through which the core reaches the outside.
//!
//! The core needs two things it does not implement itself: a way to
//! open an authenticated byte stream to a peer (TLS in the real node),
//! and a source of random peers (the RPS service).  Both are injected
//! as trait objects so that tests can run whole networks over
//! in-memory streams.

use crate::Result;
use bawang_crypto::IdentityPublic;

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A peer we could build a tunnel through: its onion-port address and
/// long-term identity.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Where the peer's onion module listens.
    pub addr: SocketAddr,
    /// The peer's identity public key.
    pub identity: IdentityPublic,
}

/// Anything a [`Link`](crate::link::Link) can run over: a reliable,
/// ordered, encrypted byte stream to one peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// An owned [`PeerStream`] of unknown concrete type.
pub type BoxedPeerStream = Box<dyn PeerStream>;

/// Opens transport streams to peers.
///
/// The real node connects with TLS (accepting self-signed
/// certificates; peers authenticate in the tunnel handshake, not at
/// the transport layer).  Tests wire nodes together with duplex pipes.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Open a stream to the peer listening at `addr`.
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<BoxedPeerStream>;
}

/// Produces random peers for tunnel construction.
#[async_trait]
pub trait PeerSampler: Send + Sync {
    /// Return one randomly sampled peer.
    async fn sample(&self) -> Result<Peer>;
}
