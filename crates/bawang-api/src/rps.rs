//! A client for the random-peer-sampling service.
//!
//! Tunnel construction needs a stream of random peers; the RPS module
//! provides them over a local framed socket, one `RPS_PEER` per
//! `RPS_QUERY`.  The client here keeps a single lazily-opened
//! connection and drops it on any error, reconnecting on the next
//! query.

use crate::{ApiCodec, ApiMsg, Error, Result};

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// A peer as described by the RPS service: where its onion module
/// listens, and its identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpsPeerInfo {
    /// The peer's address, with the port taken from the `ONION`
    /// portmap entry.
    pub addr: SocketAddr,
    /// The peer's identity public key, PKCS#1 DER.
    pub hostkey_der: Vec<u8>,
}

impl RpsPeerInfo {
    /// Append this peer's wire encoding.
    pub(crate) fn encode_onto(&self, out: &mut Vec<u8>) {
        crate::msg::encode_peer(&self.addr, &self.hostkey_der, out);
    }

    /// Decode a peer from an `RPS_PEER` body.
    pub(crate) fn decode(body: &[u8]) -> Result<Self> {
        let (addr, hostkey_der) = crate::msg::decode_peer(body)?;
        Ok(RpsPeerInfo { addr, hostkey_der })
    }
}

/// The connection state of an [`RpsClient`].
type RpsConn = Framed<TcpStream, ApiCodec>;

/// A reconnecting RPS client issuing one query at a time.
pub struct RpsClient {
    /// Address of the RPS service.
    addr: SocketAddr,
    /// Bound on connect plus one query round-trip.
    timeout: Duration,
    /// The current connection, if any.  Also serializes queries.
    conn: Mutex<Option<RpsConn>>,
}

impl RpsClient {
    /// Create a client for the RPS service at `addr`.
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        RpsClient {
            addr,
            timeout,
            conn: Mutex::new(None),
        }
    }

    /// Ask for one random peer.
    pub async fn query(&self) -> Result<RpsPeerInfo> {
        let mut guard = self.conn.lock().await;
        let result = tokio::time::timeout(self.timeout, Self::query_inner(&mut *guard, self.addr))
            .await
            .unwrap_or(Err(Error::Timeout));
        if let Err(e) = &result {
            // Whatever went wrong, start from a fresh connection next
            // time.
            warn!("rps query failed: {}", e);
            *guard = None;
        }
        result
    }

    /// One connect-if-needed-then-query round.
    async fn query_inner(
        conn: &mut Option<RpsConn>,
        addr: SocketAddr,
    ) -> Result<RpsPeerInfo> {
        if conn.is_none() {
            debug!("connecting to rps at {}", addr);
            let stream = TcpStream::connect(addr).await?;
            *conn = Some(Framed::new(stream, ApiCodec));
        }
        let framed = conn.as_mut().ok_or(Error::Closed)?;
        framed.send(ApiMsg::RpsQuery).await?;
        match framed.next().await {
            Some(Ok(ApiMsg::RpsPeer(peer))) => Ok(peer),
            Some(Ok(other)) => Err(Error::UnexpectedReply(other.msg_type())),
            Some(Err(e)) => Err(e),
            None => Err(Error::Closed),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn query_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = RpsPeerInfo {
            addr: "10.1.2.3:4433".parse().unwrap(),
            hostkey_der: vec![0xaa; 100],
        };

        let served = peer.clone();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(sock, ApiCodec);
            while let Some(Ok(msg)) = framed.next().await {
                assert_eq!(msg, ApiMsg::RpsQuery);
                framed.send(ApiMsg::RpsPeer(served.clone())).await.unwrap();
            }
        });

        let client = RpsClient::new(addr, Duration::from_secs(2));
        for _ in 0..3 {
            assert_eq!(client.query().await.unwrap(), peer);
        }
    }

    #[tokio::test]
    async fn closed_service_reports_error() {
        // Bind and drop, so the port is (very likely) refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RpsClient::new(addr, Duration::from_millis(500));
        assert!(client.query().await.is_err());
    }
}
