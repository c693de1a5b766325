//! Peer sampling backed by the RPS service.

use async_trait::async_trait;
use bawang_api::RpsClient;
use bawang_crypto::IdentityPublic;
use bawang_proto::{Error, Peer, PeerSampler};

/// A [`PeerSampler`] that asks the RPS module for each peer.
pub(crate) struct RpsSampler {
    /// The reconnecting RPS client.
    client: RpsClient,
}

impl RpsSampler {
    /// Wrap an RPS client.
    pub(crate) fn new(client: RpsClient) -> Self {
        RpsSampler { client }
    }
}

#[async_trait]
impl PeerSampler for RpsSampler {
    async fn sample(&self) -> bawang_proto::Result<Peer> {
        let info = self
            .client
            .query()
            .await
            .map_err(|e| Error::Sampling(e.to_string()))?;
        let identity = IdentityPublic::from_pkcs1_der(&info.hostkey_der)
            .map_err(|e| Error::Sampling(format!("sampled peer has a bad hostkey: {e}")))?;
        Ok(Peer {
            addr: info.addr,
            identity,
        })
    }
}
