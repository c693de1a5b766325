//! Links: one transport connection to a neighboring relay.
//!
//! A link multiplexes many tunnels over one stream.  A background read
//! task consumes exactly one cell at a time and routes it by tunnel id
//! to the handler that registered the id; a `CREATE` for an unknown id
//! starts a new [segment](crate::segment).  Writes from any number of
//! tunnels serialize through one async lock, so every cell is atomic
//! on the wire.

use crate::peer::BoxedPeerStream;
use crate::router::RouterInner;
use crate::{Error, Result};

use bawang_cell::cell::{pack_cell, pack_relay_cell, CellHeader, CellMsg, Destroy};
use bawang_cell::{BoxedCellBody, CellCmd, TunnelId, CELL_HEADER_LEN, CELL_LEN};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Depth of each tunnel's inbound cell queue.  A full queue blocks the
/// link's reader, which pushes back on the peer through the transport.
pub(crate) const TUNNEL_QUEUE_DEPTH: usize = 5;

/// One cell as delivered from a link's reader to a tunnel handler.
#[derive(Clone)]
pub(crate) struct LinkCell {
    /// The cell command.
    pub(crate) cmd: CellCmd,
    /// The cell body.
    pub(crate) body: BoxedCellBody,
}

/// A handle to one link.  Cheap to clone; the transport is shared.
#[derive(Clone)]
pub struct Link {
    /// Shared state.
    inner: Arc<LinkInner>,
}

/// The shared state of a link.
struct LinkInner {
    /// Address of the peer on the other side.
    addr: SocketAddr,
    /// The write half of the transport, behind the per-link write lock.
    writer: tokio::sync::Mutex<WriteHalf<BoxedPeerStream>>,
    /// Inbound queues of the tunnels multiplexed on this link.
    ///
    /// Blocking mutex near async code: never held across an await.
    tunnels: Mutex<HashMap<TunnelId, mpsc::Sender<LinkCell>>>,
    /// Cancelled when the link shuts down.
    quit: CancellationToken,
}

impl Link {
    /// Take ownership of a transport stream to `addr` and start the
    /// read loop.
    ///
    /// `router` is the registry to report back to: segments spawned by
    /// inbound `CREATE` cells and the link's own removal go through it.
    pub(crate) fn launch(
        stream: BoxedPeerStream,
        addr: SocketAddr,
        router: Weak<RouterInner>,
    ) -> Link {
        let (read_half, write_half) = tokio::io::split(stream);
        let link = Link {
            inner: Arc::new(LinkInner {
                addr,
                writer: tokio::sync::Mutex::new(write_half),
                tunnels: Mutex::new(HashMap::new()),
                quit: CancellationToken::new(),
            }),
        };
        tokio::spawn(read_loop(read_half, link.clone(), router));
        link
    }

    /// Return the peer address this link leads to.
    pub(crate) fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Return true if `other` is a handle to this very link.
    pub(crate) fn same_link(&self, other: &Link) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Return true once the link has shut down (or started to).
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.quit.is_cancelled()
    }

    /// Return a token cancelled when this link shuts down.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.inner.quit.clone()
    }

    /// Register a tunnel id on this link, returning the receiving end
    /// of its inbound cell queue.
    pub(crate) fn register_tunnel(&self, id: TunnelId) -> Result<mpsc::Receiver<LinkCell>> {
        if self.is_closed() {
            return Err(Error::LinkClosed);
        }
        let mut tunnels = self.inner.tunnels.lock().expect("poisoned lock");
        if tunnels.contains_key(&id) {
            return Err(Error::InvalidTunnel(id));
        }
        let (tx, rx) = mpsc::channel(TUNNEL_QUEUE_DEPTH);
        tunnels.insert(id, tx);
        Ok(rx)
    }

    /// Drop a tunnel id from this link.  Returns how many tunnels
    /// remain; a link with none is eligible for teardown.
    pub(crate) fn unregister_tunnel(&self, id: TunnelId) -> usize {
        let mut tunnels = self.inner.tunnels.lock().expect("poisoned lock");
        tunnels.remove(&id);
        tunnels.len()
    }

    /// Return the number of tunnels registered on this link.
    pub(crate) fn n_tunnels(&self) -> usize {
        self.inner.tunnels.lock().expect("poisoned lock").len()
    }

    /// Return the queue for `id`, if registered.
    fn tunnel_sender(&self, id: TunnelId) -> Option<mpsc::Sender<LinkCell>> {
        self.inner
            .tunnels
            .lock()
            .expect("poisoned lock")
            .get(&id)
            .cloned()
    }

    /// Write one whole cell, atomically with respect to other senders.
    pub(crate) async fn send_cell(&self, cell: &[u8; CELL_LEN]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LinkClosed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(cell).await.map_err(Error::transport)?;
        writer.flush().await.map_err(Error::transport)?;
        Ok(())
    }

    /// Pack and send one typed cell.
    pub(crate) async fn send_msg<M: CellMsg>(&self, id: TunnelId, msg: &M) -> Result<()> {
        let cell = {
            let mut rng = rand::thread_rng();
            pack_cell(id, msg, &mut rng)?
        };
        self.send_cell(&cell).await
    }

    /// Send one `RELAY` cell around a pre-encrypted body.
    pub(crate) async fn send_relay(&self, id: TunnelId, enc_body: &[u8]) -> Result<()> {
        let cell = {
            let mut rng = rand::thread_rng();
            pack_relay_cell(id, enc_body, &mut rng)?
        };
        self.send_cell(&cell).await
    }

    /// Send a `DESTROY` for `id`, ignoring transport errors: the link
    /// may already be gone, and a destroy is best-effort.
    pub(crate) async fn send_destroy(&self, id: TunnelId) {
        if let Err(e) = self.send_msg(id, &Destroy).await {
            debug!("link {}: could not send DESTROY for {}: {}", self.addr(), id, e);
        }
    }

    /// Shut the link down: stop the reader, close every tunnel queue
    /// (which each handler observes as end-of-stream), and close the
    /// transport.
    pub(crate) fn terminate(&self) {
        self.inner.quit.cancel();
        self.inner.tunnels.lock().expect("poisoned lock").clear();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("addr", &self.inner.addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The link's background read task: one cell per iteration, routed by
/// tunnel id.
async fn read_loop(
    mut reader: ReadHalf<BoxedPeerStream>,
    link: Link,
    router: Weak<RouterInner>,
) {
    let addr = link.addr();
    loop {
        let mut cell = [0_u8; CELL_LEN];
        let read = tokio::select! {
            biased;
            _ = link.inner.quit.cancelled() => break,
            r = reader.read_exact(&mut cell) => r,
        };
        match read {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Clean close from the peer; not an error.
                debug!("link {}: peer closed the connection", addr);
                break;
            }
            Err(e) => {
                // "use of closed connection" during our own shutdown is
                // expected; anything else is a transport failure.
                if !link.is_closed() {
                    warn!("link {}: read failed: {}", addr, e);
                }
                break;
            }
        }

        let header = match CellHeader::decode(&cell) {
            Ok(h) => h,
            Err(e) => {
                warn!("link {}: unparseable cell header: {}", addr, e);
                continue;
            }
        };
        let mut body: BoxedCellBody = Box::new([0_u8; bawang_cell::CELL_BODY_LEN]);
        body.copy_from_slice(&cell[CELL_HEADER_LEN..]);
        let cell = LinkCell {
            cmd: header.cmd,
            body,
        };

        if let Some(tx) = link.tunnel_sender(header.tunnel_id) {
            // Bounded send: a slow tunnel handler blocks this reader,
            // and TCP pushes back on the peer.
            if tx.send(cell).await.is_err() {
                trace!(
                    "link {}: tunnel {} gone; dropping {} cell",
                    addr,
                    header.tunnel_id,
                    header.cmd
                );
            }
        } else if header.cmd == CellCmd::CREATE {
            match router.upgrade() {
                Some(inner) => crate::router::Router::from_inner(inner).spawn_segment(
                    link.clone(),
                    header.tunnel_id,
                    cell.body,
                ),
                None => break,
            }
        } else {
            trace!(
                "link {}: dropping {} cell for unknown tunnel {}",
                addr,
                header.cmd,
                header.tunnel_id
            );
        }
    }

    link.terminate();
    if let Some(router) = router.upgrade() {
        router.forget_link(&link);
    }
    debug!("link {}: reader finished", addr);
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn fake_link() -> Link {
        let (client, _server) = tokio::io::duplex(4 * CELL_LEN);
        Link::launch(Box::new(client), "127.0.0.1:4433".parse().unwrap(), Weak::new())
    }

    #[tokio::test]
    async fn register_is_exclusive() {
        let link = fake_link();
        let _rx = link.register_tunnel(7).unwrap();
        assert!(matches!(
            link.register_tunnel(7),
            Err(Error::InvalidTunnel(7))
        ));
        assert_eq!(link.n_tunnels(), 1);
        assert_eq!(link.unregister_tunnel(7), 0);
    }

    #[tokio::test]
    async fn terminated_link_rejects_everything() {
        let link = fake_link();
        link.terminate();
        assert!(link.is_closed());
        assert!(matches!(link.register_tunnel(1), Err(Error::LinkClosed)));
        assert!(matches!(
            link.send_cell(&[0_u8; CELL_LEN]).await,
            Err(Error::LinkClosed)
        ));
    }

    #[tokio::test]
    async fn reader_routes_cells_to_registered_tunnels() {
        let (client, server) = tokio::io::duplex(4 * CELL_LEN);
        let link = Link::launch(
            Box::new(client),
            "127.0.0.1:4433".parse().unwrap(),
            Weak::new(),
        );
        let mut rx = link.register_tunnel(42).unwrap();

        // Write one DESTROY cell for tunnel 42 from the "peer" side.
        let cell = {
            let mut rng = rand::thread_rng();
            pack_cell(42, &Destroy, &mut rng).unwrap()
        };
        let (_peer_read, mut peer_write) = tokio::io::split(server);
        peer_write.write_all(&cell).await.unwrap();
        peer_write.flush().await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.cmd, CellCmd::DESTROY);
    }

    #[tokio::test]
    async fn peer_eof_closes_queues() {
        let (client, server) = tokio::io::duplex(4 * CELL_LEN);
        let link = Link::launch(
            Box::new(client),
            "127.0.0.1:4433".parse().unwrap(),
            Weak::new(),
        );
        let mut rx = link.register_tunnel(1).unwrap();
        drop(server);
        assert!(rx.recv().await.is_none());
        assert!(link.is_closed());
    }
}
