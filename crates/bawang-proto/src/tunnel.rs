//! Outgoing tunnels: circuits this node initiates.
//!
//! A tunnel is an ordered list of hops, each with its own shared
//! secret.  Building happens hop by hop: a `CREATE` handshake with the
//! first hop, then one `EXTEND` per further hop, each step bounded by
//! the build timeout.  Once live, a handler task owns the tunnel: it is
//! the only thing that touches the hop list and counters, consuming
//! inbound cells from the link and requests from the router.

use crate::link::{Link, LinkCell};
use crate::peer::Peer;
use crate::router::Router;
use crate::{Error, Event, Result, TunnelOp};

use bawang_cell::cell::{CellMsg, Created};
use bawang_cell::relay::{
    self, pack_relay, unpack_relay, AnyRelayMsg, CounterCheck, RelayCounter, RelayMsg,
};
use bawang_cell::{BoxedCellBody, CellCmd, TunnelId, RELAY_HEADER_LEN};
use bawang_crypto::layered::encrypt_layers;
use bawang_crypto::{start_handshake, SessionKey, RELAY_PLAINTEXT_LEN};

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// One hop of an outgoing tunnel.
pub(crate) struct Hop {
    /// The peer at this position.
    peer: Peer,
    /// The shared secret negotiated with it.
    key: SessionKey,
    /// Replay protection for sub-cells this hop originates.
    recv_ctr: CounterCheck,
}

impl Hop {
    /// Wrap a freshly negotiated hop.
    fn new(peer: Peer, key: SessionKey) -> Self {
        Hop {
            peer,
            key,
            recv_ctr: CounterCheck::new(),
        }
    }
}

/// A request from the router to a tunnel's handler task.
#[derive(Debug)]
pub(crate) enum TunnelRequest {
    /// Send payload to the tunnel's destination.
    Data(Vec<u8>),
    /// Send this many cover-ping sub-cells.
    Cover(usize),
    /// Tear the tunnel down.  `notify` says whether subscribers should
    /// hear a destroy event (round rebuilds move subscribers first and
    /// pass false).
    Destroy {
        /// Whether to emit [`Event::Destroyed`] to subscribers.
        notify: bool,
    },
}

/// Why a tunnel handler stopped.
enum Shutdown {
    /// The peer (or some hop behind it) sent `DESTROY`.
    PeerDestroy,
    /// The link to the first hop went away.
    LinkLost,
    /// The router asked for teardown.
    Requested {
        /// Whether subscribers get a destroy event.
        notify: bool,
    },
    /// The tunnel misbehaved or an operation failed; fatal.
    Failed {
        /// The operation that failed.
        op: TunnelOp,
    },
    /// The router is shutting down.
    Quit,
}

/// An outgoing tunnel, live or under construction.
pub(crate) struct Tunnel {
    /// The tunnel id, used on the link to the first hop and as the map
    /// key in the router.
    id: TunnelId,
    /// The hops, first hop first.  Fixed length once built.
    hops: Vec<Hop>,
    /// The link to the first hop.
    link: Link,
    /// Counter for sub-cells we originate; shared across all hops.
    send_ctr: RelayCounter,
    /// Inbound cells from the link's reader.
    cells: mpsc::Receiver<LinkCell>,
    /// Cancelled when the router wants this handler gone.
    quit: CancellationToken,
}

impl Tunnel {
    /// Build a tunnel along `path` (destination last) with fresh keys,
    /// one timeout-bounded handshake step per hop.
    ///
    /// The caller has already allocated `id`, registered it on `link`,
    /// and holds the resulting cell queue.
    pub(crate) async fn build(
        id: TunnelId,
        link: Link,
        mut cells: mpsc::Receiver<LinkCell>,
        path: &[Peer],
        build_timeout: Duration,
        quit: CancellationToken,
    ) -> Result<Tunnel> {
        let first = path.first().ok_or(Error::NotEnoughHops(0))?;
        trace!("tunnel {}: creating toward {}", id, first.addr);

        let (state, wrapped) = {
            let mut rng = rand::thread_rng();
            start_handshake(&first.identity, &mut rng)?
        };
        link.send_msg(
            id,
            &bawang_cell::cell::Create { handshake: wrapped },
        )
        .await?;
        let reply = await_cell(&mut cells, build_timeout, &quit, CellCmd::CREATED).await?;
        let created = Created::decode(CellCmd::CREATED, &reply.body[..])?;
        let key = state
            .complete(&created.dh_pub, &created.key_hash)
            .map_err(|_| Error::MisbehavingPeer("bad shared-key hash in CREATED"))?;

        let mut tunnel = Tunnel {
            id,
            hops: vec![Hop::new(first.clone(), key)],
            link,
            send_ctr: RelayCounter::new(),
            cells,
            quit,
        };
        for peer in &path[1..] {
            tunnel.extend(peer, build_timeout).await?;
        }
        debug!("tunnel {}: built with {} hops", id, tunnel.hops.len());
        Ok(tunnel)
    }

    /// Extend the tunnel by one hop: wrap a fresh handshake key for
    /// `peer`, have the current last hop open the new segment, and
    /// verify the relayed answer.
    async fn extend(&mut self, peer: &Peer, build_timeout: Duration) -> Result<()> {
        let layers = self.hops.len();
        trace!("tunnel {}: extending to {}", self.id, peer.addr);
        let (state, enc) = {
            let mut rng = rand::thread_rng();
            let (state, wrapped) = start_handshake(&peer.identity, &mut rng)?;
            let msg = relay::Extend {
                addr: peer.addr.ip(),
                port: peer.addr.port(),
                handshake: wrapped,
            };
            let counter = self.send_ctr.next()?;
            let packed = pack_relay(counter, &msg, RELAY_PLAINTEXT_LEN, &mut rng)?;
            let enc = encrypt_layers(self.hops.iter().map(|h| &h.key), &packed, &mut rng);
            (state, enc)
        };
        self.link.send_relay(self.id, &enc).await?;

        let reply = await_cell(&mut self.cells, build_timeout, &self.quit, CellCmd::RELAY).await?;
        let mut body = reply.body.to_vec();
        for i in 0..layers {
            body = self.hops[i].key.decrypt_layer(&body)?;
            let Some((header, msg)) = unpack_relay(&body)? else {
                continue;
            };
            if i != layers - 1 {
                return Err(Error::MisbehavingPeer("EXTENDED answered by wrong hop"));
            }
            self.hops[i]
                .recv_ctr
                .accept(header.counter)
                .map_err(|_| Error::MisbehavingPeer("replayed relay counter"))?;
            let AnyRelayMsg::Extended(ext) = msg else {
                return Err(Error::MisbehavingPeer("expected EXTENDED sub-cell"));
            };
            let key = state
                .complete(&ext.dh_pub, &ext.key_hash)
                .map_err(|_| Error::MisbehavingPeer("bad shared-key hash in EXTENDED"))?;
            self.hops.push(Hop::new(peer.clone(), key));
            return Ok(());
        }
        Err(Error::MisbehavingPeer("no layer of EXTENDED reply verified"))
    }

    /// Run the tunnel's handler task until teardown.
    pub(crate) async fn run(mut self, router: Router, mut requests: mpsc::UnboundedReceiver<TunnelRequest>) {
        let id = self.id;
        let quit = self.quit.clone();
        let cause = loop {
            tokio::select! {
                biased;
                _ = quit.cancelled() => break Shutdown::Quit,
                req = requests.recv() => match req {
                    None => break Shutdown::Quit,
                    Some(TunnelRequest::Data(payload)) => {
                        if let Err(e) = self.send_data(&payload).await {
                            warn!("tunnel {}: send failed: {}", id, e);
                            break Shutdown::Failed { op: TunnelOp::Data };
                        }
                    }
                    Some(TunnelRequest::Cover(cells)) => {
                        if let Err(e) = self.send_cover(cells).await {
                            warn!("tunnel {}: cover traffic failed: {}", id, e);
                            break Shutdown::Failed { op: TunnelOp::Cover };
                        }
                    }
                    Some(TunnelRequest::Destroy { notify }) => {
                        break Shutdown::Requested { notify };
                    }
                },
                cell = self.cells.recv() => match cell {
                    None => break Shutdown::LinkLost,
                    Some(cell) => match cell.cmd {
                        CellCmd::DESTROY => break Shutdown::PeerDestroy,
                        CellCmd::RELAY => {
                            if let Err(e) = self.handle_relay(&router, cell.body) {
                                warn!("tunnel {}: bad relay cell: {}", id, e);
                                break Shutdown::Failed { op: TunnelOp::Data };
                            }
                        }
                        other => trace!("tunnel {}: ignoring stray {} cell", id, other),
                    },
                },
            }
        };

        let (send_destroy, event) = match cause {
            Shutdown::PeerDestroy => (false, Some(Event::Destroyed { tunnel_id: id })),
            Shutdown::LinkLost => (
                false,
                Some(Event::Error {
                    op: TunnelOp::Data,
                    tunnel_id: id,
                }),
            ),
            Shutdown::Requested { notify } => {
                (true, notify.then_some(Event::Destroyed { tunnel_id: id }))
            }
            Shutdown::Failed { op } => (true, Some(Event::Error { op, tunnel_id: id })),
            Shutdown::Quit => (true, None),
        };
        if send_destroy {
            self.link.send_destroy(id).await;
        }
        self.link.unregister_tunnel(id);
        router.outgoing_closed(id, &self.link, event);
        debug!("tunnel {}: handler finished", id);
    }

    /// Send payload to the destination, split across as many `DATA`
    /// sub-cells as needed.
    async fn send_data(&mut self, payload: &[u8]) -> Result<()> {
        let max = RELAY_PLAINTEXT_LEN - RELAY_HEADER_LEN;
        for chunk in payload.chunks(max.max(1)) {
            let msg = relay::Data {
                body: chunk.to_vec(),
            };
            self.send_relay_msg(&msg).await?;
        }
        Ok(())
    }

    /// Send `cells` cover pings to the destination.
    async fn send_cover(&mut self, cells: usize) -> Result<()> {
        for _ in 0..cells {
            self.send_relay_msg(&relay::Cover { ping: true }).await?;
        }
        Ok(())
    }

    /// Pack one sub-cell for the destination, apply every layer, send.
    async fn send_relay_msg<M: RelayMsg>(&mut self, msg: &M) -> Result<()> {
        let enc = {
            let mut rng = rand::thread_rng();
            let counter = self.send_ctr.next()?;
            let packed = pack_relay(counter, msg, RELAY_PLAINTEXT_LEN, &mut rng)?;
            encrypt_layers(self.hops.iter().map(|h| &h.key), &packed, &mut rng)
        };
        self.link.send_relay(self.id, &enc).await
    }

    /// Process one inbound `RELAY` cell: strip layers until a digest
    /// verifies, then dispatch.  A cell no layer can authenticate is
    /// fatal.
    fn handle_relay(&mut self, router: &Router, body: BoxedCellBody) -> Result<()> {
        let id = self.id;
        let mut buf = body.to_vec();
        for hop in self.hops.iter_mut() {
            buf = hop.key.decrypt_layer(&buf)?;
            let Some((header, msg)) = unpack_relay(&buf)? else {
                continue;
            };
            hop.recv_ctr
                .accept(header.counter)
                .map_err(|_| Error::MisbehavingPeer("replayed relay counter"))?;
            match msg {
                AnyRelayMsg::Data(data) => {
                    trace!("tunnel {}: {} payload bytes from {}", id, data.body.len(), hop.peer.addr);
                    router.deliver_data(id, data.body);
                }
                AnyRelayMsg::Cover(_) => {
                    // Pongs answering our cover pings; nothing to do.
                }
                AnyRelayMsg::Extend(_) | AnyRelayMsg::Extended(_) => {
                    return Err(Error::MisbehavingPeer("handshake sub-cell on live tunnel"));
                }
                _ => {
                    return Err(Error::MisbehavingPeer("unrecognized relay type"));
                }
            }
            return Ok(());
        }
        Err(Error::MisbehavingPeer("relay cell failed digest at every layer"))
    }
}

/// Wait for the next cell of type `want`, bounded by `timeout`.
///
/// `DESTROY` aborts the wait; other cell types are skipped.
pub(crate) async fn await_cell(
    cells: &mut mpsc::Receiver<LinkCell>,
    timeout: Duration,
    quit: &CancellationToken,
    want: CellCmd,
) -> Result<LinkCell> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = quit.cancelled() => return Err(Error::ShuttingDown),
            _ = &mut deadline => return Err(Error::Timeout),
            cell = cells.recv() => match cell {
                None => return Err(Error::LinkClosed),
                Some(cell) if cell.cmd == want => return Ok(cell),
                Some(cell) if cell.cmd == CellCmd::DESTROY => return Err(Error::TunnelClosed),
                Some(cell) => trace!("skipping unexpected {} cell during handshake", cell.cmd),
            },
        }
    }
}
