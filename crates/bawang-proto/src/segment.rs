//! Tunnel segments: one hop of a circuit somebody else initiated.
//!
//! A segment starts *terminating*: it answers the `CREATE` handshake
//! and owns one shared secret.  The first `EXTEND` it receives turns it
//! *forwarding*, with a second link toward the next hop; that
//! transition happens exactly once.  From then on it mostly moves
//! cells: outbound cells lose our encryption layer, inbound cells gain
//! it back.

use crate::link::{Link, LinkCell};
use crate::router::Router;
use crate::tunnel::await_cell;
use crate::{Error, Event, Result, TunnelOp};

use bawang_cell::cell::{CellMsg, Create, Created};
use bawang_cell::relay::{
    self, pack_relay, unpack_relay, AnyRelayMsg, CounterCheck, RelayCounter, RelayMsg,
};
use bawang_cell::{BoxedCellBody, CellCmd, TunnelId, CELL_BODY_LEN, RELAY_HEADER_LEN};
use bawang_crypto::{respond_handshake, IdentityKeypair, SessionKey, IV_LEN, RELAY_PLAINTEXT_LEN};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A request from the router to a segment's handler task.
#[derive(Debug)]
pub(crate) enum SegmentRequest {
    /// Send payload back toward the initiator.
    Data(Vec<u8>),
    /// Tear the segment down.
    Destroy {
        /// Whether to emit [`Event::Destroyed`] to subscribers.
        notify: bool,
    },
}

/// Why a segment handler stopped.
enum Shutdown {
    /// `DESTROY` (or link loss) from the previous hop.
    FromPrev,
    /// `DESTROY` (or link loss) from the next hop.
    FromNext,
    /// The segment saw a protocol or crypto violation.
    Protocol,
    /// The router asked for teardown.
    Requested {
        /// Whether subscribers get a destroy event.
        notify: bool,
    },
    /// The router is shutting down.
    Quit,
}

/// The forwarding half of a segment, absent while terminating.
struct NextHop {
    /// Our tunnel id on the next link.
    id: TunnelId,
    /// The link to the next hop.
    link: Link,
    /// Inbound cells from the next hop.
    cells: mpsc::Receiver<LinkCell>,
}

/// One hop of a remotely initiated circuit.
pub(crate) struct Segment {
    /// Our tunnel id on the previous (initiator-side) link.
    prev_id: TunnelId,
    /// The link toward the initiator.
    prev_link: Link,
    /// The shared secret negotiated in the `CREATE` handshake.
    key: SessionKey,
    /// Counter for sub-cells we originate toward the initiator.
    send_ctr: RelayCounter,
    /// Replay protection for sub-cells addressed to us.
    recv_ctr: CounterCheck,
    /// The next hop, once the first `EXTEND` arrives.
    next: Option<NextHop>,
    /// Whether this segment has been announced to API connections.
    api_visible: bool,
    /// Inbound cells from the previous hop.
    prev_cells: mpsc::Receiver<LinkCell>,
    /// Cancelled when the router wants this handler gone.
    quit: CancellationToken,
}

impl Segment {
    /// Answer the `CREATE` in `body` and run the segment until
    /// teardown.  Invoked as its own task by the router.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run(
        router: Router,
        identity: Arc<IdentityKeypair>,
        prev_link: Link,
        prev_id: TunnelId,
        body: BoxedCellBody,
        prev_cells: mpsc::Receiver<LinkCell>,
        requests: mpsc::UnboundedReceiver<SegmentRequest>,
        quit: CancellationToken,
    ) {
        // Handshake first: a CREATE we cannot answer just goes away.
        let key = {
            let reply = Create::decode(CellCmd::CREATE, &body[..])
                .map_err(Error::from)
                .and_then(|create| {
                    let mut rng = rand::thread_rng();
                    respond_handshake(&identity, &create.handshake, &mut rng).map_err(Error::from)
                });
            match reply {
                Ok(reply) => {
                    let created = Created {
                        dh_pub: reply.dh_pub,
                        key_hash: reply.key_hash,
                    };
                    if let Err(e) = prev_link.send_msg(prev_id, &created).await {
                        debug!("segment {}: could not answer CREATE: {}", prev_id, e);
                        prev_link.unregister_tunnel(prev_id);
                        router.incoming_closed(prev_id, &prev_link, None, None);
                        return;
                    }
                    reply.key
                }
                Err(e) => {
                    debug!("segment {}: discarding unusable CREATE: {}", prev_id, e);
                    prev_link.unregister_tunnel(prev_id);
                    router.incoming_closed(prev_id, &prev_link, None, None);
                    return;
                }
            }
        };
        debug!("segment {}: established on link {}", prev_id, prev_link.addr());

        let segment = Segment {
            prev_id,
            prev_link,
            key,
            send_ctr: RelayCounter::new(),
            recv_ctr: CounterCheck::new(),
            next: None,
            api_visible: false,
            prev_cells,
            quit,
        };
        segment.run_loop(router, requests).await;
    }

    /// The segment's main loop.
    async fn run_loop(mut self, router: Router, mut requests: mpsc::UnboundedReceiver<SegmentRequest>) {
        let id = self.prev_id;
        let quit = self.quit.clone();
        let build_timeout = router.build_timeout();
        let cause = loop {
            tokio::select! {
                biased;
                _ = quit.cancelled() => break Shutdown::Quit,
                req = requests.recv() => match req {
                    None => break Shutdown::Quit,
                    Some(SegmentRequest::Data(payload)) => {
                        if let Err(e) = self.send_data_back(&payload).await {
                            warn!("segment {}: reply failed: {}", id, e);
                            break Shutdown::Protocol;
                        }
                    }
                    Some(SegmentRequest::Destroy { notify }) => {
                        break Shutdown::Requested { notify };
                    }
                },
                cell = self.prev_cells.recv() => match cell {
                    None => break Shutdown::FromPrev,
                    Some(cell) => match cell.cmd {
                        CellCmd::DESTROY => break Shutdown::FromPrev,
                        CellCmd::RELAY => {
                            match self.handle_outbound(&router, cell.body, build_timeout).await {
                                Ok(()) => {}
                                Err(e) => {
                                    warn!("segment {}: {}", id, e);
                                    break Shutdown::Protocol;
                                }
                            }
                        }
                        other => trace!("segment {}: ignoring stray {} cell", id, other),
                    },
                },
                cell = recv_next(&mut self.next) => match cell {
                    None => break Shutdown::FromNext,
                    Some(cell) => match cell.cmd {
                        CellCmd::DESTROY => break Shutdown::FromNext,
                        CellCmd::RELAY => {
                            if let Err(e) = self.handle_inbound(cell.body).await {
                                warn!("segment {}: backward relay failed: {}", id, e);
                                break Shutdown::Protocol;
                            }
                        }
                        other => trace!("segment {}: ignoring stray {} cell from next hop", id, other),
                    },
                },
            }
        };
        self.teardown(router, cause).await;
    }

    /// Tear the segment down, propagating `DESTROY` away from whichever
    /// side caused it.
    async fn teardown(self, router: Router, cause: Shutdown) {
        let id = self.prev_id;
        let (to_prev, to_next, event) = match cause {
            Shutdown::FromPrev => (false, true, Some(Event::Destroyed { tunnel_id: id })),
            Shutdown::FromNext => (true, false, Some(Event::Destroyed { tunnel_id: id })),
            Shutdown::Protocol => (
                true,
                true,
                Some(Event::Error {
                    op: TunnelOp::Data,
                    tunnel_id: id,
                }),
            ),
            Shutdown::Requested { notify } => {
                (true, true, notify.then_some(Event::Destroyed { tunnel_id: id }))
            }
            Shutdown::Quit => (true, true, None),
        };
        if to_prev {
            self.prev_link.send_destroy(id).await;
        }
        self.prev_link.unregister_tunnel(id);
        let mut next_link = None;
        if let Some(next) = self.next {
            if to_next {
                next.link.send_destroy(next.id).await;
            }
            next.link.unregister_tunnel(next.id);
            next_link = Some(next.link);
        }
        let event = if self.api_visible { event } else { None };
        router.incoming_closed(id, &self.prev_link, next_link.as_ref(), event);
        debug!("segment {}: handler finished", id);
    }

    /// Process one cell moving away from the initiator: strip our
    /// layer; if the digest names us, dispatch, otherwise pass it on.
    async fn handle_outbound(
        &mut self,
        router: &Router,
        body: BoxedCellBody,
        build_timeout: Duration,
    ) -> Result<()> {
        let plain = self.key.decrypt_layer(&body[..])?;
        match unpack_relay(&plain)? {
            Some((header, msg)) => {
                self.recv_ctr
                    .accept(header.counter)
                    .map_err(|_| Error::MisbehavingPeer("replayed relay counter"))?;
                match msg {
                    AnyRelayMsg::Extend(ext) => {
                        if self.next.is_some() {
                            return Err(Error::MisbehavingPeer("EXTEND on a forwarding segment"));
                        }
                        self.handle_extend(router, ext, build_timeout).await;
                        Ok(())
                    }
                    AnyRelayMsg::Data(data) => {
                        router.deliver_segment_data(self.prev_id, data.body, &mut self.api_visible);
                        Ok(())
                    }
                    AnyRelayMsg::Cover(cover) => {
                        if cover.ping {
                            self.send_reply(&relay::Cover { ping: false }).await?;
                        }
                        Ok(())
                    }
                    AnyRelayMsg::Extended(_) => {
                        Err(Error::MisbehavingPeer("EXTENDED from the initiator side"))
                    }
                    _ => Err(Error::MisbehavingPeer("unrecognized relay type")),
                }
            }
            None => {
                // Not ours: one layer thinner, onward -- or nowhere to
                // go, which means an undecryptable cell at the end of
                // the line.
                match &self.next {
                    Some(next) => next.link.send_relay(next.id, &plain).await,
                    None => Err(Error::MisbehavingPeer(
                        "unreadable relay cell at terminating segment",
                    )),
                }
            }
        }
    }

    /// Process one cell moving toward the initiator: add our layer and
    /// pass it to the previous hop.
    async fn handle_inbound(&mut self, body: BoxedCellBody) -> Result<()> {
        let enc = {
            let mut rng = rand::thread_rng();
            self.key
                .encrypt_layer(&body[..CELL_BODY_LEN - IV_LEN], &mut rng)
        };
        self.prev_link.send_relay(self.prev_id, &enc).await
    }

    /// Extend the circuit: open a link to the requested peer, run the
    /// `CREATE` handshake there, and relay the answer back.
    ///
    /// Failure leaves the segment terminating; the initiator's build
    /// step times out and tears the tunnel down if it cares.
    async fn handle_extend(&mut self, router: &Router, ext: relay::Extend, build_timeout: Duration) {
        let target = SocketAddr::new(ext.addr, ext.port);
        trace!("segment {}: extending to {}", self.prev_id, target);
        let (next_id, link, mut cells) = match router.open_next_hop(target).await {
            Ok(v) => v,
            Err(e) => {
                warn!("segment {}: cannot reach {}: {}", self.prev_id, target, e);
                return;
            }
        };
        let create = Create {
            handshake: ext.handshake,
        };
        let created = async {
            link.send_msg(next_id, &create).await?;
            let reply = await_cell(&mut cells, build_timeout, &self.quit, CellCmd::CREATED).await?;
            Ok::<_, Error>(Created::decode(CellCmd::CREATED, &reply.body[..])?)
        }
        .await;
        match created {
            Ok(created) => {
                let reply = relay::Extended {
                    dh_pub: created.dh_pub,
                    key_hash: created.key_hash,
                };
                if let Err(e) = self.send_reply(&reply).await {
                    warn!("segment {}: could not relay EXTENDED: {}", self.prev_id, e);
                    link.unregister_tunnel(next_id);
                    router.release_link(&link);
                    return;
                }
                self.next = Some(NextHop {
                    id: next_id,
                    link,
                    cells,
                });
            }
            Err(e) => {
                warn!("segment {}: extension to {} failed: {}", self.prev_id, target, e);
                link.unregister_tunnel(next_id);
                router.release_link(&link);
            }
        }
    }

    /// Send payload back toward the initiator, split across as many
    /// `DATA` sub-cells as needed.
    async fn send_data_back(&mut self, payload: &[u8]) -> Result<()> {
        let max = RELAY_PLAINTEXT_LEN - RELAY_HEADER_LEN;
        for chunk in payload.chunks(max.max(1)) {
            let msg = relay::Data {
                body: chunk.to_vec(),
            };
            self.send_reply(&msg).await?;
        }
        Ok(())
    }

    /// Pack one sub-cell, wrap it in our single layer, and send it to
    /// the previous hop.  Every hop on the way back adds another layer.
    async fn send_reply<M: RelayMsg>(&mut self, msg: &M) -> Result<()> {
        let enc = {
            let mut rng = rand::thread_rng();
            let counter = self.send_ctr.next()?;
            let packed = pack_relay(counter, msg, RELAY_PLAINTEXT_LEN, &mut rng)?;
            self.key.encrypt_layer(&packed, &mut rng)
        };
        self.prev_link.send_relay(self.prev_id, &enc).await
    }
}

/// Wait for a cell from the next hop, or forever while the segment is
/// still terminating.
///
/// A free function so the select loop borrows only the `next` field.
async fn recv_next(next: &mut Option<NextHop>) -> Option<LinkCell> {
    match next.as_mut() {
        Some(next) => next.cells.recv().await,
        None => std::future::pending().await,
    }
}
