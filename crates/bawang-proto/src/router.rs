//! The router: registry of links, tunnels, segments, and API
//! subscribers.
//!
//! The router is the only component allowed to allocate tunnel ids,
//! register or remove links, and look into both tunnel maps, so every
//! cross-tunnel state transition funnels through it.  Map groups sit
//! behind their own blocking mutexes, never held across an `await`;
//! when more than one is needed they are taken in the fixed order
//! subscribers, then tunnels, then links.

use crate::event::{ApiConnId, Event};
use crate::link::{Link, LinkCell};
use crate::peer::{BoxedPeerStream, LinkConnector, Peer, PeerSampler};
use crate::segment::{Segment, SegmentRequest};
use crate::tunnel::TunnelRequest;
use crate::{Error, Result, RouterConfig, TunnelId};

use bawang_cell::BoxedCellBody;
use bawang_crypto::{IdentityKeypair, MAX_LAYERS};

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A queued request to build one tunnel.
pub(crate) struct BuildJob {
    /// The destination the client named.
    pub(crate) dest: Peer,
    /// The API connection to subscribe on success, if any.
    pub(crate) conn: Option<ApiConnId>,
    /// Where the result goes.
    pub(crate) reply: oneshot::Sender<Result<TunnelId>>,
}

/// The state of one outgoing-tunnel slot in the router's map.
///
/// A `Building` entry reserves the id (keeping allocation atomic with
/// respect to the uniqueness invariant) until the handshakes finish.
pub(crate) enum OutgoingEntry {
    /// Still running its handshakes.
    Building,
    /// Live, owned by a handler task.
    Open(TunnelHandle),
}

/// The router's handle to a live outgoing tunnel.
///
/// Handler tasks hold child tokens of the router's quit token, so
/// shutdown needs no per-handle bookkeeping here.
pub(crate) struct TunnelHandle {
    /// Requests into the handler task.
    pub(crate) requests: mpsc::UnboundedSender<TunnelRequest>,
    /// The destination, kept for round rebuilds.
    pub(crate) dest: Peer,
    /// True for the idle-time cover tunnel.
    pub(crate) is_cover: bool,
}

/// The router's handle to a tunnel segment.
pub(crate) struct SegmentHandle {
    /// Requests into the handler task.
    pub(crate) requests: mpsc::UnboundedSender<SegmentRequest>,
}

/// Both tunnel maps, guarded together so the id-uniqueness invariant
/// can be checked atomically.
#[derive(Default)]
pub(crate) struct TunnelMaps {
    /// Tunnels this node initiated, by their id on the first link.
    pub(crate) outgoing: HashMap<TunnelId, OutgoingEntry>,
    /// Segments of remotely initiated tunnels, by their id on the
    /// initiator-side link.
    pub(crate) incoming: HashMap<TunnelId, SegmentHandle>,
}

/// API connections and their tunnel subscriptions.
#[derive(Default)]
struct SubscriberMap {
    /// Every live API connection, by id.
    conns: HashMap<ApiConnId, mpsc::UnboundedSender<Event>>,
    /// Which connections care about which tunnel.
    by_tunnel: HashMap<TunnelId, HashSet<ApiConnId>>,
}

/// Shared state behind a [`Router`] handle.
pub(crate) struct RouterInner {
    /// Core configuration.
    pub(crate) config: RouterConfig,
    /// This node's identity, used to answer `CREATE` handshakes.
    pub(crate) identity: Arc<IdentityKeypair>,
    /// Opens transport streams to peers.
    connector: Box<dyn LinkConnector>,
    /// Produces random peers for path selection.
    pub(crate) sampler: Box<dyn PeerSampler>,
    /// API connections and subscriptions.
    subscribers: Mutex<SubscriberMap>,
    /// Both tunnel maps.
    pub(crate) tunnels: Mutex<TunnelMaps>,
    /// Every live link, by peer address.
    links: Mutex<HashMap<SocketAddr, Link>>,
    /// Producer side of the build queue.
    build_tx: mpsc::UnboundedSender<BuildJob>,
    /// Consumer side of the build queue, taken once by [`Router::run`].
    pub(crate) build_rx: Mutex<Option<mpsc::UnboundedReceiver<BuildJob>>>,
    /// Cancelled on shutdown; every handler task holds a child token.
    pub(crate) quit: CancellationToken,
}

/// The onion-routing core of one node.  Cheap to clone.
#[derive(Clone)]
pub struct Router {
    /// Shared state.
    pub(crate) inner: Arc<RouterInner>,
}

impl Router {
    /// Create a router.
    ///
    /// Rejects a `tunnel_length` below 3 hops or beyond the layer
    /// budget of a cell.
    pub fn new(
        config: RouterConfig,
        identity: IdentityKeypair,
        connector: Box<dyn LinkConnector>,
        sampler: Box<dyn PeerSampler>,
    ) -> Result<Router> {
        if config.tunnel_length < 3 {
            return Err(Error::NotEnoughHops(config.tunnel_length));
        }
        if config.tunnel_length > MAX_LAYERS {
            return Err(Error::TooManyHops(config.tunnel_length));
        }
        let (build_tx, build_rx) = mpsc::unbounded_channel();
        Ok(Router {
            inner: Arc::new(RouterInner {
                config,
                identity: Arc::new(identity),
                connector,
                sampler,
                subscribers: Mutex::new(SubscriberMap::default()),
                tunnels: Mutex::new(TunnelMaps::default()),
                links: Mutex::new(HashMap::new()),
                build_tx,
                build_rx: Mutex::new(Some(build_rx)),
                quit: CancellationToken::new(),
            }),
        })
    }

    /// Wrap shared state back into a handle.
    pub(crate) fn from_inner(inner: Arc<RouterInner>) -> Router {
        Router { inner }
    }

    /// Ask every handler task to stop and close every link.
    pub fn shutdown(&self) {
        self.inner.quit.cancel();
        let links: Vec<Link> = self
            .inner
            .links
            .lock()
            .expect("poisoned lock")
            .values()
            .cloned()
            .collect();
        for link in links {
            link.terminate();
        }
    }

    /// Register a local API connection; its events arrive on `tx`.
    pub fn subscribe(&self, tx: mpsc::UnboundedSender<Event>) -> ApiConnId {
        let id = ApiConnId::next();
        self.inner
            .subscribers
            .lock()
            .expect("poisoned lock")
            .conns
            .insert(id, tx);
        debug!("{} subscribed", id);
        id
    }

    /// Drop a local API connection and all its tunnel subscriptions.
    /// Tunnels left without subscribers go away on the next round.
    pub fn unsubscribe(&self, conn: ApiConnId) {
        let mut subs = self.inner.subscribers.lock().expect("poisoned lock");
        subs.conns.remove(&conn);
        for set in subs.by_tunnel.values_mut() {
            set.remove(&conn);
        }
        debug!("{} unsubscribed", conn);
    }

    /// Subscribe one API connection to one tunnel's events.
    pub fn subscribe_tunnel(&self, conn: ApiConnId, tunnel_id: TunnelId) {
        let mut subs = self.inner.subscribers.lock().expect("poisoned lock");
        subs.by_tunnel.entry(tunnel_id).or_default().insert(conn);
    }

    /// Ask for a tunnel to `dest`, subscribing `conn` on success.
    ///
    /// The job is queued for the scheduler task; the future resolves
    /// when the build finishes or fails.
    pub async fn build_tunnel(&self, dest: Peer, conn: Option<ApiConnId>) -> Result<TunnelId> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .build_tx
            .send(BuildJob { dest, conn, reply })
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Send payload on a tunnel, outgoing or incoming alike.
    pub fn send_data(&self, tunnel_id: TunnelId, data: Vec<u8>) -> Result<()> {
        let maps = self.inner.tunnels.lock().expect("poisoned lock");
        if let Some(entry) = maps.outgoing.get(&tunnel_id) {
            return match entry {
                OutgoingEntry::Open(handle) => handle
                    .requests
                    .send(TunnelRequest::Data(data))
                    .map_err(|_| Error::TunnelClosed),
                OutgoingEntry::Building => Err(Error::InvalidTunnel(tunnel_id)),
            };
        }
        if let Some(segment) = maps.incoming.get(&tunnel_id) {
            return segment
                .requests
                .send(SegmentRequest::Data(data))
                .map_err(|_| Error::TunnelClosed);
        }
        Err(Error::InvalidTunnel(tunnel_id))
    }

    /// Send `size` bytes worth of cover traffic, in whole-cell units,
    /// over the cover tunnel.
    ///
    /// Cover traffic exists to disguise the idle case, so this fails
    /// whenever any user tunnel exists.
    pub fn send_cover(&self, size: u16) -> Result<()> {
        let cells = crate::rounds::cover_cells(size);
        let maps = self.inner.tunnels.lock().expect("poisoned lock");
        let mut cover = None;
        for entry in maps.outgoing.values() {
            match entry {
                OutgoingEntry::Open(handle) if handle.is_cover => cover = Some(handle),
                OutgoingEntry::Open(_) | OutgoingEntry::Building => {
                    return Err(Error::SendCoverNotAllowed);
                }
            }
        }
        let cover = cover.ok_or(Error::NoCoverTunnel)?;
        if cells > 0 {
            cover
                .requests
                .send(TunnelRequest::Cover(cells))
                .map_err(|_| Error::TunnelClosed)?;
        }
        Ok(())
    }

    /// Tear down a tunnel, outgoing or incoming alike.
    pub fn destroy_tunnel(&self, tunnel_id: TunnelId) -> Result<()> {
        let maps = self.inner.tunnels.lock().expect("poisoned lock");
        if let Some(OutgoingEntry::Open(handle)) = maps.outgoing.get(&tunnel_id) {
            return handle
                .requests
                .send(TunnelRequest::Destroy { notify: false })
                .map_err(|_| Error::TunnelClosed);
        }
        if let Some(segment) = maps.incoming.get(&tunnel_id) {
            return segment
                .requests
                .send(SegmentRequest::Destroy { notify: false })
                .map_err(|_| Error::TunnelClosed);
        }
        Err(Error::InvalidTunnel(tunnel_id))
    }

    /// Adopt an accepted transport stream as a new link.
    ///
    /// Used by the TLS listener, and by tests that wire nodes together
    /// with in-memory streams.
    pub fn handle_incoming(&self, stream: BoxedPeerStream, addr: SocketAddr) {
        let link = Link::launch(stream, addr, Arc::downgrade(&self.inner));
        debug!("adopted incoming link from {}", addr);
        self.inner
            .links
            .lock()
            .expect("poisoned lock")
            .insert(addr, link);
    }

    /// Return the ids of all outgoing tunnels (cover included).
    pub fn outgoing_ids(&self) -> Vec<TunnelId> {
        let maps = self.inner.tunnels.lock().expect("poisoned lock");
        maps.outgoing.keys().copied().collect()
    }

    /// Return the ids of all tunnel segments.
    pub fn incoming_ids(&self) -> Vec<TunnelId> {
        let maps = self.inner.tunnels.lock().expect("poisoned lock");
        maps.incoming.keys().copied().collect()
    }

    /// Return the cover tunnel's id, if one is up.
    pub fn cover_tunnel_id(&self) -> Option<TunnelId> {
        let maps = self.inner.tunnels.lock().expect("poisoned lock");
        maps.outgoing.iter().find_map(|(id, entry)| match entry {
            OutgoingEntry::Open(handle) if handle.is_cover => Some(*id),
            _ => None,
        })
    }

    /// Return how many links are currently open.
    pub fn n_links(&self) -> usize {
        self.inner.links.lock().expect("poisoned lock").len()
    }

    /// Return the per-step handshake timeout.
    pub(crate) fn build_timeout(&self) -> Duration {
        self.inner.config.build_timeout
    }

    /// Fan an event out to every subscriber of `tunnel_id`.
    pub(crate) fn notify_tunnel(&self, tunnel_id: TunnelId, event: &Event) {
        let subs = self.inner.subscribers.lock().expect("poisoned lock");
        let Some(conns) = subs.by_tunnel.get(&tunnel_id) else {
            return;
        };
        for conn in conns {
            if let Some(tx) = subs.conns.get(conn) {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Deliver payload that arrived on an outgoing tunnel.
    pub(crate) fn deliver_data(&self, tunnel_id: TunnelId, data: Vec<u8>) {
        self.notify_tunnel(tunnel_id, &Event::Data { tunnel_id, data });
    }

    /// Deliver payload that arrived on a segment.  The first payload
    /// makes the tunnel visible: every known API connection gets
    /// subscribed and hears [`Event::Incoming`] before the data.
    pub(crate) fn deliver_segment_data(
        &self,
        tunnel_id: TunnelId,
        data: Vec<u8>,
        api_visible: &mut bool,
    ) {
        if !*api_visible {
            *api_visible = true;
            let mut subs = self.inner.subscribers.lock().expect("poisoned lock");
            let conns: Vec<ApiConnId> = subs.conns.keys().copied().collect();
            let set = subs.by_tunnel.entry(tunnel_id).or_default();
            for conn in &conns {
                set.insert(*conn);
            }
            for conn in &conns {
                if let Some(tx) = subs.conns.get(conn) {
                    let _ = tx.send(Event::Incoming { tunnel_id });
                }
            }
            debug!("segment {} now visible to {} api connections", tunnel_id, conns.len());
        }
        self.deliver_data(tunnel_id, data);
    }

    /// Drop every subscription to a tunnel that no longer exists.
    fn drop_tunnel_subscriptions(&self, tunnel_id: TunnelId) {
        self.inner
            .subscribers
            .lock()
            .expect("poisoned lock")
            .by_tunnel
            .remove(&tunnel_id);
    }

    /// Move every subscription from a rebuilt tunnel's old id to its
    /// replacement.
    pub(crate) fn move_subscriptions(&self, from: TunnelId, to: TunnelId) {
        let mut subs = self.inner.subscribers.lock().expect("poisoned lock");
        if let Some(old) = subs.by_tunnel.remove(&from) {
            subs.by_tunnel.entry(to).or_default().extend(old);
        }
    }

    /// Return the set of outgoing tunnels that currently have at least
    /// one subscriber.
    pub(crate) fn subscribed_tunnels(&self) -> HashSet<TunnelId> {
        let subs = self.inner.subscribers.lock().expect("poisoned lock");
        subs.by_tunnel
            .iter()
            .filter(|(_, conns)| !conns.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Return the ids of segments that were made API-visible and have
    /// since lost every subscriber.
    pub(crate) fn orphaned_api_tunnels(&self) -> Vec<TunnelId> {
        let subs = self.inner.subscribers.lock().expect("poisoned lock");
        subs.by_tunnel
            .iter()
            .filter(|(_, conns)| conns.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Bookkeeping after an outgoing tunnel's handler exited.
    pub(crate) fn outgoing_closed(&self, tunnel_id: TunnelId, link: &Link, event: Option<Event>) {
        {
            let mut maps = self.inner.tunnels.lock().expect("poisoned lock");
            maps.outgoing.remove(&tunnel_id);
        }
        if let Some(event) = event {
            self.notify_tunnel(tunnel_id, &event);
        }
        self.drop_tunnel_subscriptions(tunnel_id);
        self.release_link(link);
    }

    /// Bookkeeping after a segment's handler exited.
    pub(crate) fn incoming_closed(
        &self,
        tunnel_id: TunnelId,
        prev_link: &Link,
        next_link: Option<&Link>,
        event: Option<Event>,
    ) {
        {
            let mut maps = self.inner.tunnels.lock().expect("poisoned lock");
            maps.incoming.remove(&tunnel_id);
        }
        if let Some(event) = event {
            self.notify_tunnel(tunnel_id, &event);
        }
        self.drop_tunnel_subscriptions(tunnel_id);
        self.release_link(prev_link);
        if let Some(next) = next_link {
            self.release_link(next);
        }
    }

    /// Close and forget a link once nothing uses it.
    pub(crate) fn release_link(&self, link: &Link) {
        if link.n_tunnels() == 0 {
            link.terminate();
            self.inner.forget_link(link);
        }
    }

    /// Sweep every link that has no tunnels left.
    pub(crate) fn sweep_links(&self) {
        let mut links = self.inner.links.lock().expect("poisoned lock");
        links.retain(|addr, link| {
            if link.is_closed() || link.n_tunnels() == 0 {
                trace!("closing idle link to {}", addr);
                link.terminate();
                false
            } else {
                true
            }
        });
    }

    /// Allocate an unused tunnel id, register it on `link`, and
    /// reserve it in the outgoing map.
    pub(crate) fn reserve_outgoing(
        &self,
        link: &Link,
    ) -> Result<(TunnelId, mpsc::Receiver<LinkCell>)> {
        let mut maps = self.inner.tunnels.lock().expect("poisoned lock");
        loop {
            let id = alloc_id(&maps);
            match link.register_tunnel(id) {
                Ok(rx) => {
                    maps.outgoing.insert(id, OutgoingEntry::Building);
                    return Ok((id, rx));
                }
                // The id is taken by some other circuit on this link;
                // roll again.
                Err(Error::InvalidTunnel(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Undo [`Router::reserve_outgoing`] after a failed build.
    pub(crate) async fn abort_build(&self, tunnel_id: TunnelId, link: &Link) {
        {
            let mut maps = self.inner.tunnels.lock().expect("poisoned lock");
            maps.outgoing.remove(&tunnel_id);
        }
        // Partially built hops are told to go away; best-effort.
        link.send_destroy(tunnel_id).await;
        link.unregister_tunnel(tunnel_id);
        self.release_link(link);
    }

    /// Return an existing live link to `addr`, or dial a new one.
    pub(crate) async fn get_or_create_link(&self, addr: SocketAddr) -> Result<Link> {
        if let Some(link) = self.inner.lookup_link(addr) {
            return Ok(link);
        }
        let stream = self
            .inner
            .connector
            .connect(addr)
            .await
            .map_err(Error::transport)?;
        let mut links = self.inner.links.lock().expect("poisoned lock");
        // Somebody else may have won the race while we were dialing;
        // their link wins and our stream is dropped.
        if let Some(existing) = links.get(&addr) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let link = Link::launch(stream, addr, Arc::downgrade(&self.inner));
        links.insert(addr, link.clone());
        debug!("opened link to {}", addr);
        Ok(link)
    }

    /// Open a link toward `addr` for a segment's next hop, and
    /// allocate a tunnel id on it.
    pub(crate) async fn open_next_hop(
        &self,
        addr: SocketAddr,
    ) -> Result<(TunnelId, Link, mpsc::Receiver<LinkCell>)> {
        let link = self.get_or_create_link(addr).await?;
        let (id, rx) = {
            let maps = self.inner.tunnels.lock().expect("poisoned lock");
            loop {
                let id = alloc_id(&maps);
                match link.register_tunnel(id) {
                    Ok(rx) => break (id, rx),
                    Err(Error::InvalidTunnel(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        };
        Ok((id, link, rx))
    }

    /// Start a segment for a `CREATE` cell that arrived with an
    /// unknown tunnel id.  Called from link read loops; must register
    /// the id before returning so later cells queue up behind the
    /// handshake.
    pub(crate) fn spawn_segment(&self, link: Link, tunnel_id: TunnelId, body: BoxedCellBody) {
        let rx = match link.register_tunnel(tunnel_id) {
            Ok(rx) => rx,
            // A raced duplicate CREATE; first one wins.
            Err(_) => return,
        };
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let quit = self.inner.quit.child_token();
        {
            let mut maps = self.inner.tunnels.lock().expect("poisoned lock");
            if maps.outgoing.contains_key(&tunnel_id) || maps.incoming.contains_key(&tunnel_id) {
                // The initiator picked an id we already use; refuse so
                // the uniqueness invariant holds.
                drop(maps);
                warn!(
                    "refusing CREATE from {} with colliding tunnel id {}",
                    link.addr(),
                    tunnel_id
                );
                link.unregister_tunnel(tunnel_id);
                tokio::spawn(async move { link.send_destroy(tunnel_id).await });
                return;
            }
            maps.incoming.insert(tunnel_id, SegmentHandle { requests: req_tx });
        }
        let identity = Arc::clone(&self.inner.identity);
        tokio::spawn(Segment::run(
            self.clone(),
            identity,
            link,
            tunnel_id,
            body,
            rx,
            req_rx,
            quit,
        ));
    }
}

impl RouterInner {
    /// Return the live link to `addr`, if any.
    fn lookup_link(&self, addr: SocketAddr) -> Option<Link> {
        let links = self.links.lock().expect("poisoned lock");
        links.get(&addr).filter(|l| !l.is_closed()).cloned()
    }

    /// Forget a link, if the registered entry is this very link.
    pub(crate) fn forget_link(&self, link: &Link) {
        let mut links = self.links.lock().expect("poisoned lock");
        if let Some(registered) = links.get(&link.addr()) {
            if registered.same_link(link) {
                links.remove(&link.addr());
            }
        }
    }
}

/// Pick a random 32-bit id colliding with neither tunnel map.  Zero is
/// skipped so an id is never mistaken for "unset".
fn alloc_id(maps: &TunnelMaps) -> TunnelId {
    let mut rng = rand::thread_rng();
    loop {
        let id: TunnelId = rng.gen();
        if id != 0 && !maps.outgoing.contains_key(&id) && !maps.incoming.contains_key(&id) {
            return id;
        }
    }
}
