//! The local client API frontend.
//!
//! One task per accepted connection translates between framed API
//! messages and router calls, and forwards the router's events back
//! out.  Tunnel builds run in their own tasks so a slow handshake does
//! not stall the connection.

use bawang_api::{ApiCodec, ApiMsg, ApiMsgType};
use bawang_crypto::IdentityPublic;
use bawang_proto::{Event, Peer, Router, TunnelOp};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accept API connections until shutdown.
pub(crate) async fn serve(listener: TcpListener, router: Router, quit: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = quit.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!("api connection from {}", addr);
                tokio::spawn(handle_conn(stream, router.clone()));
            }
            Err(e) => {
                warn!("api accept failed: {}", e);
            }
        }
    }
}

/// Drive one API connection until it closes.
async fn handle_conn(stream: TcpStream, router: Router) {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let conn = router.subscribe(events_tx);

    let (mut sink, mut frames) = Framed::new(stream, ApiCodec).split();
    // All outbound frames (replies, events, build results) funnel
    // through one queue so the sink has a single writer.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ApiMsg>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            event = events.recv() => match event {
                None => break,
                Some(event) => {
                    if out_tx.send(event_to_msg(event)).is_err() {
                        break;
                    }
                }
            },
            frame = frames.next() => match frame {
                None => break,
                Some(Err(e)) => {
                    warn!("{}: bad api frame: {}", conn, e);
                    break;
                }
                Some(Ok(msg)) => handle_msg(&router, conn, msg, &out_tx).await,
            },
        }
    }

    router.unsubscribe(conn);
    writer.abort();
    debug!("{} closed", conn);
}

/// Dispatch one inbound API message.
async fn handle_msg(
    router: &Router,
    conn: bawang_proto::ApiConnId,
    msg: ApiMsg,
    out: &mpsc::UnboundedSender<ApiMsg>,
) {
    match msg {
        ApiMsg::TunnelBuild { addr, hostkey_der } => {
            let identity = match IdentityPublic::from_pkcs1_der(&hostkey_der) {
                Ok(identity) => identity,
                Err(e) => {
                    warn!("{}: build request with bad hostkey: {}", conn, e);
                    let _ = out.send(ApiMsg::Error {
                        request: ApiMsgType::ONION_TUNNEL_BUILD,
                        tunnel_id: 0,
                    });
                    return;
                }
            };
            let dest = Peer { addr, identity };
            let router = router.clone();
            let out = out.clone();
            tokio::spawn(async move {
                match router.build_tunnel(dest, Some(conn)).await {
                    Ok(tunnel_id) => {
                        info!("{}: tunnel {} ready", conn, tunnel_id);
                        let _ = out.send(ApiMsg::TunnelReady {
                            tunnel_id,
                            hostkey_der,
                        });
                    }
                    Err(e) => {
                        warn!("{}: tunnel build failed: {}", conn, e);
                        let _ = out.send(ApiMsg::Error {
                            request: ApiMsgType::ONION_TUNNEL_BUILD,
                            tunnel_id: 0,
                        });
                    }
                }
            });
        }
        ApiMsg::TunnelDestroy { tunnel_id } => {
            if let Err(e) = router.destroy_tunnel(tunnel_id) {
                warn!("{}: destroy of {} failed: {}", conn, tunnel_id, e);
                let _ = out.send(ApiMsg::Error {
                    request: ApiMsgType::ONION_TUNNEL_DESTROY,
                    tunnel_id,
                });
            }
        }
        ApiMsg::TunnelData { tunnel_id, data } => {
            if let Err(e) = router.send_data(tunnel_id, data) {
                warn!("{}: send on {} failed: {}", conn, tunnel_id, e);
                let _ = out.send(ApiMsg::Error {
                    request: ApiMsgType::ONION_TUNNEL_DATA,
                    tunnel_id,
                });
            }
        }
        ApiMsg::Cover { size } => {
            if let Err(e) = router.send_cover(size) {
                warn!("{}: cover request failed: {}", conn, e);
                let _ = out.send(ApiMsg::Error {
                    request: ApiMsgType::ONION_COVER,
                    tunnel_id: 0,
                });
            }
        }
        other => {
            // A message the node only ever sends, arriving inbound.
            warn!("{}: unexpected {} from client", conn, other.msg_type());
        }
    }
}

/// Translate a router event into its wire message.
fn event_to_msg(event: Event) -> ApiMsg {
    match event {
        Event::Incoming { tunnel_id } => ApiMsg::TunnelIncoming { tunnel_id },
        Event::Data { tunnel_id, data } => ApiMsg::TunnelData { tunnel_id, data },
        Event::Destroyed { tunnel_id } => ApiMsg::TunnelDestroy { tunnel_id },
        Event::Error { op, tunnel_id } => ApiMsg::Error {
            request: op_to_request(op),
            tunnel_id,
        },
        // Events this frontend does not know yet surface as a generic
        // error rather than a crash.
        _ => ApiMsg::Error {
            request: ApiMsgType::ONION_ERROR,
            tunnel_id: 0,
        },
    }
}

/// Map a failed operation to the request type named in `ONION_ERROR`.
fn op_to_request(op: TunnelOp) -> ApiMsgType {
    match op {
        TunnelOp::Build => ApiMsgType::ONION_TUNNEL_BUILD,
        TunnelOp::Data => ApiMsgType::ONION_TUNNEL_DATA,
        TunnelOp::Cover => ApiMsgType::ONION_COVER,
        TunnelOp::Destroy => ApiMsgType::ONION_TUNNEL_DESTROY,
        _ => ApiMsgType::ONION_ERROR,
    }
}
