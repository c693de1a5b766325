//! Message types for the client API and the RPS API.

use crate::{AppType, Error, Result};

use bytes::{Buf, BufMut};
use caret::caret_int;
use std::net::{IpAddr, SocketAddr};

caret_int! {
    /// The type code of a framed API message.
    pub struct ApiMsgType(u16) {
        /// Ask the RPS module for a random peer.
        RPS_QUERY = 540,
        /// A random peer, in response to RPS_QUERY.
        RPS_PEER = 541,
        /// Client asks for a tunnel to a destination.
        ONION_TUNNEL_BUILD = 560,
        /// Node confirms a tunnel is ready.
        ONION_TUNNEL_READY = 561,
        /// Node announces a tunnel built by a remote initiator.
        ONION_TUNNEL_INCOMING = 562,
        /// Client asks to drop a tunnel, or node reports it gone.
        ONION_TUNNEL_DESTROY = 563,
        /// Payload in either direction.
        ONION_TUNNEL_DATA = 564,
        /// Node reports a failed operation.
        ONION_ERROR = 565,
        /// Client asks for cover traffic.
        ONION_COVER = 566,
    }
}

/// Flag bit marking an IPv6 address.
const FLAG_IPV6: u8 = 1;

/// A parsed API or RPS message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApiMsg {
    /// Ask the RPS module for a random peer.
    RpsQuery,
    /// A random peer, in response to a query.
    RpsPeer(crate::rps::RpsPeerInfo),
    /// Ask for a tunnel to the given destination.
    TunnelBuild {
        /// Destination address and onion port.
        addr: SocketAddr,
        /// Destination identity key, PKCS#1 DER.
        hostkey_der: Vec<u8>,
    },
    /// The requested tunnel is up.
    TunnelReady {
        /// Id the client uses to address the tunnel from now on.
        tunnel_id: u32,
        /// Destination identity key, echoed back.
        hostkey_der: Vec<u8>,
    },
    /// A remote initiator's tunnel terminates here.
    TunnelIncoming {
        /// Id the client uses to address the tunnel.
        tunnel_id: u32,
    },
    /// Drop a tunnel (from the client), or: the tunnel is gone (from
    /// the node).
    TunnelDestroy {
        /// The affected tunnel.
        tunnel_id: u32,
    },
    /// Payload in either direction.
    TunnelData {
        /// The tunnel carrying the payload.
        tunnel_id: u32,
        /// The payload.
        data: Vec<u8>,
    },
    /// An asynchronous error report.
    Error {
        /// The message type of the request that failed.
        request: ApiMsgType,
        /// The affected tunnel, or 0.
        tunnel_id: u32,
    },
    /// Ask the node to emit cover traffic.
    Cover {
        /// How much cover traffic, in bytes of wire traffic.
        size: u16,
    },
}

impl ApiMsg {
    /// Return the type code of this message.
    pub fn msg_type(&self) -> ApiMsgType {
        match self {
            ApiMsg::RpsQuery => ApiMsgType::RPS_QUERY,
            ApiMsg::RpsPeer(_) => ApiMsgType::RPS_PEER,
            ApiMsg::TunnelBuild { .. } => ApiMsgType::ONION_TUNNEL_BUILD,
            ApiMsg::TunnelReady { .. } => ApiMsgType::ONION_TUNNEL_READY,
            ApiMsg::TunnelIncoming { .. } => ApiMsgType::ONION_TUNNEL_INCOMING,
            ApiMsg::TunnelDestroy { .. } => ApiMsgType::ONION_TUNNEL_DESTROY,
            ApiMsg::TunnelData { .. } => ApiMsgType::ONION_TUNNEL_DATA,
            ApiMsg::Error { .. } => ApiMsgType::ONION_ERROR,
            ApiMsg::Cover { .. } => ApiMsgType::ONION_COVER,
        }
    }

    /// Append the body of this message (not including the frame
    /// header).
    pub(crate) fn encode_onto(&self, out: &mut Vec<u8>) {
        match self {
            ApiMsg::RpsQuery => {}
            ApiMsg::RpsPeer(peer) => peer.encode_onto(out),
            ApiMsg::TunnelBuild { addr, hostkey_der } => {
                encode_addr_first(addr, out);
                out.put_slice(hostkey_der);
            }
            ApiMsg::TunnelReady {
                tunnel_id,
                hostkey_der,
            } => {
                out.put_u32(*tunnel_id);
                out.put_slice(hostkey_der);
            }
            ApiMsg::TunnelIncoming { tunnel_id }
            | ApiMsg::TunnelDestroy { tunnel_id } => {
                out.put_u32(*tunnel_id);
            }
            ApiMsg::TunnelData { tunnel_id, data } => {
                out.put_u32(*tunnel_id);
                out.put_slice(data);
            }
            ApiMsg::Error { request, tunnel_id } => {
                out.put_u16((*request).into());
                out.put_u16(0);
                out.put_u32(*tunnel_id);
            }
            ApiMsg::Cover { size } => {
                out.put_u16(*size);
                out.put_u16(0);
            }
        }
    }

    /// Decode a message body according to its type code.
    pub(crate) fn decode(msg_type: ApiMsgType, body: &[u8]) -> Result<Self> {
        let mut r = body;
        match msg_type {
            ApiMsgType::RPS_QUERY => Ok(ApiMsg::RpsQuery),
            ApiMsgType::RPS_PEER => Ok(ApiMsg::RpsPeer(crate::rps::RpsPeerInfo::decode(body)?)),
            ApiMsgType::ONION_TUNNEL_BUILD => {
                let addr = decode_addr_first(&mut r)?;
                Ok(ApiMsg::TunnelBuild {
                    addr,
                    hostkey_der: r.to_vec(),
                })
            }
            ApiMsgType::ONION_TUNNEL_READY => {
                if r.remaining() < 4 {
                    return Err(Error::InvalidMessage("truncated TUNNEL_READY"));
                }
                let tunnel_id = r.get_u32();
                Ok(ApiMsg::TunnelReady {
                    tunnel_id,
                    hostkey_der: r.to_vec(),
                })
            }
            ApiMsgType::ONION_TUNNEL_INCOMING => {
                if r.remaining() < 4 {
                    return Err(Error::InvalidMessage("truncated TUNNEL_INCOMING"));
                }
                Ok(ApiMsg::TunnelIncoming {
                    tunnel_id: r.get_u32(),
                })
            }
            ApiMsgType::ONION_TUNNEL_DESTROY => {
                if r.remaining() < 4 {
                    return Err(Error::InvalidMessage("truncated TUNNEL_DESTROY"));
                }
                Ok(ApiMsg::TunnelDestroy {
                    tunnel_id: r.get_u32(),
                })
            }
            ApiMsgType::ONION_TUNNEL_DATA => {
                if r.remaining() < 4 {
                    return Err(Error::InvalidMessage("truncated TUNNEL_DATA"));
                }
                let tunnel_id = r.get_u32();
                Ok(ApiMsg::TunnelData {
                    tunnel_id,
                    data: r.to_vec(),
                })
            }
            ApiMsgType::ONION_ERROR => {
                if r.remaining() < 8 {
                    return Err(Error::InvalidMessage("truncated ONION_ERROR"));
                }
                let request: ApiMsgType = r.get_u16().into();
                let _reserved = r.get_u16();
                Ok(ApiMsg::Error {
                    request,
                    tunnel_id: r.get_u32(),
                })
            }
            ApiMsgType::ONION_COVER => {
                if r.remaining() < 2 {
                    return Err(Error::InvalidMessage("truncated ONION_COVER"));
                }
                Ok(ApiMsg::Cover { size: r.get_u16() })
            }
            other => Err(Error::UnknownType(other.into())),
        }
    }
}

/// Encode the flags/port/address prefix shared by TUNNEL_BUILD bodies.
fn encode_addr_first(addr: &SocketAddr, out: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.put_u8(0);
            out.put_u8(0);
            out.put_u16(addr.port());
            out.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.put_u8(0);
            out.put_u8(FLAG_IPV6);
            out.put_u16(addr.port());
            out.put_slice(&v6.octets());
        }
    }
}

/// Decode the flags/port/address prefix shared by TUNNEL_BUILD bodies.
fn decode_addr_first(r: &mut &[u8]) -> Result<SocketAddr> {
    if r.remaining() < 4 {
        return Err(Error::InvalidMessage("truncated address"));
    }
    let _reserved = r.get_u8();
    let flags = r.get_u8();
    let port = r.get_u16();
    let ip: IpAddr = if flags & FLAG_IPV6 != 0 {
        if r.remaining() < 16 {
            return Err(Error::InvalidMessage("truncated IPv6 address"));
        }
        let mut octets = [0_u8; 16];
        r.copy_to_slice(&mut octets);
        octets.into()
    } else {
        if r.remaining() < 4 {
            return Err(Error::InvalidMessage("truncated IPv4 address"));
        }
        let mut octets = [0_u8; 4];
        r.copy_to_slice(&mut octets);
        octets.into()
    };
    Ok(SocketAddr::new(ip, port))
}

/// Decode the portmap/address/hostkey layout of an RPS peer, used by
/// [`crate::rps::RpsPeerInfo`].
pub(crate) fn decode_peer(body: &[u8]) -> Result<(SocketAddr, Vec<u8>)> {
    let mut r = body;
    if r.remaining() < 2 {
        return Err(Error::InvalidMessage("truncated RPS_PEER"));
    }
    let n_ports = usize::from(r.get_u8());
    let flags = r.get_u8();
    let mut onion_port = None;
    for _ in 0..n_ports {
        if r.remaining() < 4 {
            return Err(Error::InvalidMessage("truncated RPS_PEER portmap"));
        }
        let app: AppType = r.get_u16().into();
        let port = r.get_u16();
        if app == AppType::ONION {
            onion_port = Some(port);
        }
    }
    let ip: IpAddr = if flags & FLAG_IPV6 != 0 {
        if r.remaining() < 16 {
            return Err(Error::InvalidMessage("truncated RPS_PEER address"));
        }
        let mut octets = [0_u8; 16];
        r.copy_to_slice(&mut octets);
        octets.into()
    } else {
        if r.remaining() < 4 {
            return Err(Error::InvalidMessage("truncated RPS_PEER address"));
        }
        let mut octets = [0_u8; 4];
        r.copy_to_slice(&mut octets);
        octets.into()
    };
    let port = onion_port.ok_or(Error::NoOnionPort)?;
    Ok((SocketAddr::new(ip, port), r.to_vec()))
}

/// Encode the portmap/address/hostkey layout of an RPS peer.
pub(crate) fn encode_peer(addr: &SocketAddr, hostkey_der: &[u8], out: &mut Vec<u8>) {
    out.put_u8(1);
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.put_u8(0);
            out.put_u16(AppType::ONION.into());
            out.put_u16(addr.port());
            out.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.put_u8(FLAG_IPV6);
            out.put_u16(AppType::ONION.into());
            out.put_u16(addr.port());
            out.put_slice(&v6.octets());
        }
    }
    out.put_slice(hostkey_der);
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn roundtrip(msg: ApiMsg) {
        let mut body = Vec::new();
        msg.encode_onto(&mut body);
        let parsed = ApiMsg::decode(msg.msg_type(), &body).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn all_types_roundtrip() {
        roundtrip(ApiMsg::RpsQuery);
        roundtrip(ApiMsg::RpsPeer(crate::rps::RpsPeerInfo {
            addr: "10.0.0.7:4433".parse().unwrap(),
            hostkey_der: vec![1, 2, 3],
        }));
        roundtrip(ApiMsg::TunnelBuild {
            addr: "192.168.1.1:1234".parse().unwrap(),
            hostkey_der: vec![9; 550],
        });
        roundtrip(ApiMsg::TunnelBuild {
            addr: "[2001:db8::1]:1234".parse().unwrap(),
            hostkey_der: vec![9; 550],
        });
        roundtrip(ApiMsg::TunnelReady {
            tunnel_id: 77,
            hostkey_der: vec![4; 32],
        });
        roundtrip(ApiMsg::TunnelIncoming { tunnel_id: 1 });
        roundtrip(ApiMsg::TunnelDestroy { tunnel_id: 2 });
        roundtrip(ApiMsg::TunnelData {
            tunnel_id: 3,
            data: b"payload".to_vec(),
        });
        roundtrip(ApiMsg::Error {
            request: ApiMsgType::ONION_TUNNEL_BUILD,
            tunnel_id: 4,
        });
        roundtrip(ApiMsg::Cover { size: 2048 });
    }

    #[test]
    fn truncated_bodies_error_out() {
        for t in [
            ApiMsgType::ONION_TUNNEL_READY,
            ApiMsgType::ONION_TUNNEL_INCOMING,
            ApiMsgType::ONION_TUNNEL_DESTROY,
            ApiMsgType::ONION_TUNNEL_DATA,
            ApiMsgType::ONION_ERROR,
            ApiMsgType::ONION_COVER,
        ] {
            assert!(ApiMsg::decode(t, &[0]).is_err());
        }
    }

    #[test]
    fn peer_without_onion_port_is_rejected() {
        // One portmap entry for an app we don't know.
        let mut body: Vec<u8> = vec![1, 0];
        body.put_u16(650);
        body.put_u16(9000);
        body.put_slice(&[127, 0, 0, 1]);
        assert!(matches!(
            ApiMsg::decode(ApiMsgType::RPS_PEER, &body),
            Err(Error::NoOnionPort)
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            ApiMsg::decode(999.into(), &[]),
            Err(Error::UnknownType(999))
        ));
    }
}
