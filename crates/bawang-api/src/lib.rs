//! The bawang node's local service protocols.
//!
//! Two framed TCP protocols share one message format: the *client API*,
//! over which a local application asks for tunnels and exchanges
//! payload, and the *RPS API*, from which the node samples random peers
//! for tunnel construction.  Frames are length-prefixed: a 16-bit size
//! (header included) and a 16-bit message type, big-endian, then the
//! body.
//!
//! This crate defines the message types, a [`tokio_util::codec`]
//! codec for the framing, and a small reconnecting RPS client.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unwrap_used)]

pub mod codec;
pub mod msg;
pub mod rps;

pub use codec::ApiCodec;
pub use msg::{ApiMsg, ApiMsgType};
pub use rps::{RpsClient, RpsPeerInfo};

use caret::caret_int;
use thiserror::Error;

/// Length of the frame header: a 16-bit size and a 16-bit type.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest body a frame can carry.
pub const MAX_BODY_LEN: usize = u16::MAX as usize - FRAME_HEADER_LEN;

caret_int! {
    /// Application identifiers, as used in RPS portmaps to say which
    /// service a port belongs to.
    pub struct AppType(u16) {
        /// The onion-routing module.
        ONION = 560,
    }
}

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced while speaking a local service protocol.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A frame violates the wire format.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    /// A frame carried a message type we do not implement.
    #[error("unrecognized message type {0}")]
    UnknownType(u16),
    /// Tried to encode a body longer than a frame can carry.
    #[error("message too long for frame")]
    MessageTooLong,
    /// An I/O error on the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer answered a query with something other than the expected
    /// reply type.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(ApiMsgType),
    /// An RPS peer had no port registered for the onion module.
    #[error("sampled peer exposes no onion port")]
    NoOnionPort,
    /// A query did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,
    /// The connection was closed before a reply arrived.
    #[error("connection closed")]
    Closed,
}
