//! Messages sent between bawang relays.
//!
//! Every pair of neighboring relays talks over one TLS connection, and
//! everything on that connection is a fixed-size *cell*.  This crate
//! implements the encoding for cells and for the *relay sub-cells* that
//! travel, layer-encrypted, inside `RELAY` cells.  It knows nothing about
//! cryptography beyond the relay digest; the layer cipher lives in
//! `bawang-crypto`.
//!
//! A cell is exactly [`CELL_LEN`] bytes: a 5-byte header (tunnel id and
//! command) followed by the body, with any unused tail filled with
//! random bytes so that cell contents are indistinguishable on the wire.

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

pub mod cell;
pub mod relay;

mod err;

pub use err::Error;

use caret::caret_int;

/// The length of a cell on the wire, in bytes.
///
/// Every write to a link is a whole number of cells; readers consume
/// exactly this many bytes per cell.
pub const CELL_LEN: usize = 1024;

/// The length of a cell header: a 4-byte tunnel id and a 1-byte command.
pub const CELL_HEADER_LEN: usize = 5;

/// The amount of data carried in the body of a single cell.
pub const CELL_BODY_LEN: usize = CELL_LEN - CELL_HEADER_LEN;

/// The length of a relay sub-cell header.
pub const RELAY_HEADER_LEN: usize = 15;

/// The length of a wrapped handshake key as carried in `CREATE` cells and
/// `EXTEND` sub-cells: an RSA-4096 OAEP ciphertext.
pub const HANDSHAKE_LEN: usize = 512;

/// Identifier for a tunnel, scoped to one node (and to one link, for the
/// hop-by-hop ids rewritten at every relay).
pub type TunnelId = u32;

/// A whole cell considered as a raw array of bytes.
pub type RawCell = [u8; CELL_LEN];

/// A cell body considered as a raw array of bytes.
pub type RawCellBody = [u8; CELL_BODY_LEN];

/// A [`RawCellBody`] stored on the heap.
///
/// We use this to avoid copying kilobyte bodies through channels.
pub type BoxedCellBody = Box<RawCellBody>;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

caret_int! {
    /// A CellCmd is the type of a cell.  The command tells each relay
    /// whether the cell is part of a handshake, a teardown, or opaque
    /// relayed traffic.
    pub struct CellCmd(u8) {
        /// Open a new tunnel segment on this link.
        CREATE = 1,
        /// Successful response to a CREATE cell.
        CREATED = 2,
        /// Tear down a tunnel hop-by-hop.
        DESTROY = 3,
        /// Layer-encrypted relay sub-cell, forwarded along the tunnel.
        RELAY = 4,
    }
}

caret_int! {
    /// A RelayCmd is the type of a relay sub-cell, visible only after
    /// the digest-bearing layer has been removed.
    pub struct RelayCmd(u8) {
        /// Extend the tunnel by one hop.
        EXTEND = 1,
        /// Successful response to an EXTEND sub-cell.
        EXTENDED = 2,
        /// Application payload.
        DATA = 3,
        /// Cover traffic; answered in kind once, then dropped.
        COVER = 4,
    }
}
