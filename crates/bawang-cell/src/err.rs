//! Define an error type for the bawang-cell crate.

use thiserror::Error;

/// An error produced while encoding or decoding cells and sub-cells.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Tried to encode a message that does not fit in its cell or
    /// sub-cell buffer.  This is a programming error: all messages the
    /// protocol produces are sized to fit.
    #[error("message too long for cell buffer")]
    BufferTooSmall,
    /// A cell or sub-cell violates the wire format.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    /// A cell or sub-cell carried a command we do not recognize.
    #[error("unrecognized command {0}")]
    UnknownCmd(u8),
    /// A relay counter reached its 24-bit limit; the tunnel must be
    /// rebuilt rather than allowed to wrap.
    #[error("relay counter exhausted")]
    CounterExhausted,
    /// A received relay counter did not strictly increase.
    #[error("relay counter replayed or regressed")]
    CounterRegression,
}
