//! Cryptography for the bawang onion router.
//!
//! Two jobs live here.  The first is the *tunnel handshake*: an
//! initiator wraps an ephemeral X25519 public key under the responder's
//! long-term RSA identity key with OAEP, and both sides derive a 32-byte
//! shared secret, confirmed by a SHA-256 hash that only the identity-key
//! holder could have produced.  The second is *layered relay
//! encryption*: every hop's shared secret keys one AES-256-CTR layer,
//! and each layer prepends its own fresh IV.
//!
//! Nothing in this crate does I/O; key material never leaves it except
//! as wire-format byte strings.

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

pub mod handshake;
pub mod keys;
pub mod layered;

use thiserror::Error;

pub use handshake::{respond_handshake, start_handshake, HandshakeState};
pub use keys::{IdentityKeypair, IdentityPublic};
pub use layered::SessionKey;

/// Length of a session key (and of an X25519 shared secret).
pub const SESSION_KEY_LEN: usize = 32;

/// Length of the initialization vector prepended by each encryption
/// layer.
pub const IV_LEN: usize = 16;

/// The modulus size we require of identity keys, in bits.
///
/// This fixes the OAEP ciphertext length at
/// [`HANDSHAKE_LEN`](bawang_cell::HANDSHAKE_LEN) bytes.
pub const IDENTITY_KEY_BITS: usize = 4096;

/// The most encryption layers a relay body can carry.
///
/// Plaintext sizing reserves one IV per layer, so this caps the hop
/// count of any tunnel.
pub const MAX_LAYERS: usize = 8;

/// The fixed length of every relay sub-cell plaintext.
///
/// Forwarding hops cannot know how deep a tunnel is, so the plaintext
/// size cannot depend on it: every originator pads to the
/// [`MAX_LAYERS`]-layer worst case, and a fully layered body still
/// fits a cell exactly.
pub const RELAY_PLAINTEXT_LEN: usize = bawang_cell::CELL_BODY_LEN - MAX_LAYERS * IV_LEN;

/// OAEP label binding handshake ciphertexts to their purpose.
const OAEP_LABEL: &str = "dhshared";

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by a cryptographic operation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An RSA key could not be parsed as PKCS#1 or PKCS#8.
    #[error("unable to parse RSA identity key")]
    KeyParse,
    /// An identity key does not have [`IDENTITY_KEY_BITS`] bits.
    #[error("identity key has wrong size; need {IDENTITY_KEY_BITS}-bit RSA")]
    KeyLength,
    /// A handshake ciphertext could not be unwrapped, or did not
    /// contain a well-formed X25519 key.
    ///
    /// Deliberately carries no detail: OAEP failure modes must stay
    /// indistinguishable to a sender.
    #[error("handshake failed")]
    HandshakeFailed,
    /// The peer's shared-secret hash does not match the secret we
    /// derived: either tampering, or a peer that never held the
    /// identity key it claimed.
    #[error("shared-secret hash mismatch")]
    HashMismatch,
    /// An encrypted relay body was shorter than one IV.
    #[error("ciphertext shorter than its IV")]
    TruncatedCiphertext,
}
