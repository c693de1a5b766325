//! The tunnel-extension handshake.
//!
//! The initiator generates an ephemeral X25519 keypair and sends the
//! public half wrapped under the responder's RSA identity key.  The
//! responder unwraps it, generates its own ephemeral keypair, and
//! answers with its raw public key plus SHA-256 of the shared secret.
//! Verifying that hash authenticates the responder (only the identity
//! key holder could unwrap the initiator's key) and detects tampering
//! on either public key.

use crate::{layered::SessionKey, Error, IdentityKeypair, IdentityPublic, Result};

use bawang_cell::HANDSHAKE_LEN;
use rand::{CryptoRng, RngCore};
use x25519_dalek::{EphemeralSecret, PublicKey};

/// The initiator's half-open handshake: keeps the ephemeral secret
/// alive until the responder's answer arrives.
pub struct HandshakeState {
    /// Our ephemeral X25519 secret.
    secret: EphemeralSecret,
}

/// Begin a handshake toward the holder of `identity`.
///
/// Returns the state to finish the handshake with, and the wrapped
/// public key to put in a `CREATE` cell or `EXTEND` sub-cell.
pub fn start_handshake<R: RngCore + CryptoRng>(
    identity: &IdentityPublic,
    rng: &mut R,
) -> Result<(HandshakeState, Box<[u8; HANDSHAKE_LEN]>)> {
    let secret = EphemeralSecret::random_from_rng(&mut *rng);
    let public = PublicKey::from(&secret);
    let wrapped = identity.wrap_handshake(public.as_bytes(), rng)?;
    Ok((HandshakeState { secret }, wrapped))
}

impl HandshakeState {
    /// Finish the handshake with the responder's public key and
    /// shared-secret hash, as carried in `CREATED` or `EXTENDED`.
    ///
    /// Fails with [`Error::HashMismatch`] unless the hash proves the
    /// responder derived the same secret.
    pub fn complete(self, peer_pub: &[u8; 32], key_hash: &[u8; 32]) -> Result<SessionKey> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_pub));
        let key = SessionKey::from_bytes(*shared.as_bytes());
        if &key.confirmation_hash() != key_hash {
            return Err(Error::HashMismatch);
        }
        Ok(key)
    }
}

/// The responder's answer to a handshake: the session key to keep, and
/// the two fields to send back.
pub struct HandshakeReply {
    /// The derived session key.
    pub key: SessionKey,
    /// Our ephemeral X25519 public key, sent back raw.
    pub dh_pub: [u8; 32],
    /// SHA-256 of the shared secret.
    pub key_hash: [u8; 32],
}

/// Respond to a handshake ciphertext addressed to `identity`.
pub fn respond_handshake<R: RngCore + CryptoRng>(
    identity: &IdentityKeypair,
    wrapped: &[u8; HANDSHAKE_LEN],
    rng: &mut R,
) -> Result<HandshakeReply> {
    let peer_pub = PublicKey::from(identity.unwrap_handshake(wrapped)?);
    let secret = EphemeralSecret::random_from_rng(rng);
    let dh_pub = *PublicKey::from(&secret).as_bytes();
    let shared = secret.diffie_hellman(&peer_pub);
    let key = SessionKey::from_bytes(*shared.as_bytes());
    let key_hash = key.confirmation_hash();
    Ok(HandshakeReply {
        key,
        dh_pub,
        key_hash,
    })
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn identity() -> IdentityKeypair {
        IdentityKeypair::from_pem(include_str!("../testdata/identity.pem")).unwrap()
    }

    #[test]
    fn handshake_roundtrip() {
        let mut rng = rand::rngs::OsRng;
        let responder = identity();

        let (state, wrapped) = start_handshake(responder.public(), &mut rng).unwrap();
        let reply = respond_handshake(&responder, &wrapped, &mut rng).unwrap();
        let initiator_key = state.complete(&reply.dh_pub, &reply.key_hash).unwrap();

        assert_eq!(
            initiator_key.confirmation_hash(),
            reply.key.confirmation_hash()
        );
    }

    #[test]
    fn bad_hash_is_rejected() {
        let mut rng = rand::rngs::OsRng;
        let responder = identity();

        let (state, wrapped) = start_handshake(responder.public(), &mut rng).unwrap();
        let reply = respond_handshake(&responder, &wrapped, &mut rng).unwrap();
        let mut bad_hash = reply.key_hash;
        bad_hash[0] ^= 1;
        assert!(matches!(
            state.complete(&reply.dh_pub, &bad_hash),
            Err(Error::HashMismatch)
        ));
    }

    #[test]
    fn corrupt_wrapped_key_fails() {
        let mut rng = rand::rngs::OsRng;
        let responder = identity();

        let (_state, mut wrapped) = start_handshake(responder.public(), &mut rng).unwrap();
        wrapped[0] ^= 1;
        assert!(respond_handshake(&responder, &wrapped, &mut rng).is_err());
    }
}
