//! Per-hop session keys and layered relay encryption.
//!
//! Each hop of a tunnel shares one 32-byte secret with the initiator,
//! used directly as an AES-256 key.  One *layer* of encryption is
//! CTR-mode with a fresh random IV, and the IV is prepended to the
//! output, so each layer grows the body by [`IV_LEN`] bytes and each
//! decryption shrinks it again.

use crate::{Error, Result, IV_LEN, SESSION_KEY_LEN};

use cipher::{KeyIvInit, StreamCipher};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// AES-256 in counter mode, as instantiated for relay layers.
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// The shared secret between a tunnel initiator and one hop.
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Construct a session key from raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        SessionKey(bytes)
    }

    /// Return SHA-256 of the secret, as exchanged during the handshake
    /// to prove both sides derived the same key.
    pub fn confirmation_hash(&self) -> [u8; 32] {
        Sha256::digest(self.0).into()
    }

    /// Add one encryption layer: generate a fresh IV, encrypt `body`,
    /// and return IV plus ciphertext.
    pub fn encrypt_layer<R: RngCore + CryptoRng>(&self, body: &[u8], rng: &mut R) -> Vec<u8> {
        let mut iv = [0_u8; IV_LEN];
        rng.fill_bytes(&mut iv);
        let mut out = Vec::with_capacity(IV_LEN + body.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(body);
        let mut cipher = Aes256Ctr::new((&self.0).into(), (&iv).into());
        cipher.apply_keystream(&mut out[IV_LEN..]);
        out
    }

    /// Remove one encryption layer: strip the IV and decrypt the rest.
    pub fn decrypt_layer(&self, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() < IV_LEN {
            return Err(Error::TruncatedCiphertext);
        }
        let (iv, ct) = body.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| Error::TruncatedCiphertext)?;
        let mut out = ct.to_vec();
        let mut cipher = Aes256Ctr::new((&self.0).into(), (&iv).into());
        cipher.apply_keystream(&mut out);
        Ok(out)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "SessionKey(..)")
    }
}

/// Encrypt `plaintext` once per key in `keys`, innermost layer first.
///
/// `keys` is in path order: the first element belongs to the first hop
/// and ends up as the outermost layer, which is the order the cell
/// travels.
pub fn encrypt_layers<'a, R, I>(keys: I, plaintext: &[u8], rng: &mut R) -> Vec<u8>
where
    R: RngCore + CryptoRng,
    I: IntoIterator<Item = &'a SessionKey>,
    I::IntoIter: DoubleEndedIterator,
{
    let mut body = plaintext.to_vec();
    for key in keys.into_iter().rev() {
        body = key.encrypt_layer(&body, rng);
    }
    body
}

/// Decrypt one layer per key in `keys`, in path order (first hop's
/// layer comes off first).  Used by tests and by handshake replies whose
/// expected depth is known; the tunnel receive path strips layers one at
/// a time so it can probe the digest after each.
pub fn decrypt_layers<'a, I>(keys: I, body: &[u8]) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a SessionKey>,
{
    let mut body = body.to_vec();
    for key in keys {
        body = key.decrypt_layer(&body)?;
    }
    Ok(body)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{MAX_LAYERS, RELAY_PLAINTEXT_LEN};
    use bawang_cell::relay::{pack_relay, unpack_relay, AnyRelayMsg, Data};
    use bawang_cell::CELL_BODY_LEN;

    fn key(tag: u8) -> SessionKey {
        SessionKey::from_bytes([tag; SESSION_KEY_LEN])
    }

    #[test]
    fn single_layer_roundtrip() {
        let k = key(1);
        let mut rng = rand::rngs::OsRng;
        let plain = b"forward secrecy not included".to_vec();
        let enc = k.encrypt_layer(&plain, &mut rng);
        assert_eq!(enc.len(), plain.len() + IV_LEN);
        assert_ne!(&enc[IV_LEN..], &plain[..]);
        assert_eq!(k.decrypt_layer(&enc).unwrap(), plain);
    }

    #[test]
    fn layering_grows_and_shrinks_by_iv() {
        let keys: Vec<_> = (0..MAX_LAYERS as u8).map(key).collect();
        let mut rng = rand::rngs::OsRng;
        let plain = vec![0xaa_u8; RELAY_PLAINTEXT_LEN];
        let enc = encrypt_layers(&keys, &plain, &mut rng);
        assert_eq!(enc.len(), CELL_BODY_LEN);
        assert_eq!(decrypt_layers(&keys, &enc).unwrap(), plain);
    }

    #[test]
    fn relay_roundtrip_every_depth() {
        // For every depth, an eight-byte payload packed and
        // onion-encrypted comes back out with a verifying digest.
        let mut rng = rand::rngs::OsRng;
        for n in 1..=MAX_LAYERS {
            let keys: Vec<_> = (0..n as u8).map(|i| key(i + 10)).collect();
            let msg = Data {
                body: b"01234567".to_vec(),
            };
            let packed = pack_relay(1, &msg, RELAY_PLAINTEXT_LEN, &mut rng).unwrap();
            let enc = encrypt_layers(&keys, &packed, &mut rng);
            assert_eq!(enc.len(), RELAY_PLAINTEXT_LEN + n * IV_LEN);
            assert!(enc.len() <= CELL_BODY_LEN);

            let plain = decrypt_layers(&keys, &enc).unwrap();
            let (hdr, parsed) = unpack_relay(&plain).unwrap().expect("digest must verify");
            assert_eq!(hdr.counter, 1);
            match parsed {
                AnyRelayMsg::Data(d) => assert_eq!(d.body, b"01234567"),
                _ => panic!("wrong message type"),
            }
        }
    }

    #[test]
    fn intermediate_layers_do_not_verify() {
        let mut rng = rand::rngs::OsRng;
        let keys: Vec<_> = (0..3).map(|i| key(i + 50)).collect();
        let msg = Data {
            body: b"inner".to_vec(),
        };
        let packed = pack_relay(9, &msg, RELAY_PLAINTEXT_LEN, &mut rng).unwrap();
        let enc = encrypt_layers(&keys, &packed, &mut rng);

        // After stripping only the first layer, the digest must not
        // verify: the sub-cell belongs to the innermost hop.
        let once = keys[0].decrypt_layer(&enc).unwrap();
        assert!(unpack_relay(&once).unwrap().is_none());
    }

    #[test]
    fn bit_flip_in_ciphertext_breaks_digest() {
        let mut rng = rand::rngs::OsRng;
        let keys: Vec<_> = (0..3).map(|i| key(i + 80)).collect();
        let msg = Data {
            body: b"integrity".to_vec(),
        };
        let packed = pack_relay(2, &msg, RELAY_PLAINTEXT_LEN, &mut rng).unwrap();
        let mut enc = encrypt_layers(&keys, &packed, &mut rng);
        enc[IV_LEN + 20] ^= 0x04;
        let plain = decrypt_layers(&keys, &enc).unwrap();
        assert!(unpack_relay(&plain).unwrap().is_none());
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let k = key(3);
        assert!(matches!(
            k.decrypt_layer(&[0_u8; IV_LEN - 1]),
            Err(Error::TruncatedCiphertext)
        ));
    }

    #[test]
    fn confirmation_hash_is_stable() {
        let a = key(7).confirmation_hash();
        let b = key(7).confirmation_hash();
        let c = key(8).confirmation_hash();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
