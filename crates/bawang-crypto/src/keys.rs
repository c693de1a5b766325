//! Long-term RSA identity keys.
//!
//! Every node holds one 4096-bit RSA keypair.  The public half travels
//! in PKCS#1 DER (inside RPS peer descriptions and API build requests)
//! and is what peers use to wrap handshake keys toward us.

use crate::{Error, Result, IDENTITY_KEY_BITS, OAEP_LABEL};

use bawang_cell::HANDSHAKE_LEN;
use rand::{CryptoRng, RngCore};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// A node's long-term identity keypair.
pub struct IdentityKeypair {
    /// The RSA private key.
    key: RsaPrivateKey,
    /// The corresponding public half, precomputed.
    public: IdentityPublic,
}

impl IdentityKeypair {
    /// Parse an identity keypair from PEM, accepting PKCS#1
    /// (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) encodings.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|_| Error::KeyParse)?;
        if key.size() * 8 != IDENTITY_KEY_BITS {
            return Err(Error::KeyLength);
        }
        let public = IdentityPublic::from_key(key.to_public_key())?;
        Ok(IdentityKeypair { key, public })
    }

    /// Return the public half of this keypair.
    pub fn public(&self) -> &IdentityPublic {
        &self.public
    }

    /// Unwrap a handshake ciphertext addressed to this identity,
    /// returning the 32 raw bytes inside.
    ///
    /// Any failure (wrong key, mangled ciphertext, wrong inner length)
    /// collapses into [`Error::HandshakeFailed`].
    pub(crate) fn unwrap_handshake(&self, ciphertext: &[u8; HANDSHAKE_LEN]) -> Result<[u8; 32]> {
        let padding = Oaep::new_with_label::<Sha256, _>(OAEP_LABEL);
        let plain = self
            .key
            .decrypt(padding, &ciphertext[..])
            .map_err(|_| Error::HandshakeFailed)?;
        let bytes: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| Error::HandshakeFailed)?;
        Ok(bytes)
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print private key material.
        f.debug_struct("IdentityKeypair").finish_non_exhaustive()
    }
}

/// The public half of a node's identity, as learned from RPS or from a
/// local client's build request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPublic {
    /// The RSA public key.
    key: RsaPublicKey,
    /// Cached PKCS#1 DER encoding; doubles as the equality witness.
    der: Vec<u8>,
}

impl IdentityPublic {
    /// Wrap an [`RsaPublicKey`], enforcing the modulus size.
    fn from_key(key: RsaPublicKey) -> Result<Self> {
        if key.size() * 8 != IDENTITY_KEY_BITS {
            return Err(Error::KeyLength);
        }
        let der = key
            .to_pkcs1_der()
            .map_err(|_| Error::KeyParse)?
            .as_bytes()
            .to_vec();
        Ok(IdentityPublic { key, der })
    }

    /// Parse an identity public key from PKCS#1 DER.
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self> {
        let key = RsaPublicKey::from_pkcs1_der(der).map_err(|_| Error::KeyParse)?;
        Self::from_key(key)
    }

    /// Return the PKCS#1 DER encoding of this key.
    pub fn to_pkcs1_der(&self) -> &[u8] {
        &self.der
    }

    /// Wrap 32 bytes of handshake key material under this identity,
    /// producing a fixed [`HANDSHAKE_LEN`]-byte ciphertext.
    pub(crate) fn wrap_handshake<R: RngCore + CryptoRng>(
        &self,
        material: &[u8; 32],
        rng: &mut R,
    ) -> Result<Box<[u8; HANDSHAKE_LEN]>> {
        let padding = Oaep::new_with_label::<Sha256, _>(OAEP_LABEL);
        let ct = self
            .key
            .encrypt(rng, padding, &material[..])
            .map_err(|_| Error::HandshakeFailed)?;
        let ct: Box<[u8; HANDSHAKE_LEN]> = ct
            .into_boxed_slice()
            .try_into()
            .map_err(|_| Error::HandshakeFailed)?;
        Ok(ct)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// A checked-in 4096-bit test identity (PKCS#1 PEM).
    pub(crate) const TEST_IDENTITY_PEM: &str = include_str!("../testdata/identity.pem");

    #[test]
    fn parse_pkcs1_pem() {
        let id = IdentityKeypair::from_pem(TEST_IDENTITY_PEM).unwrap();
        // A 4096-bit modulus plus DER overhead.
        assert!(id.public().to_pkcs1_der().len() > 512);
    }

    #[test]
    fn public_der_roundtrip() {
        let id = IdentityKeypair::from_pem(TEST_IDENTITY_PEM).unwrap();
        let der = id.public().to_pkcs1_der().to_vec();
        let parsed = IdentityPublic::from_pkcs1_der(&der).unwrap();
        assert_eq!(&parsed, id.public());
    }

    #[test]
    fn wrap_produces_fixed_length() {
        let id = IdentityKeypair::from_pem(TEST_IDENTITY_PEM).unwrap();
        let ct = id
            .public()
            .wrap_handshake(&[0x42; 32], &mut rand::rngs::OsRng)
            .unwrap();
        assert_eq!(ct.len(), HANDSHAKE_LEN);
        let plain = id.unwrap_handshake(&ct).unwrap();
        assert_eq!(plain, [0x42; 32]);
    }

    #[test]
    fn mangled_ciphertext_fails_closed() {
        let id = IdentityKeypair::from_pem(TEST_IDENTITY_PEM).unwrap();
        let mut ct = id
            .public()
            .wrap_handshake(&[7; 32], &mut rand::rngs::OsRng)
            .unwrap();
        ct[100] ^= 0xff;
        assert!(matches!(
            id.unwrap_handshake(&ct),
            Err(Error::HandshakeFailed)
        ));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(matches!(
            IdentityKeypair::from_pem("not a key"),
            Err(Error::KeyParse)
        ));
    }
}
