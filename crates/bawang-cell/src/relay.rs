//! Encoding and decoding of relay sub-cells.
//!
//! Relay sub-cells travel inside the layer-encrypted body of `RELAY`
//! cells.  A hop that removes a layer of encryption learns whether the
//! sub-cell is addressed to it by recomputing the 8-byte digest in the
//! sub-cell header; a matching digest also authenticates the sub-cell to
//! that hop.  Counters in the header give replay protection: a receiver
//! only ever accepts strictly increasing values.

use crate::{Error, RelayCmd, Result, HANDSHAKE_LEN, RELAY_HEADER_LEN};

use bytes::{Buf, BufMut};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Largest value a relay counter can take: only 24 bits go on the wire.
pub const COUNTER_MAX: u32 = (1 << 24) - 1;

/// Number of bytes of the SHA-256 output used as the relay digest.
const DIGEST_LEN: usize = 8;

/// The parsed header of a relay sub-cell.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RelayHeader {
    /// Strictly increasing per-sender counter; 24 bits on the wire.
    pub counter: u32,
    /// The sub-cell command.
    pub cmd: RelayCmd,
    /// Total length of the sub-cell, header included.
    pub size: u16,
    /// First 8 bytes of SHA-256 over the sub-cell with this field
    /// zeroed.
    pub digest: u64,
}

impl RelayHeader {
    /// Parse a relay header from the first [`RELAY_HEADER_LEN`] bytes of
    /// a decrypted relay body.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RELAY_HEADER_LEN {
            return Err(Error::InvalidMessage("truncated relay header"));
        }
        let mut r = buf;
        let counter = read_u24(&mut r);
        let cmd: RelayCmd = r.get_u8().into();
        let size = r.get_u16();
        let _reserved = r.get_u8();
        let digest = r.get_u64();
        Ok(RelayHeader {
            counter,
            cmd,
            size,
            digest,
        })
    }

    /// Append this header to `out`.
    fn encode_onto(&self, out: &mut Vec<u8>) {
        put_u24(out, self.counter);
        out.put_u8(self.cmd.into());
        out.put_u16(self.size);
        out.put_u8(0);
        out.put_u64(self.digest);
    }
}

/// Read a big-endian 24-bit integer.
fn read_u24(r: &mut &[u8]) -> u32 {
    let hi = u32::from(r.get_u8());
    let lo = u32::from(r.get_u16());
    (hi << 16) | lo
}

/// Write a big-endian 24-bit integer; values above [`COUNTER_MAX`] are
/// truncated, which callers prevent via [`RelayCounter`].
fn put_u24(out: &mut Vec<u8>, v: u32) {
    out.put_u8((v >> 16) as u8);
    out.put_u16((v & 0xffff) as u16);
}

/// The sending side of a relay counter.
///
/// The stored value is 24 bits effective; when it runs out the tunnel
/// has to be rebuilt, so [`RelayCounter::next`] refuses to wrap.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayCounter(u32);

impl RelayCounter {
    /// Return a counter that has issued no values yet.
    pub fn new() -> Self {
        RelayCounter(0)
    }

    /// Return the next counter value, and advance.
    pub fn next(&mut self) -> Result<u32> {
        if self.0 >= COUNTER_MAX {
            return Err(Error::CounterExhausted);
        }
        self.0 += 1;
        Ok(self.0)
    }
}

/// The receiving side of a relay counter: accepts strictly increasing
/// values only.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterCheck(u32);

impl CounterCheck {
    /// Return a checker that has seen no values yet.
    pub fn new() -> Self {
        CounterCheck(0)
    }

    /// Accept `counter` if it is strictly greater than everything seen
    /// before; a replay or regression is fatal for the tunnel.
    pub fn accept(&mut self, counter: u32) -> Result<()> {
        if counter <= self.0 {
            return Err(Error::CounterRegression);
        }
        self.0 = counter;
        Ok(())
    }
}

/// Trait implemented by anything that can serve as a relay sub-cell
/// body.
pub trait RelayMsg: Sized {
    /// Return the command for this message.
    fn cmd(&self) -> RelayCmd;
    /// Append the body of this message (not including the relay header).
    fn encode_onto(&self, out: &mut Vec<u8>);
    /// Decode this message from the body of a digest-verified sub-cell.
    fn decode(cmd: RelayCmd, body: &[u8]) -> Result<Self>;
}

/// Ask the final hop of a tunnel to extend it to a new peer.
#[derive(Clone)]
pub struct Extend {
    /// Address of the peer to extend to.
    pub addr: IpAddr,
    /// Onion port of the peer to extend to.
    pub port: u16,
    /// OAEP ciphertext of the initiator's fresh X25519 public key,
    /// wrapped under the new peer's identity key.
    pub handshake: Box<[u8; HANDSHAKE_LEN]>,
}

/// Flag bit marking an IPv6 address in EXTEND and BUILD-style bodies.
const FLAG_IPV6: u16 = 1;

impl RelayMsg for Extend {
    fn cmd(&self) -> RelayCmd {
        RelayCmd::EXTEND
    }
    fn encode_onto(&self, out: &mut Vec<u8>) {
        match self.addr {
            IpAddr::V4(v4) => {
                out.put_u16(0);
                out.put_u16(self.port);
                out.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.put_u16(FLAG_IPV6);
                out.put_u16(self.port);
                out.put_slice(&v6.octets());
            }
        }
        out.put_slice(&self.handshake[..]);
    }
    fn decode(cmd: RelayCmd, body: &[u8]) -> Result<Self> {
        if cmd != RelayCmd::EXTEND {
            return Err(Error::UnknownCmd(cmd.into()));
        }
        if body.len() < 4 {
            return Err(Error::InvalidMessage("truncated EXTEND body"));
        }
        let mut r = body;
        let flags = r.get_u16();
        let port = r.get_u16();
        let addr: IpAddr = if flags & FLAG_IPV6 != 0 {
            if r.remaining() < 16 + HANDSHAKE_LEN {
                return Err(Error::InvalidMessage("truncated EXTEND body"));
            }
            let mut octets = [0_u8; 16];
            r.copy_to_slice(&mut octets);
            octets.into()
        } else {
            if r.remaining() < 4 + HANDSHAKE_LEN {
                return Err(Error::InvalidMessage("truncated EXTEND body"));
            }
            let mut octets = [0_u8; 4];
            r.copy_to_slice(&mut octets);
            octets.into()
        };
        let mut handshake = Box::new([0_u8; HANDSHAKE_LEN]);
        r.copy_to_slice(&mut handshake[..]);
        Ok(Extend {
            addr,
            port,
            handshake,
        })
    }
}

/// Successful response to an EXTEND sub-cell, relayed back from the new
/// hop.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Extended {
    /// The new hop's ephemeral X25519 public key.
    pub dh_pub: [u8; 32],
    /// SHA-256 of the shared secret derived by the new hop.
    pub key_hash: [u8; 32],
}

impl RelayMsg for Extended {
    fn cmd(&self) -> RelayCmd {
        RelayCmd::EXTENDED
    }
    fn encode_onto(&self, out: &mut Vec<u8>) {
        out.put_slice(&self.dh_pub);
        out.put_slice(&self.key_hash);
    }
    fn decode(cmd: RelayCmd, body: &[u8]) -> Result<Self> {
        if cmd != RelayCmd::EXTENDED {
            return Err(Error::UnknownCmd(cmd.into()));
        }
        if body.len() < 64 {
            return Err(Error::InvalidMessage("truncated EXTENDED body"));
        }
        let mut r = body;
        let mut dh_pub = [0_u8; 32];
        r.copy_to_slice(&mut dh_pub);
        let mut key_hash = [0_u8; 32];
        r.copy_to_slice(&mut key_hash);
        Ok(Extended { dh_pub, key_hash })
    }
}

/// Application payload for the tunnel's endpoints.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Data {
    /// The payload bytes.
    pub body: Vec<u8>,
}

impl RelayMsg for Data {
    fn cmd(&self) -> RelayCmd {
        RelayCmd::DATA
    }
    fn encode_onto(&self, out: &mut Vec<u8>) {
        out.put_slice(&self.body);
    }
    fn decode(cmd: RelayCmd, body: &[u8]) -> Result<Self> {
        if cmd != RelayCmd::DATA {
            return Err(Error::UnknownCmd(cmd.into()));
        }
        Ok(Data {
            body: body.to_vec(),
        })
    }
}

/// Cover traffic.  A ping is echoed back as a pong by the receiving
/// endpoint; a pong is dropped.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Cover {
    /// True for a ping, false for the answering pong.
    pub ping: bool,
}

/// Flag bit marking a COVER sub-cell as a ping.
const FLAG_PING: u16 = 1;

impl RelayMsg for Cover {
    fn cmd(&self) -> RelayCmd {
        RelayCmd::COVER
    }
    fn encode_onto(&self, out: &mut Vec<u8>) {
        out.put_u16(if self.ping { FLAG_PING } else { 0 });
        out.put_u16(0);
    }
    fn decode(cmd: RelayCmd, body: &[u8]) -> Result<Self> {
        if cmd != RelayCmd::COVER {
            return Err(Error::UnknownCmd(cmd.into()));
        }
        if body.len() < 4 {
            return Err(Error::InvalidMessage("truncated COVER body"));
        }
        let mut r = body;
        let flags = r.get_u16();
        Ok(Cover {
            ping: flags & FLAG_PING != 0,
        })
    }
}

/// A decoded relay sub-cell of unrestricted type.
#[derive(Clone)]
#[non_exhaustive]
pub enum AnyRelayMsg {
    /// Extend the tunnel by one hop.
    Extend(Extend),
    /// Response to an EXTEND.
    Extended(Extended),
    /// Application payload.
    Data(Data),
    /// Cover traffic.
    Cover(Cover),
}

impl RelayMsg for AnyRelayMsg {
    fn cmd(&self) -> RelayCmd {
        match self {
            AnyRelayMsg::Extend(m) => m.cmd(),
            AnyRelayMsg::Extended(m) => m.cmd(),
            AnyRelayMsg::Data(m) => m.cmd(),
            AnyRelayMsg::Cover(m) => m.cmd(),
        }
    }
    fn encode_onto(&self, out: &mut Vec<u8>) {
        match self {
            AnyRelayMsg::Extend(m) => m.encode_onto(out),
            AnyRelayMsg::Extended(m) => m.encode_onto(out),
            AnyRelayMsg::Data(m) => m.encode_onto(out),
            AnyRelayMsg::Cover(m) => m.encode_onto(out),
        }
    }
    fn decode(cmd: RelayCmd, body: &[u8]) -> Result<Self> {
        match cmd {
            RelayCmd::EXTEND => Ok(AnyRelayMsg::Extend(Extend::decode(cmd, body)?)),
            RelayCmd::EXTENDED => Ok(AnyRelayMsg::Extended(Extended::decode(cmd, body)?)),
            RelayCmd::DATA => Ok(AnyRelayMsg::Data(Data::decode(cmd, body)?)),
            RelayCmd::COVER => Ok(AnyRelayMsg::Cover(Cover::decode(cmd, body)?)),
            _ => Err(Error::UnknownCmd(cmd.into())),
        }
    }
}

/// Pack one relay sub-cell into a plaintext buffer of exactly
/// `plaintext_len` bytes, padding the tail with random data and filling
/// in the digest.
///
/// `plaintext_len` is chosen by the caller so that the buffer, grown by
/// one IV per encryption layer, exactly fills a cell body.
pub fn pack_relay<R: RngCore + CryptoRng, M: RelayMsg>(
    counter: u32,
    msg: &M,
    plaintext_len: usize,
    rng: &mut R,
) -> Result<Vec<u8>> {
    if counter > COUNTER_MAX {
        return Err(Error::CounterExhausted);
    }
    let mut out = Vec::with_capacity(plaintext_len);
    RelayHeader {
        counter,
        cmd: msg.cmd(),
        size: 0,
        digest: 0,
    }
    .encode_onto(&mut out);
    msg.encode_onto(&mut out);
    let size = out.len();
    if size > plaintext_len || size > usize::from(u16::MAX) {
        return Err(Error::BufferTooSmall);
    }
    out[4..6].copy_from_slice(&(size as u16).to_be_bytes());
    let digest = relay_digest(&out[..size]);
    out[7..15].copy_from_slice(&digest.to_be_bytes());
    out.resize(plaintext_len, 0);
    rng.fill_bytes(&mut out[size..]);
    Ok(out)
}

/// Try to decode a decrypted relay body as a sub-cell addressed to this
/// hop.
///
/// Returns `Ok(None)` when the digest does not verify: the bytes are
/// either another hop's layer or garbage, and the caller decides whether
/// to forward or to keep stripping layers.  Returns an error only for a
/// sub-cell that *did* verify but is malformed, which a conformant
/// sender never produces.
pub fn unpack_relay(buf: &[u8]) -> Result<Option<(RelayHeader, AnyRelayMsg)>> {
    if buf.len() < RELAY_HEADER_LEN {
        return Err(Error::InvalidMessage("relay body shorter than header"));
    }
    let header = RelayHeader::decode(buf)?;
    let size = usize::from(header.size);
    if size < RELAY_HEADER_LEN || size > buf.len() {
        return Ok(None);
    }
    if relay_digest_parts(buf, size) != header.digest {
        return Ok(None);
    }
    let msg = AnyRelayMsg::decode(header.cmd, &buf[RELAY_HEADER_LEN..size])?;
    Ok(Some((header, msg)))
}

/// Compute the relay digest of a sub-cell whose digest field is already
/// zero.
fn relay_digest(buf: &[u8]) -> u64 {
    let mut h = Sha256::new();
    h.update(buf);
    first_eight(&h.finalize())
}

/// Compute the relay digest of a sub-cell in place, treating its digest
/// field as zero.
fn relay_digest_parts(buf: &[u8], size: usize) -> u64 {
    let mut h = Sha256::new();
    h.update(&buf[..RELAY_HEADER_LEN - DIGEST_LEN]);
    h.update([0_u8; DIGEST_LEN]);
    h.update(&buf[RELAY_HEADER_LEN..size]);
    first_eight(&h.finalize())
}

/// Interpret the first eight bytes of a hash as a big-endian integer.
fn first_eight(digest: &[u8]) -> u64 {
    let mut b = [0_u8; DIGEST_LEN];
    b.copy_from_slice(&digest[..DIGEST_LEN]);
    u64::from_be_bytes(b)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn rng() -> impl RngCore + CryptoRng {
        rand::rngs::OsRng
    }

    /// Plaintext length for a three-layer tunnel.
    const PLEN: usize = crate::CELL_BODY_LEN - 3 * 16;

    #[test]
    fn data_roundtrip() {
        let msg = Data {
            body: b"hello".to_vec(),
        };
        let buf = pack_relay(1, &msg, PLEN, &mut rng()).unwrap();
        assert_eq!(buf.len(), PLEN);
        let (hdr, parsed) = unpack_relay(&buf).unwrap().expect("digest should verify");
        assert_eq!(hdr.counter, 1);
        assert_eq!(hdr.cmd, RelayCmd::DATA);
        assert_eq!(usize::from(hdr.size), RELAY_HEADER_LEN + 5);
        match parsed {
            AnyRelayMsg::Data(d) => assert_eq!(d.body, b"hello"),
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn extend_roundtrip_v4_and_v6() {
        for addr in [
            IpAddr::from([127, 0, 0, 1]),
            IpAddr::from([0, 0, 0, 0, 0, 0, 0, 1]),
        ] {
            let msg = Extend {
                addr,
                port: 4433,
                handshake: Box::new([0x5a_u8; HANDSHAKE_LEN]),
            };
            let buf = pack_relay(7, &msg, crate::CELL_BODY_LEN - 16, &mut rng()).unwrap();
            let (_, parsed) = unpack_relay(&buf).unwrap().unwrap();
            match parsed {
                AnyRelayMsg::Extend(e) => {
                    assert_eq!(e.addr, addr);
                    assert_eq!(e.port, 4433);
                    assert_eq!(&e.handshake[..], &[0x5a_u8; HANDSHAKE_LEN][..]);
                }
                _ => panic!("wrong message type"),
            }
        }
    }

    #[test]
    fn cover_roundtrip() {
        for ping in [true, false] {
            let buf = pack_relay(2, &Cover { ping }, PLEN, &mut rng()).unwrap();
            let (_, parsed) = unpack_relay(&buf).unwrap().unwrap();
            match parsed {
                AnyRelayMsg::Cover(c) => assert_eq!(c.ping, ping),
                _ => panic!("wrong message type"),
            }
        }
    }

    #[test]
    fn digest_detects_bit_flips() {
        let msg = Data {
            body: b"sensitive".to_vec(),
        };
        let buf = pack_relay(3, &msg, PLEN, &mut rng()).unwrap();
        let size = usize::from(RelayHeader::decode(&buf).unwrap().size);
        for bit in 0..8 {
            for pos in [0, 5, RELAY_HEADER_LEN, size - 1] {
                let mut copy = buf.clone();
                copy[pos] ^= 1 << bit;
                assert!(
                    unpack_relay(&copy).unwrap().is_none(),
                    "flip at byte {pos} bit {bit} still verified"
                );
            }
        }
    }

    #[test]
    fn padding_is_ignored() {
        let msg = Data { body: vec![1; 10] };
        let a = pack_relay(4, &msg, PLEN, &mut rng()).unwrap();
        let b = pack_relay(4, &msg, PLEN, &mut rng()).unwrap();
        // Same message, different random padding, both verify.
        assert_ne!(a, b);
        assert!(unpack_relay(&a).unwrap().is_some());
        assert!(unpack_relay(&b).unwrap().is_some());
    }

    #[test]
    fn counter_refuses_to_wrap() {
        let mut c = RelayCounter(COUNTER_MAX - 1);
        assert_eq!(c.next().unwrap(), COUNTER_MAX);
        assert_eq!(c.next().unwrap_err(), Error::CounterExhausted);
    }

    #[test]
    fn counter_check_requires_strict_increase() {
        let mut chk = CounterCheck::new();
        chk.accept(1).unwrap();
        chk.accept(5).unwrap();
        assert_eq!(chk.accept(5).unwrap_err(), Error::CounterRegression);
        assert_eq!(chk.accept(4).unwrap_err(), Error::CounterRegression);
        chk.accept(6).unwrap();
    }

    #[test]
    fn garbage_does_not_verify() {
        let mut buf = vec![0_u8; PLEN];
        rng().fill_bytes(&mut buf);
        // Either an unverified digest or (absurdly unlikely) a verified
        // random sub-cell; never a panic.
        let _ = unpack_relay(&buf);
    }
}
