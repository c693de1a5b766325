//! Encoding and decoding of whole cells.
//!
//! A cell is addressed to a tunnel on a particular link and carries one
//! of four commands.  `CREATE`/`CREATED`/`DESTROY` cells have typed
//! bodies defined here; the body of a `RELAY` cell is opaque ciphertext
//! and is handed to the tunnel layer unparsed.

use crate::{
    CellCmd, Error, RawCell, Result, TunnelId, CELL_BODY_LEN, CELL_HEADER_LEN, CELL_LEN,
    HANDSHAKE_LEN,
};

use bytes::{Buf, BufMut};
use rand::{CryptoRng, RngCore};

/// The parsed header of a cell: who it is for, and what it is.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CellHeader {
    /// The link-local id of the tunnel this cell belongs to.
    pub tunnel_id: TunnelId,
    /// The cell command.
    pub cmd: CellCmd,
}

impl CellHeader {
    /// Parse a cell header from the first [`CELL_HEADER_LEN`] bytes of
    /// a cell.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CELL_HEADER_LEN {
            return Err(Error::InvalidMessage("truncated cell header"));
        }
        let mut r = buf;
        let tunnel_id = r.get_u32();
        let cmd: CellCmd = r.get_u8().into();
        Ok(CellHeader { tunnel_id, cmd })
    }
}

/// Trait implemented by anything that can serve as the typed body of a
/// cell.
pub trait CellMsg: Sized {
    /// Return the command for this message.
    fn cmd(&self) -> CellCmd;
    /// Append the body of this message (not including the cell header).
    fn encode_onto(&self, out: &mut Vec<u8>);
    /// Decode this message from a cell body, according to a command
    /// value.  Trailing padding must be ignored.
    fn decode(cmd: CellCmd, body: &[u8]) -> Result<Self>;
}

/// Open a new tunnel segment: carries the RSA-wrapped X25519 public key
/// of the initiator.
#[derive(Debug, Clone)]
pub struct Create {
    /// OAEP ciphertext of the initiator's ephemeral X25519 public key.
    pub handshake: Box<[u8; HANDSHAKE_LEN]>,
}

/// The wire format version we speak in CREATE cells.
const CREATE_VERSION: u8 = 1;

impl CellMsg for Create {
    fn cmd(&self) -> CellCmd {
        CellCmd::CREATE
    }
    fn encode_onto(&self, out: &mut Vec<u8>) {
        out.put_u8(CREATE_VERSION);
        out.put_u16(0);
        out.put_slice(&self.handshake[..]);
    }
    fn decode(cmd: CellCmd, body: &[u8]) -> Result<Self> {
        if cmd != CellCmd::CREATE {
            return Err(Error::UnknownCmd(cmd.into()));
        }
        if body.len() < 3 + HANDSHAKE_LEN {
            return Err(Error::InvalidMessage("truncated CREATE body"));
        }
        let mut r = body;
        if r.get_u8() != CREATE_VERSION {
            return Err(Error::InvalidMessage("unsupported CREATE version"));
        }
        let _reserved = r.get_u16();
        let mut handshake = Box::new([0_u8; HANDSHAKE_LEN]);
        r.copy_to_slice(&mut handshake[..]);
        Ok(Create { handshake })
    }
}

/// Successful response to a CREATE cell: the responder's raw X25519
/// public key plus a hash proving it derived the same shared secret.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Created {
    /// The responder's ephemeral X25519 public key.
    pub dh_pub: [u8; 32],
    /// SHA-256 of the shared secret.
    pub key_hash: [u8; 32],
}

impl CellMsg for Created {
    fn cmd(&self) -> CellCmd {
        CellCmd::CREATED
    }
    fn encode_onto(&self, out: &mut Vec<u8>) {
        out.put_bytes(0, 3);
        out.put_slice(&self.dh_pub);
        out.put_slice(&self.key_hash);
    }
    fn decode(cmd: CellCmd, body: &[u8]) -> Result<Self> {
        if cmd != CellCmd::CREATED {
            return Err(Error::UnknownCmd(cmd.into()));
        }
        if body.len() < 3 + 32 + 32 {
            return Err(Error::InvalidMessage("truncated CREATED body"));
        }
        let mut r = body;
        r.advance(3);
        let mut dh_pub = [0_u8; 32];
        r.copy_to_slice(&mut dh_pub);
        let mut key_hash = [0_u8; 32];
        r.copy_to_slice(&mut key_hash);
        Ok(Created { dh_pub, key_hash })
    }
}

/// Tear down the tunnel on this link.  The body is all zeroes.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Destroy;

impl CellMsg for Destroy {
    fn cmd(&self) -> CellCmd {
        CellCmd::DESTROY
    }
    fn encode_onto(&self, out: &mut Vec<u8>) {
        out.put_bytes(0, CELL_BODY_LEN);
    }
    fn decode(cmd: CellCmd, _body: &[u8]) -> Result<Self> {
        if cmd != CellCmd::DESTROY {
            return Err(Error::UnknownCmd(cmd.into()));
        }
        Ok(Destroy)
    }
}

/// A decoded cell of unrestricted type.
#[derive(Clone)]
#[non_exhaustive]
pub enum AnyCellMsg {
    /// Open a new tunnel segment.
    Create(Create),
    /// Response to a CREATE.
    Created(Created),
    /// Tear down a tunnel.
    Destroy(Destroy),
}

impl CellMsg for AnyCellMsg {
    fn cmd(&self) -> CellCmd {
        match self {
            AnyCellMsg::Create(m) => m.cmd(),
            AnyCellMsg::Created(m) => m.cmd(),
            AnyCellMsg::Destroy(m) => m.cmd(),
        }
    }
    fn encode_onto(&self, out: &mut Vec<u8>) {
        match self {
            AnyCellMsg::Create(m) => m.encode_onto(out),
            AnyCellMsg::Created(m) => m.encode_onto(out),
            AnyCellMsg::Destroy(m) => m.encode_onto(out),
        }
    }
    fn decode(cmd: CellCmd, body: &[u8]) -> Result<Self> {
        match cmd {
            CellCmd::CREATE => Ok(AnyCellMsg::Create(Create::decode(cmd, body)?)),
            CellCmd::CREATED => Ok(AnyCellMsg::Created(Created::decode(cmd, body)?)),
            CellCmd::DESTROY => Ok(AnyCellMsg::Destroy(Destroy::decode(cmd, body)?)),
            _ => Err(Error::UnknownCmd(cmd.into())),
        }
    }
}

/// Encode one typed cell.  The unused tail of the body is filled with
/// random bytes, and the result is always exactly [`CELL_LEN`] bytes.
pub fn pack_cell<R: RngCore + CryptoRng, M: CellMsg>(
    tunnel_id: TunnelId,
    msg: &M,
    rng: &mut R,
) -> Result<RawCell> {
    let mut body = Vec::with_capacity(CELL_BODY_LEN);
    msg.encode_onto(&mut body);
    pack_cell_raw(tunnel_id, msg.cmd(), &body, rng)
}

/// Encode one `RELAY` cell around a pre-encrypted relay body.
pub fn pack_relay_cell<R: RngCore + CryptoRng>(
    tunnel_id: TunnelId,
    enc_body: &[u8],
    rng: &mut R,
) -> Result<RawCell> {
    pack_cell_raw(tunnel_id, CellCmd::RELAY, enc_body, rng)
}

/// Shared tail of cell packing: header, body, random padding.
fn pack_cell_raw<R: RngCore + CryptoRng>(
    tunnel_id: TunnelId,
    cmd: CellCmd,
    body: &[u8],
    rng: &mut R,
) -> Result<RawCell> {
    if body.len() > CELL_BODY_LEN {
        return Err(Error::BufferTooSmall);
    }
    let mut cell = [0_u8; CELL_LEN];
    {
        let mut w = &mut cell[..];
        w.put_u32(tunnel_id);
        w.put_u8(cmd.into());
        w.put_slice(body);
    }
    rng.fill_bytes(&mut cell[CELL_HEADER_LEN + body.len()..]);
    Ok(cell)
}
