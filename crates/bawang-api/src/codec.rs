//! Length-prefixed framing for the local service protocols.

use crate::{ApiMsg, ApiMsgType, Error, FRAME_HEADER_LEN, MAX_BODY_LEN};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec turning a byte stream into [`ApiMsg`]s and back.
///
/// Frame layout: `size:u16` (header included), `type:u16`, body.
#[derive(Debug, Default, Clone)]
pub struct ApiCodec;

impl Decoder for ApiCodec {
    type Item = ApiMsg;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ApiMsg>, Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let size = usize::from(u16::from_be_bytes([src[0], src[1]]));
        if size < FRAME_HEADER_LEN {
            return Err(Error::InvalidMessage("frame size below header size"));
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(size);
        frame.advance(2);
        let msg_type: ApiMsgType = frame.get_u16().into();
        let msg = ApiMsg::decode(msg_type, &frame)?;
        Ok(Some(msg))
    }
}

impl Encoder<ApiMsg> for ApiCodec {
    type Error = Error;

    fn encode(&mut self, msg: ApiMsg, dst: &mut BytesMut) -> Result<(), Error> {
        let mut body = Vec::new();
        msg.encode_onto(&mut body);
        if body.len() > MAX_BODY_LEN {
            return Err(Error::MessageTooLong);
        }
        dst.reserve(FRAME_HEADER_LEN + body.len());
        dst.put_u16((FRAME_HEADER_LEN + body.len()) as u16);
        dst.put_u16(msg.msg_type().into());
        dst.put_slice(&body);
        Ok(())
    }
}
