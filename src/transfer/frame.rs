//! Binary frame codec.
//!
//! A frame is `<24 ascii hex id><payload>`. A frame carrying only the id
//! finishes that upload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::utils::error::TransferError;
use crate::utils::ids::ObjectId;

const ID_LEN: usize = ObjectId::HEX_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { id: ObjectId, payload: Bytes },
    Finish(ObjectId),
}

impl Frame {
    pub fn id(&self) -> ObjectId {
        match self {
            Frame::Data { id, .. } | Frame::Finish(id) => *id,
        }
    }
}

pub fn decode(raw: &Bytes, max_frame_size: usize) -> Result<Frame, TransferError> {
    if raw.len() < ID_LEN {
        return Err(TransferError::FrameTooShort(raw.len()));
    }
    if raw.len() > max_frame_size {
        return Err(TransferError::FrameTooLarge {
            len: raw.len(),
            max: max_frame_size,
        });
    }

    let id = ObjectId::from_hex(&raw[..ID_LEN])?;
    if raw.len() == ID_LEN {
        Ok(Frame::Finish(id))
    } else {
        Ok(Frame::Data {
            id,
            payload: raw.slice(ID_LEN..),
        })
    }
}

pub fn encode_data(id: ObjectId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ID_LEN + payload.len());
    buf.put_slice(&id.hex_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

pub fn encode_finish(id: ObjectId) -> Bytes {
    Bytes::copy_from_slice(&id.hex_bytes())
}
