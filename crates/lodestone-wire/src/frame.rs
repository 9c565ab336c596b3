//! Message framing for wire transmission.
//!
//! ```text
//! +----------+----------+------------------+
//! | Magic(4) | Len(4)   | Payload(Len)     |
//! +----------+----------+------------------+
//! ```
//!
//! The payload is the postcard encoding of the message enum. Both header
//! integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::{WireError, WireResult};

/// Magic number prefixing every frame.
pub const FRAME_MAGIC: u32 = 0x4C44_5354; // "LDST"

/// Maximum payload size (16 MB); bounds allocations on decode.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 4 + 4; // magic + len

/// Encodes a message into a frame.
pub fn encode<M: Serialize>(message: &M) -> WireResult<Bytes> {
    let payload = postcard::to_allocvec(message)?;

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(FRAME_MAGIC);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Decodes a complete frame into a message.
pub fn decode<M: DeserializeOwned>(mut data: Bytes) -> WireResult<M> {
    if data.len() < HEADER_SIZE {
        return Err(WireError::Truncated {
            need: HEADER_SIZE,
            have: data.len(),
        });
    }

    let magic = data.get_u32();
    if magic != FRAME_MAGIC {
        return Err(WireError::InvalidMagic(magic));
    }

    let len = data.get_u32() as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    if data.len() < len {
        return Err(WireError::Truncated {
            need: len,
            have: data.len(),
        });
    }

    let message = postcard::from_bytes(&data.slice(..len))?;
    Ok(message)
}

/// Checks whether a buffer holds a complete frame.
///
/// Returns the total frame size if complete, `None` if more data is needed.
pub fn frame_size(data: &[u8]) -> WireResult<Option<usize>> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if magic != FRAME_MAGIC {
        return Err(WireError::InvalidMagic(magic));
    }

    let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let total = HEADER_SIZE + len;
    Ok(if data.len() >= total {
        Some(total)
    } else {
        None
    })
}
