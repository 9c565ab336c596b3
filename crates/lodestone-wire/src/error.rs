//! Wire protocol error types.

use thiserror::Error;

/// Errors produced while framing or parsing protocol messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The frame did not start with the protocol magic.
    #[error("invalid frame magic: {0:#010x}")]
    InvalidMagic(u32),

    /// The frame header declared a payload larger than the allowed maximum.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// The buffer ended before the declared payload.
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// The payload was not a valid encoding of any protocol message.
    #[error("malformed payload: {0}")]
    Malformed(#[from] postcard::Error),
}
