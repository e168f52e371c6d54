//! Length-prefixed frame codec.
//!
//! Layout on the stream:
//!
//! ```text
//! +------------------------+------------------+
//! | length (4 bytes, BE)   | JSON frame       |
//! +------------------------+------------------+
//! ```
//!
//! The length is validated against [`MAX_FRAME_SIZE`] before any
//! allocation. A malformed payload is a hard error: the session owning the
//! stream is torn down, other sessions are unaffected.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;

/// Upper bound for a single frame. Request bodies are fully buffered by
/// ingress, so this also caps tunneled request size.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec for [`tokio_util::codec::Framed`] over the tunnel stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut len_bytes = [0u8; HEADER_LEN];
        len_bytes.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        let frame = serde_json::from_slice(&payload)?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(&frame)?;
        if payload.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
