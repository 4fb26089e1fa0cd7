//! Codec for encoding/decoding frames
//!
//! Wire format: [kind: u8][length: u32 big-endian][body: length bytes]

use crate::frame::{Frame, MessageKind};
use crate::{HEADER_SIZE, MAX_BODY_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame body too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("Stream ended mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a single frame to bytes
    pub fn encode_frame(frame: &Frame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(frame.wire_len());
        put_frame(frame, &mut buf)?;
        Ok(buf.freeze())
    }
}

fn put_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
    if frame.body.len() > MAX_BODY_SIZE {
        return Err(CodecError::TooLarge {
            size: frame.body.len(),
            max: MAX_BODY_SIZE,
        });
    }

    dst.reserve(frame.wire_len());
    dst.put_u8(frame.kind.as_u8());
    dst.put_u32(frame.body.len() as u32);
    dst.put_slice(&frame.body);
    Ok(())
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(&item, dst)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(item, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    /// Returns Ok(Some(frame)) once a whole frame is buffered, Ok(None) if more
    /// data is needed. An oversized length is rejected as soon as the header is
    /// visible, before any body bytes are awaited.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let kind_byte = src[0];
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;

        if length > MAX_BODY_SIZE {
            return Err(CodecError::TooLarge {
                size: length,
                max: MAX_BODY_SIZE,
            });
        }

        let frame_len = HEADER_SIZE + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(length).freeze();

        // The frame is consumed either way so the stream stays aligned
        let kind = MessageKind::try_from(kind_byte).map_err(CodecError::UnknownKind)?;

        Ok(Some(Frame { kind, body }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}
