//! Fixed-length framing.

use crate::buffer::ChannelBuffer;
use crate::codec::frame::Decoder;
use crate::error::{NetError, NetResult};

/// Splits the stream into frames of exactly `frame_length` bytes.
#[derive(Debug, Clone, Copy)]
pub struct FixedLengthFrameDecoder {
    frame_length: usize,
}

impl FixedLengthFrameDecoder {
    pub fn new(frame_length: usize) -> NetResult<Self> {
        if frame_length == 0 {
            return Err(NetError::invalid_option(
                "frameLength",
                "must be a positive integer",
            ));
        }
        Ok(Self { frame_length })
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }
}

impl Decoder for FixedLengthFrameDecoder {
    type Frame = ChannelBuffer;

    fn decode(&mut self, buffer: &mut ChannelBuffer) -> NetResult<Option<ChannelBuffer>> {
        if buffer.readable_bytes() < self.frame_length {
            return Ok(None);
        }
        buffer.read_bytes(self.frame_length).map(Some)
    }
}
