//! Length-prefixed framing.
//!
//! ```text
//! ┌────────────────────┬──────────────────────────┐
//! │ length (i32, BE)   │ payload (length bytes)   │
//! └────────────────────┴──────────────────────────┘
//! ```
//!
//! A declared length of zero or less, or above the configured maximum, means
//! the stream is corrupt.

use crate::buffer::ChannelBuffer;
use crate::channel::event::into_bytes;
use crate::channel::{ChannelEvent, ChannelHandlerContext, DownstreamHandler, MessageEvent};
use crate::codec::frame::Decoder;
use crate::error::{NetError, NetResult};

/// Size of the length header in bytes
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Default maximum payload size (1 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Decodes `[length][payload]` frames, yielding the payload.
#[derive(Debug, Clone, Copy)]
pub struct LengthFieldFrameDecoder {
    max_frame_length: usize,
}

impl LengthFieldFrameDecoder {
    pub fn new(max_frame_length: usize) -> NetResult<Self> {
        if max_frame_length == 0 || max_frame_length > i32::MAX as usize {
            return Err(NetError::invalid_option(
                "maxFrameLength",
                "must be between 1 and i32::MAX",
            ));
        }
        Ok(Self { max_frame_length })
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for LengthFieldFrameDecoder {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl Decoder for LengthFieldFrameDecoder {
    type Frame = ChannelBuffer;

    fn decode(&mut self, buffer: &mut ChannelBuffer) -> NetResult<Option<ChannelBuffer>> {
        if buffer.readable_bytes() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        // Peek, so a bad header leaves the buffer untouched
        let length = buffer.get_i32_at(buffer.reader_index())?;
        if length <= 0 {
            return Err(NetError::CorruptedStream(format!(
                "length must be positive: {}",
                length
            )));
        }
        let length = length as usize;
        if length > self.max_frame_length {
            return Err(NetError::CorruptedStream(format!(
                "length {} exceeds the maximum of {}",
                length, self.max_frame_length
            )));
        }

        if buffer.readable_bytes() < LENGTH_FIELD_SIZE + length {
            return Ok(None);
        }
        buffer.skip_bytes(LENGTH_FIELD_SIZE)?;
        buffer.read_bytes(length).map(Some)
    }
}

/// Prefixes every outbound byte message with its length.
///
/// Accepts the same message types the socket transport can write; anything
/// else passes through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthFieldPrepender;

impl LengthFieldPrepender {
    /// Builds a `[length][payload]` frame.
    ///
    /// The header is reserved first and patched once the payload is in place.
    pub fn encode(payload: &[u8]) -> NetResult<ChannelBuffer> {
        let length = i32::try_from(payload.len()).map_err(|_| {
            NetError::TooLongFrame(format!("payload of {} bytes", payload.len()))
        })?;
        let mut frame = ChannelBuffer::with_capacity(LENGTH_FIELD_SIZE + payload.len());
        let header = frame.writer_index();
        frame.write_i32(0);
        frame.write_bytes(payload);
        frame.set_i32(header, length)?;
        Ok(frame)
    }
}

impl DownstreamHandler for LengthFieldPrepender {
    fn handle_downstream(&self, ctx: &ChannelHandlerContext, event: ChannelEvent) -> NetResult<()> {
        let MessageEvent {
            channel,
            future,
            message,
            remote_address,
        } = match event {
            ChannelEvent::Message(e) => e,
            other => {
                ctx.send_downstream(other);
                return Ok(());
            }
        };
        let event = match into_bytes(message) {
            Ok(payload) => {
                let frame = Self::encode(&payload)?;
                MessageEvent::new(channel, future, Box::new(frame), remote_address)
            }
            Err(message) => MessageEvent::new(channel, future, message, remote_address),
        };
        ctx.send_downstream(event.into());
        Ok(())
    }
}
