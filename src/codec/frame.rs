//! Frame Decoding
//!
//! Socket reads arrive in arbitrary chunks. A [`FrameDecoder`] keeps the
//! bytes that have not formed a whole frame yet in a per-channel cumulation
//! buffer and runs a [`Decoder`] over them until no further frame can be
//! produced.
//!
//! ## The decode contract
//!
//! Every call to [`Decoder::decode`] must end in one of three ways:
//!
//! | Returns       | Reader index | Meaning                                |
//! |---------------|--------------|----------------------------------------|
//! | `None`        | unchanged    | need more data, stop until next read   |
//! | `None`        | advanced     | bytes were skipped, try again          |
//! | `Some(frame)` | advanced     | emit the frame, try again              |
//!
//! Returning a frame without consuming anything would loop forever, so it is
//! reported as an `IllegalState` error instead.

use crate::buffer::ChannelBuffer;
use crate::channel::{
    Channel, ChannelEvent, ChannelHandlerContext, MessageEvent, SimpleChannelHandler, StateEvent,
};
use crate::error::{NetError, NetResult};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::trace;

/// Turns bytes into frames.
pub trait Decoder: Send + 'static {
    type Frame: Any + Send;

    /// Tries to decode one frame from the readable bytes of `buffer`.
    fn decode(&mut self, buffer: &mut ChannelBuffer) -> NetResult<Option<Self::Frame>>;

    /// Called once on disconnect with whatever [`decode`](Self::decode) left
    /// behind, to salvage a trailing frame that has no terminator.
    fn decode_last(&mut self, buffer: &mut ChannelBuffer) -> NetResult<Option<Self::Frame>> {
        self.decode(buffer)
    }
}

/// Runs `decoder` over `buffer` until it needs more data, collecting frames.
///
/// Frames decoded before an error are still pushed to `frames`.
pub fn decode_frames<D: Decoder + ?Sized>(
    decoder: &mut D,
    buffer: &mut ChannelBuffer,
    frames: &mut Vec<D::Frame>,
) -> NetResult<()> {
    while buffer.is_readable() {
        let before = buffer.reader_index();
        match decoder.decode(buffer)? {
            None if buffer.reader_index() == before => break,
            None => continue,
            Some(_) if buffer.reader_index() == before => {
                return Err(NetError::IllegalState(
                    "decode() must read at least one byte if it returned a frame".to_string(),
                ));
            }
            Some(frame) => frames.push(frame),
        }
    }
    Ok(())
}

struct DecoderState<D> {
    decoder: D,
    cumulation: ChannelBuffer,
}

/// Pipeline handler that reassembles frames with a [`Decoder`].
///
/// The cumulation buffer belongs to one channel, so every pipeline needs its
/// own instance; never put a `FrameDecoder` in a shared template pipeline.
pub struct FrameDecoder<D: Decoder> {
    state: Mutex<DecoderState<D>>,
}

impl<D: Decoder> FrameDecoder<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            state: Mutex::new(DecoderState {
                decoder,
                cumulation: ChannelBuffer::new(),
            }),
        }
    }

    /// Bytes received but not yet turned into a frame.
    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().unwrap().cumulation.readable_bytes()
    }

    fn fire_frames(
        ctx: &ChannelHandlerContext,
        channel: &Channel,
        frames: Vec<D::Frame>,
        remote: Option<SocketAddr>,
    ) {
        for frame in frames {
            ctx.send_upstream(ChannelEvent::message(channel, frame, remote));
        }
    }

    /// Decodes what is left on disconnect, then forwards the state event.
    fn cleanup(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        let mut frames = Vec::new();
        let result = {
            let mut state = self.state.lock().unwrap();
            let DecoderState {
                decoder,
                cumulation,
            } = &mut *state;

            let mut result = Ok(());
            if cumulation.is_readable() {
                result = decode_frames(decoder, cumulation, &mut frames);
                if result.is_ok() && cumulation.is_readable() {
                    result = decoder
                        .decode_last(cumulation)
                        .map(|partial| frames.extend(partial));
                }
                if cumulation.is_readable() {
                    trace!(
                        channel = %e.channel.id(),
                        bytes = cumulation.readable_bytes(),
                        "Discarding undecoded bytes"
                    );
                }
            }
            cumulation.clear();
            result
        };

        Self::fire_frames(ctx, &e.channel, frames, None);
        ctx.send_upstream(e.into());
        result
    }
}

impl<D: Decoder> SimpleChannelHandler for FrameDecoder<D> {
    fn message_received(&self, ctx: &ChannelHandlerContext, e: MessageEvent) -> NetResult<()> {
        let MessageEvent {
            channel,
            future,
            message,
            remote_address,
        } = e;
        let mut input = match message.downcast::<ChannelBuffer>() {
            Ok(buffer) => *buffer,
            Err(message) => {
                ctx.send_upstream(MessageEvent::new(channel, future, message, remote_address).into());
                return Ok(());
            }
        };
        if !input.is_readable() {
            return Ok(());
        }

        let mut frames = Vec::new();
        let result = {
            let mut state = self.state.lock().unwrap();
            let DecoderState {
                decoder,
                cumulation,
            } = &mut *state;

            if cumulation.is_readable() {
                cumulation.discard_read_bytes();
                cumulation.write_buffer(&mut input);
                decode_frames(decoder, cumulation, &mut frames)
            } else {
                // Nothing buffered: decode straight from the chunk and keep
                // only the remainder
                let result = decode_frames(decoder, &mut input, &mut frames);
                if input.is_readable() {
                    cumulation.clear();
                    cumulation.write_buffer(&mut input);
                }
                result
            }
        };

        Self::fire_frames(ctx, &channel, frames, remote_address);
        result
    }

    fn channel_disconnected(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        self.cleanup(ctx, e)
    }

    fn channel_closed(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        self.cleanup(ctx, e)
    }
}
