//! UTF-8 string codec.
//!
//! Usually placed after a frame decoder, so each frame becomes one `String`:
//!
//! ```text
//! pipeline.add_last("framer",  FrameDecoder::new(DelimiterBasedFrameDecoder::lines(8192)?))
//! pipeline.add_last("decoder", StringDecoder)
//! pipeline.add_last("encoder", StringEncoder)
//! pipeline.add_last("handler", ...)
//! ```

use crate::buffer::ChannelBuffer;
use crate::channel::{
    ChannelEvent, ChannelHandlerContext, DownstreamHandler, MessageEvent, UpstreamHandler,
};
use crate::error::NetResult;

/// Turns inbound [`ChannelBuffer`] messages into `String`s.
///
/// Invalid UTF-8 sequences are replaced with U+FFFD.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringDecoder;

impl UpstreamHandler for StringDecoder {
    fn handle_upstream(&self, ctx: &ChannelHandlerContext, event: ChannelEvent) -> NetResult<()> {
        match event {
            ChannelEvent::Message(e) if e.message_ref::<ChannelBuffer>().is_some() => {
                let text = e
                    .message_ref::<ChannelBuffer>()
                    .map(ChannelBuffer::to_string_lossy)
                    .unwrap_or_default();
                ctx.send_upstream(e.with_message(text).into());
            }
            other => ctx.send_upstream(other),
        }
        Ok(())
    }
}

/// Turns outbound `String` and `&'static str` messages into
/// [`ChannelBuffer`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringEncoder;

impl DownstreamHandler for StringEncoder {
    fn handle_downstream(&self, ctx: &ChannelHandlerContext, event: ChannelEvent) -> NetResult<()> {
        let e = match event {
            ChannelEvent::Message(e) => e,
            other => {
                ctx.send_downstream(other);
                return Ok(());
            }
        };
        let buffer = match (e.message_ref::<String>(), e.message_ref::<&'static str>()) {
            (Some(text), _) => Some(ChannelBuffer::from(text.as_str())),
            (None, Some(text)) => Some(ChannelBuffer::from(*text)),
            (None, None) => None,
        };
        let e: MessageEvent = match buffer {
            Some(buffer) => e.with_message(buffer),
            None => e,
        };
        ctx.send_downstream(e.into());
        Ok(())
    }
}
