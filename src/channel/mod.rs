//! Channel Module
//!
//! The event model at the heart of netpipe. A [`Channel`] owns a
//! [`ChannelPipeline`] of handlers; everything that happens to the channel
//! is a [`ChannelEvent`] flowing through that pipeline, and every operation
//! on it returns a [`ChannelFuture`].
//!
//! ## Event Flow
//!
//! ```text
//!   ┌──────────────┐  upstream   ┌───────────────────┐  downstream  ┌─────────────┐
//!   │   Worker     │ ──────────> │  ChannelPipeline  │ ───────────> │ ChannelSink │
//!   │ (socket I/O) │             │ handler, handler… │              │ (transport) │
//!   └──────────────┘             └───────────────────┘              └─────────────┘
//!          ▲                             ▲   │ ctx.send_*                 │
//!          │                             │   ▼                            │
//!          │                        application code                      │
//!          └────────────────────── tasks (write, close, …) ───────────────┘
//! ```

#[allow(clippy::module_inception)]
pub mod channel;
pub mod config;
pub mod event;
pub mod future;
pub mod handler;
pub mod pipeline;
pub mod sink;

// Re-export commonly used types
pub use channel::{
    Channel, ChannelId, ChannelIdGenerator, WeakChannel, OP_NONE, OP_READ, OP_READ_WRITE,
    OP_WRITE,
};
pub use config::{ChannelConfig, OptionValue};
pub use event::{
    ChannelEvent, ChannelState, ChildChannelStateEvent, ExceptionEvent, Message, MessageEvent,
    StateChange, StateEvent,
};
pub use future::ChannelFuture;
pub use handler::{ChannelHandler, DownstreamHandler, SimpleChannelHandler, UpstreamHandler};
pub use pipeline::{
    ChannelHandlerContext, ChannelPipeline, ChannelPipelineFactory, StaticPipelineFactory,
};
pub use sink::ChannelSink;

use crate::error::NetResult;

/// Creates channels bound to a particular transport.
pub trait ChannelFactory: Send + Sync {
    /// Creates a channel around `pipeline` and fires its OPEN event.
    fn new_channel(&self, pipeline: ChannelPipeline) -> NetResult<Channel>;

    /// Stops the threads owned by this factory.
    ///
    /// Channels still open when this is called are closed by their workers.
    fn release_external_resources(&self);
}
