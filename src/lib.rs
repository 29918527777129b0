//! # netpipe - An Event-Driven Network I/O Framework
//!
//! netpipe lets applications describe a protocol as a chain of handlers
//! while the framework owns the sockets: accepting connections, multiplexing
//! non-blocking I/O over a small pool of threads, and reassembling byte
//! streams into frames.
//!
//! ## Features
//!
//! - **Handler Pipelines**: ordered, named handlers that can be added,
//!   removed or replaced while events are in flight
//! - **Reactor Transport**: one acceptor thread per listener, a fixed pool of
//!   mio-based workers, writes queued per connection
//! - **Completion Futures**: every operation returns a [`ChannelFuture`] that
//!   can be waited on, given listeners, or `.await`ed
//! - **Framing**: cumulation and decode-loop handling for delimiter, fixed
//!   length and length-prefixed protocols
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                netpipe                                  │
//! │                                                                         │
//! │  ┌─────────────┐  register   ┌─────────────┐  upstream  ┌─────────────┐  │
//! │  │  Acceptor   │────────────>│   Worker    │───────────>│  Pipeline   │  │
//! │  │   (boss)    │ round-robin │  mio Poll   │            │  framer     │  │
//! │  └─────────────┘             │  tasks      │<───────────│  decoder    │  │
//! │                              │  writes     │   sink     │  handler    │  │
//! │                              └─────────────┘ downstream └─────────────┘  │
//! │                                     ▲                          │        │
//! │                                     │ Task queue               ▼        │
//! │                              ┌──────┴──────────────────────────────┐    │
//! │                              │ application threads: write / close  │    │
//! │                              └─────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use netpipe::bootstrap::ServerBootstrap;
//! use netpipe::channel::{ChannelHandler, ChannelHandlerContext, ChannelPipeline, MessageEvent, SimpleChannelHandler};
//! use netpipe::codec::{DelimiterBasedFrameDecoder, FrameDecoder, StringDecoder, StringEncoder};
//! use netpipe::transport::{ReactorConfig, ServerSocketChannelFactory};
//! use netpipe::NetResult;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl SimpleChannelHandler for Echo {
//!     fn message_received(&self, _ctx: &ChannelHandlerContext, e: MessageEvent) -> NetResult<()> {
//!         if let Some(line) = e.message_ref::<String>() {
//!             e.channel.write(format!("{}\n", line));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> NetResult<()> {
//!     let factory = Arc::new(ServerSocketChannelFactory::new(ReactorConfig::default())?);
//!     let mut bootstrap = ServerBootstrap::new(factory);
//!     bootstrap.set_pipeline_factory(Arc::new(|| -> NetResult<ChannelPipeline> {
//!         let pipeline = ChannelPipeline::new();
//!         pipeline.add_last("framer", ChannelHandler::upstream(FrameDecoder::new(
//!             DelimiterBasedFrameDecoder::lines(8192)?,
//!         )))?;
//!         pipeline.add_last("decoder", ChannelHandler::upstream(StringDecoder))?;
//!         pipeline.add_last("encoder", ChannelHandler::downstream(StringEncoder))?;
//!         pipeline.add_last("echo", ChannelHandler::upstream(Echo))?;
//!         Ok(pipeline)
//!     }));
//!
//!     let listener = bootstrap.bind_to("127.0.0.1:7000".parse().unwrap())?;
//!     listener.close_future().wait().ok();
//!     bootstrap.release_external_resources();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`buffer`]: [`ChannelBuffer`], a byte buffer with separate read and
//!   write cursors
//! - [`channel`]: channels, events, futures, handlers and pipelines
//! - [`transport`]: the non-blocking TCP transport (workers, acceptors,
//!   channel factories)
//! - [`codec`]: frame decoders and simple encoders
//! - [`bootstrap`]: helpers for binding servers and connecting clients
//!
//! ## Design Highlights
//!
//! ### One Thread Per Channel
//!
//! Every connection is owned by exactly one worker for its whole life. All of
//! its reads, writes and handler callbacks run on that worker, so buffers and
//! decoder state need no further locking. Other threads reach a channel only
//! through its worker's task queue.
//!
//! ### Write Interest As Backpressure
//!
//! A socket is polled for writability only while it has queued output. The
//! queue itself is unbounded; [`Channel::is_writable`] tells producers when
//! output is piling up.
//!
//! ### Failures Become Events
//!
//! A handler that fails or panics never takes down its worker. The failure
//! is delivered to the rest of the pipeline as an exception event.

pub mod bootstrap;
pub mod buffer;
pub mod channel;
pub mod codec;
pub mod error;
pub mod transport;

// Re-export commonly used types for convenience
pub use buffer::ChannelBuffer;
pub use channel::{
    Channel, ChannelEvent, ChannelFactory, ChannelFuture, ChannelHandler, ChannelHandlerContext,
    ChannelPipeline, ChannelPipelineFactory, MessageEvent, SimpleChannelHandler,
};
pub use error::{Cause, ErrorCategory, NetError, NetResult};

/// The default port the demo server listens on
pub const DEFAULT_PORT: u16 = 7000;

/// The default host the demo server binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of netpipe
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
