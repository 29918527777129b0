//! Channel Handlers
//!
//! Handlers are the user code that lives in a pipeline. A handler may react
//! to upstream events, downstream events, or both:
//!
//! - [`UpstreamHandler`]: sees events travelling from the socket towards the
//!   application (received data, state changes, exceptions)
//! - [`DownstreamHandler`]: sees requests travelling from the application
//!   towards the socket (writes, bind, connect, close)
//! - [`SimpleChannelHandler`]: an upstream handler with one overridable
//!   method per event kind, each forwarding by default
//!
//! Handlers are shared between threads, so they take `&self` and keep any
//! mutable state behind a lock or an atomic.

use crate::channel::event::{
    ChannelEvent, ChildChannelStateEvent, ExceptionEvent, MessageEvent, StateChange, StateEvent,
};
use crate::channel::pipeline::ChannelHandlerContext;
use crate::error::NetResult;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Receives events travelling from the transport to the application.
///
/// Returning an error (or panicking) does not stop the pipeline: the
/// failure is turned into an [`ExceptionEvent`] and sent on to the next
/// upstream handler.
pub trait UpstreamHandler: Send + Sync + 'static {
    fn handle_upstream(&self, ctx: &ChannelHandlerContext, event: ChannelEvent) -> NetResult<()>;
}

/// Receives requests travelling from the application to the transport.
///
/// A failure here fails the future of the event being handled.
pub trait DownstreamHandler: Send + Sync + 'static {
    fn handle_downstream(&self, ctx: &ChannelHandlerContext, event: ChannelEvent)
        -> NetResult<()>;
}

/// An upstream handler with one method per event kind.
///
/// Every method forwards the event to the next handler unless overridden.
pub trait SimpleChannelHandler: Send + Sync + 'static {
    fn message_received(&self, ctx: &ChannelHandlerContext, e: MessageEvent) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }

    /// Invoked when an exception was raised.
    ///
    /// If this is the last handler in the pipeline the exception is logged,
    /// since nobody else will see it.
    fn exception_caught(&self, ctx: &ChannelHandlerContext, e: ExceptionEvent) -> NetResult<()> {
        if ctx.is_last() {
            warn!(
                channel = %e.channel.id(),
                error = %e.cause,
                "EXCEPTION, please implement exception_caught() for proper handling"
            );
        }
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn channel_open(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn channel_bound(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn channel_connected(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn channel_interest_changed(
        &self,
        ctx: &ChannelHandlerContext,
        e: StateEvent,
    ) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn channel_disconnected(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn channel_unbound(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn channel_closed(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn child_channel_open(
        &self,
        ctx: &ChannelHandlerContext,
        e: ChildChannelStateEvent,
    ) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn child_channel_closed(
        &self,
        ctx: &ChannelHandlerContext,
        e: ChildChannelStateEvent,
    ) -> NetResult<()> {
        ctx.send_upstream(e.into());
        Ok(())
    }
}

impl<T: SimpleChannelHandler> UpstreamHandler for T {
    fn handle_upstream(&self, ctx: &ChannelHandlerContext, event: ChannelEvent) -> NetResult<()> {
        match event {
            ChannelEvent::Message(e) => self.message_received(ctx, e),
            ChannelEvent::Exception(e) => self.exception_caught(ctx, e),
            ChannelEvent::ChildState(e) if e.open => self.child_channel_open(ctx, e),
            ChannelEvent::ChildState(e) => self.child_channel_closed(ctx, e),
            ChannelEvent::State(e) => match e.change {
                StateChange::Open(true) => self.channel_open(ctx, e),
                StateChange::Open(false) => self.channel_closed(ctx, e),
                StateChange::Bound(Some(_)) => self.channel_bound(ctx, e),
                StateChange::Bound(None) => self.channel_unbound(ctx, e),
                StateChange::Connected(Some(_)) => self.channel_connected(ctx, e),
                StateChange::Connected(None) => self.channel_disconnected(ctx, e),
                StateChange::InterestOps(_) => self.channel_interest_changed(ctx, e),
            },
        }
    }
}

/// A handler as stored in a pipeline.
///
/// Records which directions the handler takes part in and keeps the
/// concrete instance around so it can be looked up by type later.
#[derive(Clone)]
pub struct ChannelHandler {
    upstream: Option<Arc<dyn UpstreamHandler>>,
    downstream: Option<Arc<dyn DownstreamHandler>>,
    instance: Arc<dyn Any + Send + Sync>,
}

impl ChannelHandler {
    /// Wraps a handler that only sees upstream events.
    pub fn upstream<H: UpstreamHandler>(handler: H) -> Self {
        Self::shared_upstream(Arc::new(handler))
    }

    /// Wraps a handler that only sees downstream events.
    pub fn downstream<H: DownstreamHandler>(handler: H) -> Self {
        Self::shared_downstream(Arc::new(handler))
    }

    /// Wraps a handler that sees events in both directions.
    pub fn duplex<H: UpstreamHandler + DownstreamHandler>(handler: H) -> Self {
        Self::shared_duplex(Arc::new(handler))
    }

    /// Like [`upstream`](Self::upstream), for a handler instance that is
    /// shared between several pipelines.
    pub fn shared_upstream<H: UpstreamHandler>(handler: Arc<H>) -> Self {
        Self {
            upstream: Some(handler.clone()),
            downstream: None,
            instance: handler,
        }
    }

    pub fn shared_downstream<H: DownstreamHandler>(handler: Arc<H>) -> Self {
        Self {
            upstream: None,
            downstream: Some(handler.clone()),
            instance: handler,
        }
    }

    pub fn shared_duplex<H: UpstreamHandler + DownstreamHandler>(handler: Arc<H>) -> Self {
        Self {
            upstream: Some(handler.clone()),
            downstream: Some(handler.clone()),
            instance: handler,
        }
    }

    /// Wraps a value that takes part in neither direction.
    ///
    /// Events skip it entirely; it only occupies a name in the pipeline.
    pub fn passthrough<H: Any + Send + Sync>(handler: H) -> Self {
        Self {
            upstream: None,
            downstream: None,
            instance: Arc::new(handler),
        }
    }

    pub fn handles_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn handles_downstream(&self) -> bool {
        self.downstream.is_some()
    }

    /// Returns the handler instance if it is a `H`.
    pub fn downcast<H: Any + Send + Sync>(&self) -> Option<Arc<H>> {
        self.instance.clone().downcast::<H>().ok()
    }

    /// Returns true if both values wrap the same handler instance.
    pub fn same_instance(&self, other: &ChannelHandler) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }

    pub(crate) fn upstream_handler(&self) -> Option<&Arc<dyn UpstreamHandler>> {
        self.upstream.as_ref()
    }

    pub(crate) fn downstream_handler(&self) -> Option<&Arc<dyn DownstreamHandler>> {
        self.downstream.as_ref()
    }
}

impl fmt::Debug for ChannelHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandler")
            .field("upstream", &self.handles_upstream())
            .field("downstream", &self.handles_downstream())
            .finish()
    }
}
