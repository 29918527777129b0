//! Server bootstrap.
//!
//! Binding creates a listening channel whose pipeline starts with a binder
//! handler. When the channel opens, the binder configures it, installs the
//! child pipeline factory and issues the bind; afterwards it applies the
//! `child.` options to every accepted channel.

use crate::bootstrap::{apply_options, Bootstrap, CHILD_PREFIX, LOCAL_ADDRESS};
use crate::channel::{
    Channel, ChannelFactory, ChannelFuture, ChannelHandler, ChannelHandlerContext,
    ChannelPipeline, ChannelPipelineFactory, ChildChannelStateEvent, ExceptionEvent,
    OptionValue, SimpleChannelHandler, StateEvent,
};
use crate::error::{NetError, NetResult};
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates and binds listening channels.
pub struct ServerBootstrap {
    bootstrap: Bootstrap,
    parent_handler: Option<ChannelHandler>,
}

impl ServerBootstrap {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            bootstrap: Bootstrap::new(factory),
            parent_handler: None,
        }
    }

    /// A handler for the listening channel itself, placed after the binder.
    ///
    /// It sees the listening channel's events, including child open/close
    /// notifications.
    pub fn set_parent_handler(&mut self, handler: ChannelHandler) {
        self.parent_handler = Some(handler);
    }

    pub fn parent_handler(&self) -> Option<&ChannelHandler> {
        self.parent_handler.as_ref()
    }

    /// Binds to the `localAddress` option.
    pub fn bind(&self) -> NetResult<Channel> {
        let local = self.bootstrap.address_option(LOCAL_ADDRESS)?;
        self.bind_to(local)
    }

    /// Creates a listening channel bound to `local`, blocking until the bind
    /// succeeds or fails.
    pub fn bind_to(&self, local: SocketAddr) -> NetResult<Channel> {
        let (parent_options, child_options): (Vec<_>, Vec<_>) = self
            .bootstrap
            .options()
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .partition(|(name, _)| !name.starts_with(CHILD_PREFIX));
        let child_options = child_options
            .into_iter()
            .map(|(name, value)| (name[CHILD_PREFIX.len()..].to_string(), value))
            .collect();

        let bind_future = ChannelFuture::new(false);
        let binder = Binder {
            local,
            parent_options,
            child_options,
            child_pipeline_factory: self.bootstrap.pipeline_factory(),
            bind_future: bind_future.clone(),
        };

        let pipeline = ChannelPipeline::new();
        pipeline.add_last("binder", ChannelHandler::upstream(binder))?;
        if let Some(handler) = &self.parent_handler {
            pipeline.add_last("userHandler", handler.clone())?;
        }

        let channel = self.bootstrap.factory().new_channel(pipeline)?;
        match bind_future.wait() {
            Ok(()) => {
                info!(channel = %channel.id(), address = ?channel.local_address(), "Server bound");
                Ok(channel)
            }
            Err(source) => {
                let _ = channel.close().wait();
                Err(NetError::Bind {
                    address: local,
                    source,
                })
            }
        }
    }
}

impl Deref for ServerBootstrap {
    type Target = Bootstrap;

    fn deref(&self) -> &Bootstrap {
        &self.bootstrap
    }
}

impl DerefMut for ServerBootstrap {
    fn deref_mut(&mut self) -> &mut Bootstrap {
        &mut self.bootstrap
    }
}

/// First handler of every listening channel created by a [`ServerBootstrap`].
struct Binder {
    local: SocketAddr,
    parent_options: Vec<(String, OptionValue)>,
    child_options: Vec<(String, OptionValue)>,
    child_pipeline_factory: Arc<dyn ChannelPipelineFactory>,
    bind_future: ChannelFuture,
}

impl SimpleChannelHandler for Binder {
    fn channel_open(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        let channel = e.channel.clone();
        channel.set_pipeline_factory(Arc::clone(&self.child_pipeline_factory));
        let configured = apply_options(
            &channel,
            self.parent_options
                .iter()
                .map(|(name, value)| (name.as_str(), *value)),
        );
        ctx.send_upstream(e.into());

        if let Err(err) = configured {
            let _ = self.bind_future.set_failure(err);
            return Ok(());
        }

        let bind_future = self.bind_future.clone();
        channel.bind(self.local).add_listener(move |future| {
            if let Some(result) = future.result() {
                let _ = match result {
                    Ok(()) => bind_future.set_success(),
                    Err(cause) => bind_future.set_failure(cause),
                };
            }
        });
        Ok(())
    }

    fn child_channel_open(
        &self,
        ctx: &ChannelHandlerContext,
        e: ChildChannelStateEvent,
    ) -> NetResult<()> {
        let options = self
            .child_options
            .iter()
            .map(|(name, value)| (name.as_str(), *value));
        if let Err(err) = apply_options(&e.child, options) {
            warn!(child = %e.child.id(), error = %err, "Failed to apply child options");
        }
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn exception_caught(&self, ctx: &ChannelHandlerContext, e: ExceptionEvent) -> NetResult<()> {
        if !self.bind_future.is_done() {
            debug!(channel = %e.channel.id(), error = %e.cause, "Bind failed");
            let _ = self.bind_future.set_failure(e.cause.clone());
        }
        ctx.send_upstream(e.into());
        Ok(())
    }
}
