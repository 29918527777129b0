//! Client bootstrap.

use crate::bootstrap::{apply_options, Bootstrap, REMOTE_ADDRESS};
use crate::channel::{ChannelFactory, ChannelFuture};
use crate::error::NetResult;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::debug;

/// Creates outbound channels and starts connecting them.
pub struct ClientBootstrap {
    bootstrap: Bootstrap,
}

impl ClientBootstrap {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            bootstrap: Bootstrap::new(factory),
        }
    }

    /// Connects to the `remoteAddress` option.
    pub fn connect(&self) -> NetResult<ChannelFuture> {
        let remote = self.bootstrap.address_option(REMOTE_ADDRESS)?;
        self.connect_to(remote)
    }

    /// Creates a channel and starts connecting it to `remote`.
    ///
    /// Pipeline and option failures are returned directly; connection
    /// failures complete the returned future. Its channel is available
    /// through [`ChannelFuture::channel`].
    pub fn connect_to(&self, remote: SocketAddr) -> NetResult<ChannelFuture> {
        let pipeline = self.bootstrap.new_pipeline()?;
        let channel = self.bootstrap.factory().new_channel(pipeline)?;

        let options = self
            .bootstrap
            .options()
            .iter()
            .map(|(name, value)| (name.as_str(), *value));
        if let Err(e) = apply_options(&channel, options) {
            channel.close();
            return Err(e);
        }

        debug!(channel = %channel.id(), %remote, "Connecting");
        Ok(channel.connect(remote))
    }
}

impl Deref for ClientBootstrap {
    type Target = Bootstrap;

    fn deref(&self) -> &Bootstrap {
        &self.bootstrap
    }
}

impl DerefMut for ClientBootstrap {
    fn deref_mut(&mut self) -> &mut Bootstrap {
        &mut self.bootstrap
    }
}
