//! Bootstrap Module
//!
//! Helpers that wire a channel factory, a pipeline and a set of options into
//! a bound server or a connected client.
//!
//! ```text
//! let factory = Arc::new(ServerSocketChannelFactory::new(ReactorConfig::default())?);
//! let mut bootstrap = ServerBootstrap::new(factory);
//! bootstrap.set_pipeline_factory(Arc::new(|| { ... }));
//! bootstrap.set_option("child.tcpNoDelay", true);
//! let listener = bootstrap.bind_to("127.0.0.1:8080".parse()?)?;
//! ```
//!
//! Options are keyed by name. `localAddress` and `remoteAddress` hold
//! addresses; everything else is handed to
//! [`ChannelConfig::set_option`](crate::channel::ChannelConfig::set_option).
//! On a server, names prefixed with `child.` apply to accepted channels.

pub mod client;
pub mod server;

pub use client::ClientBootstrap;
pub use server::ServerBootstrap;

use crate::channel::{
    Channel, ChannelFactory, ChannelPipeline, ChannelPipelineFactory, OptionValue,
    StaticPipelineFactory,
};
use crate::error::{NetError, NetResult};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Option naming the address to bind
pub const LOCAL_ADDRESS: &str = "localAddress";

/// Option naming the address to connect to
pub const REMOTE_ADDRESS: &str = "remoteAddress";

/// Prefix of server options that apply to accepted channels
pub const CHILD_PREFIX: &str = "child.";

/// State shared by server and client bootstraps.
pub struct Bootstrap {
    factory: Arc<dyn ChannelFactory>,
    pipeline: ChannelPipeline,
    pipeline_factory: Option<Arc<dyn ChannelPipelineFactory>>,
    options: HashMap<String, OptionValue>,
}

impl Bootstrap {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            factory,
            pipeline: ChannelPipeline::new(),
            pipeline_factory: None,
            options: HashMap::new(),
        }
    }

    pub fn factory(&self) -> &Arc<dyn ChannelFactory> {
        &self.factory
    }

    /// The template pipeline, copied for every new channel unless a
    /// pipeline factory is set.
    ///
    /// Copies share handler instances, so only add handlers here that hold
    /// no per-channel state.
    pub fn pipeline(&self) -> &ChannelPipeline {
        &self.pipeline
    }

    pub fn set_pipeline_factory(&mut self, factory: Arc<dyn ChannelPipelineFactory>) {
        self.pipeline_factory = Some(factory);
    }

    /// The pipeline factory in effect.
    pub fn pipeline_factory(&self) -> Arc<dyn ChannelPipelineFactory> {
        match &self.pipeline_factory {
            Some(factory) => Arc::clone(factory),
            None => Arc::new(StaticPipelineFactory::new(self.pipeline.clone())),
        }
    }

    pub fn option(&self, name: &str) -> Option<OptionValue> {
        self.options.get(name).copied()
    }

    pub fn options(&self) -> &HashMap<String, OptionValue> {
        &self.options
    }

    /// Sets an option; the value is checked when it is applied to a channel.
    pub fn set_option(&mut self, name: impl Into<String>, value: impl Into<OptionValue>) {
        self.options.insert(name.into(), value.into());
    }

    pub fn remove_option(&mut self, name: &str) -> Option<OptionValue> {
        self.options.remove(name)
    }

    /// Releases the threads of the channel factory.
    pub fn release_external_resources(&self) {
        self.factory.release_external_resources();
    }

    fn address_option(&self, name: &str) -> NetResult<SocketAddr> {
        match self.options.get(name) {
            Some(OptionValue::Address(addr)) => Ok(*addr),
            Some(_) => Err(NetError::invalid_option(name, "expected a socket address")),
            None => Err(NetError::IllegalState(format!("{} option is not set", name))),
        }
    }

    fn new_pipeline(&self) -> NetResult<ChannelPipeline> {
        self.pipeline_factory()
            .get_pipeline()
            .map_err(|e| match e {
                NetError::PipelineInit(_) => e,
                other => NetError::PipelineInit(other.to_string()),
            })
    }
}

impl fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrap")
            .field("pipeline", &self.pipeline.names())
            .field("pipeline_factory", &self.pipeline_factory.is_some())
            .field("options", &self.options)
            .finish()
    }
}

/// Applies `options` to `channel`, skipping address options.
///
/// Stops at the first invalid value. Unknown names are ignored.
pub(crate) fn apply_options<'a>(
    channel: &Channel,
    options: impl IntoIterator<Item = (&'a str, OptionValue)>,
) -> NetResult<()> {
    for (name, value) in options {
        if name == LOCAL_ADDRESS || name == REMOTE_ADDRESS {
            continue;
        }
        if !channel.set_option(name, value)? {
            warn!(channel = %channel.id(), option = name, "Ignoring unknown option");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandler;
    use crate::codec::StringDecoder;

    struct NoopFactory;

    impl ChannelFactory for NoopFactory {
        fn new_channel(&self, _pipeline: ChannelPipeline) -> NetResult<Channel> {
            Err(NetError::Unsupported("test factory"))
        }

        fn release_external_resources(&self) {}
    }

    #[test]
    fn test_options_and_addresses() {
        let mut bootstrap = Bootstrap::new(Arc::new(NoopFactory));
        bootstrap.set_option("tcpNoDelay", true);
        bootstrap.set_option(LOCAL_ADDRESS, "127.0.0.1:80".parse::<SocketAddr>().unwrap());
        bootstrap.set_option(REMOTE_ADDRESS, 5i64);

        assert_eq!(bootstrap.option("tcpNoDelay"), Some(OptionValue::Bool(true)));
        assert_eq!(
            bootstrap.address_option(LOCAL_ADDRESS).unwrap(),
            "127.0.0.1:80".parse().unwrap()
        );
        assert!(matches!(
            bootstrap.address_option(REMOTE_ADDRESS),
            Err(NetError::InvalidOption { .. })
        ));
        bootstrap.remove_option(LOCAL_ADDRESS);
        assert!(matches!(
            bootstrap.address_option(LOCAL_ADDRESS),
            Err(NetError::IllegalState(_))
        ));
    }

    #[test]
    fn test_template_pipeline_is_copied() {
        let bootstrap = Bootstrap::new(Arc::new(NoopFactory));
        bootstrap
            .pipeline()
            .add_last("decoder", ChannelHandler::upstream(StringDecoder))
            .unwrap();

        let first = bootstrap.new_pipeline().unwrap();
        let second = bootstrap.new_pipeline().unwrap();
        assert_eq!(first.names(), vec!["decoder"]);
        first.remove("decoder").unwrap();
        assert_eq!(second.names(), vec!["decoder"]);
        assert_eq!(bootstrap.pipeline().names(), vec!["decoder"]);
    }

    #[test]
    fn test_failing_pipeline_factory_is_wrapped() {
        let mut bootstrap = Bootstrap::new(Arc::new(NoopFactory));
        bootstrap.set_pipeline_factory(Arc::new(|| -> NetResult<ChannelPipeline> {
            Err(NetError::DuplicateHandler("x".to_string()))
        }));
        assert!(matches!(
            bootstrap.new_pipeline(),
            Err(NetError::PipelineInit(_))
        ));
    }
}
