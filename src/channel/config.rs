//! Channel Configuration
//!
//! Per-channel socket options, settable by name so bootstraps can carry them
//! around in a plain map:
//!
//! | Option                 | Type    | Applies to                 |
//! |------------------------|---------|----------------------------|
//! | `tcpNoDelay`           | bool    | connected sockets          |
//! | `keepAlive`            | bool    | connected sockets          |
//! | `reuseAddress`         | bool    | listening sockets          |
//! | `backlog`              | int     | listening sockets          |
//! | `receiveBufferSize`    | int     | all (also the read size)   |
//! | `sendBufferSize`       | int     | connected sockets          |
//! | `connectTimeoutMillis` | int     | client sockets, 0 disables |
//!
//! Unknown names are ignored (`set_option` returns `false`), a known name
//! with a bad value is an [`NetError::InvalidOption`].

use crate::channel::pipeline::ChannelPipelineFactory;
use crate::error::{NetError, NetResult};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Default connect timeout for client channels
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A dynamically typed option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Address(SocketAddr),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<SocketAddr> for OptionValue {
    fn from(value: SocketAddr) -> Self {
        OptionValue::Address(value)
    }
}

impl OptionValue {
    fn as_bool(&self, name: &str) -> NetResult<bool> {
        match self {
            OptionValue::Bool(b) => Ok(*b),
            other => Err(NetError::invalid_option(
                name,
                format!("expected a boolean, got {:?}", other),
            )),
        }
    }

    fn as_int(&self, name: &str) -> NetResult<i64> {
        match self {
            OptionValue::Int(i) => Ok(*i),
            other => Err(NetError::invalid_option(
                name,
                format!("expected an integer, got {:?}", other),
            )),
        }
    }

    fn as_positive(&self, name: &str) -> NetResult<usize> {
        let value = self.as_int(name)?;
        if value <= 0 {
            return Err(NetError::invalid_option(name, "must be positive"));
        }
        usize::try_from(value).map_err(|_| NetError::invalid_option(name, "value too large"))
    }
}

/// Options of a single channel.
#[derive(Clone)]
pub struct ChannelConfig {
    tcp_no_delay: bool,
    keep_alive: bool,
    reuse_address: bool,
    backlog: u32,
    receive_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
    connect_timeout: Option<Duration>,
    pipeline_factory: Option<Arc<dyn ChannelPipelineFactory>>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            tcp_no_delay: false,
            keep_alive: false,
            reuse_address: false,
            backlog: DEFAULT_BACKLOG,
            receive_buffer_size: None,
            send_buffer_size: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            pipeline_factory: None,
        }
    }
}

impl ChannelConfig {
    /// Sets an option by name.
    ///
    /// Returns `Ok(false)` if the name is not a channel option.
    pub fn set_option(&mut self, name: &str, value: OptionValue) -> NetResult<bool> {
        match name {
            "tcpNoDelay" => self.tcp_no_delay = value.as_bool(name)?,
            "keepAlive" => self.keep_alive = value.as_bool(name)?,
            "reuseAddress" => self.reuse_address = value.as_bool(name)?,
            "backlog" => {
                self.backlog = u32::try_from(value.as_positive(name)?)
                    .map_err(|_| NetError::invalid_option(name, "value too large"))?
            }
            "receiveBufferSize" => self.receive_buffer_size = Some(value.as_positive(name)?),
            "sendBufferSize" => self.send_buffer_size = Some(value.as_positive(name)?),
            "connectTimeoutMillis" => {
                let millis = value.as_int(name)?;
                self.connect_timeout = match millis {
                    0 => None,
                    m if m < 0 => return Err(NetError::invalid_option(name, "must not be negative")),
                    m => Some(Duration::from_millis(m as u64)),
                };
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn tcp_no_delay(&self) -> bool {
        self.tcp_no_delay
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn reuse_address(&self) -> bool {
        self.reuse_address
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.receive_buffer_size
    }

    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    /// `None` means connects never time out.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// The factory a listening channel uses to build child pipelines.
    pub fn pipeline_factory(&self) -> Option<Arc<dyn ChannelPipelineFactory>> {
        self.pipeline_factory.clone()
    }

    pub fn set_pipeline_factory(&mut self, factory: Arc<dyn ChannelPipelineFactory>) {
        self.pipeline_factory = Some(factory);
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("tcp_no_delay", &self.tcp_no_delay)
            .field("keep_alive", &self.keep_alive)
            .field("reuse_address", &self.reuse_address)
            .field("backlog", &self.backlog)
            .field("receive_buffer_size", &self.receive_buffer_size)
            .field("send_buffer_size", &self.send_buffer_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("pipeline_factory", &self.pipeline_factory.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert!(!config.tcp_no_delay());
        assert_eq!(config.backlog(), DEFAULT_BACKLOG);
        assert_eq!(config.connect_timeout(), Some(DEFAULT_CONNECT_TIMEOUT));
        assert!(config.receive_buffer_size().is_none());
        assert!(config.pipeline_factory().is_none());
    }

    #[test]
    fn test_set_known_options() {
        let mut config = ChannelConfig::default();
        assert!(config.set_option("tcpNoDelay", OptionValue::Bool(true)).unwrap());
        assert!(config.set_option("keepAlive", OptionValue::Bool(true)).unwrap());
        assert!(config.set_option("receiveBufferSize", OptionValue::Int(4096)).unwrap());
        assert!(config.set_option("backlog", OptionValue::Int(16)).unwrap());
        assert!(config.set_option("connectTimeoutMillis", OptionValue::Int(0)).unwrap());

        assert!(config.tcp_no_delay());
        assert!(config.keep_alive());
        assert_eq!(config.receive_buffer_size(), Some(4096));
        assert_eq!(config.backlog(), 16);
        assert_eq!(config.connect_timeout(), None);
    }

    #[test]
    fn test_unknown_option_is_ignored() {
        let mut config = ChannelConfig::default();
        assert!(!config.set_option("soLinger", OptionValue::Int(5)).unwrap());
        assert!(!config.set_option("localAddress", OptionValue::Bool(true)).unwrap());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = ChannelConfig::default();
        assert!(matches!(
            config.set_option("tcpNoDelay", OptionValue::Int(1)),
            Err(NetError::InvalidOption { name, .. }) if name == "tcpNoDelay"
        ));
        assert!(config.set_option("receiveBufferSize", OptionValue::Int(0)).is_err());
        assert!(config.set_option("connectTimeoutMillis", OptionValue::Int(-1)).is_err());
        assert!(config.receive_buffer_size().is_none());
    }
}
