//! Channel Events
//!
//! Everything that happens to a channel travels through its pipeline as a
//! [`ChannelEvent`]. The same types flow in both directions:
//!
//! ```text
//!   Upstream (socket → application)       Downstream (application → socket)
//!   ───────────────────────────────       ─────────────────────────────────
//!   State  OPEN true/false                State  OPEN false   = close
//!   State  BOUND addr/None                State  BOUND addr   = bind
//!   State  CONNECTED addr/None            State  CONNECTED addr = connect
//!   State  INTEREST_OPS ops               State  INTEREST_OPS ops
//!   Message  received data                Message  data to write
//!   Exception                             Exception (turned upstream by sink)
//!   ChildState (listening channels)
//! ```
//!
//! Upstream events carry an already-succeeded future; downstream events
//! carry the future the application is waiting on.

use crate::channel::channel::Channel;
use crate::channel::future::ChannelFuture;
use crate::error::Cause;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;

/// An opaque message payload.
pub type Message = Box<dyn Any + Send>;

/// The aspect of a channel a [`StateEvent`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Open,
    Bound,
    Connected,
    InterestOps,
}

/// A state transition together with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// `true` when the channel opened, `false` when it closed (or should)
    Open(bool),
    /// The local address, or `None` when unbound
    Bound(Option<SocketAddr>),
    /// The remote address, or `None` when disconnected
    Connected(Option<SocketAddr>),
    /// The new interest ops bitmask
    InterestOps(u8),
}

impl StateChange {
    pub fn state(&self) -> ChannelState {
        match self {
            StateChange::Open(_) => ChannelState::Open,
            StateChange::Bound(_) => ChannelState::Bound,
            StateChange::Connected(_) => ChannelState::Connected,
            StateChange::InterestOps(_) => ChannelState::InterestOps,
        }
    }
}

/// A change in channel state, or a request for one.
#[derive(Clone)]
pub struct StateEvent {
    pub channel: Channel,
    pub future: ChannelFuture,
    pub change: StateChange,
}

/// Data received from, or to be written to, a channel.
pub struct MessageEvent {
    pub channel: Channel,
    pub future: ChannelFuture,
    pub message: Message,
    pub remote_address: Option<SocketAddr>,
}

impl MessageEvent {
    pub fn new(
        channel: Channel,
        future: ChannelFuture,
        message: Message,
        remote_address: Option<SocketAddr>,
    ) -> Self {
        Self {
            channel,
            future,
            message,
            remote_address,
        }
    }

    /// Returns the payload if it is a `T`.
    pub fn message_ref<T: Any>(&self) -> Option<&T> {
        self.message.downcast_ref::<T>()
    }

    /// Builds a new event with the same channel, future and address
    /// but a different payload.
    pub fn with_message<M: Any + Send>(self, message: M) -> Self {
        Self {
            message: Box::new(message),
            ..self
        }
    }
}

/// A failure raised while processing events for a channel.
#[derive(Clone)]
pub struct ExceptionEvent {
    pub channel: Channel,
    pub future: ChannelFuture,
    pub cause: Cause,
}

/// Sent to a listening channel when one of its accepted children opens or
/// closes.
#[derive(Clone)]
pub struct ChildChannelStateEvent {
    /// The listening (parent) channel
    pub channel: Channel,
    pub future: ChannelFuture,
    pub child: Channel,
    pub open: bool,
}

/// A unit of work flowing through a pipeline.
pub enum ChannelEvent {
    State(StateEvent),
    Message(MessageEvent),
    Exception(ExceptionEvent),
    ChildState(ChildChannelStateEvent),
}

impl ChannelEvent {
    /// An upstream state notification.
    pub fn state(channel: &Channel, change: StateChange) -> Self {
        ChannelEvent::State(StateEvent {
            channel: channel.clone(),
            future: channel.succeeded_future(),
            change,
        })
    }

    /// An upstream message notification.
    pub fn message<M: Any + Send>(
        channel: &Channel,
        message: M,
        remote_address: Option<SocketAddr>,
    ) -> Self {
        ChannelEvent::Message(MessageEvent {
            channel: channel.clone(),
            future: channel.succeeded_future(),
            message: Box::new(message),
            remote_address,
        })
    }

    /// An upstream exception notification.
    pub fn exception(channel: &Channel, cause: impl Into<Cause>) -> Self {
        ChannelEvent::Exception(ExceptionEvent {
            channel: channel.clone(),
            future: channel.succeeded_future(),
            cause: cause.into(),
        })
    }

    /// An upstream child open/close notification for a listening channel.
    pub fn child_state(parent: &Channel, child: &Channel, open: bool) -> Self {
        ChannelEvent::ChildState(ChildChannelStateEvent {
            channel: parent.clone(),
            future: parent.succeeded_future(),
            child: child.clone(),
            open,
        })
    }

    /// A downstream request for a state change.
    pub fn request(channel: &Channel, future: ChannelFuture, change: StateChange) -> Self {
        ChannelEvent::State(StateEvent {
            channel: channel.clone(),
            future,
            change,
        })
    }

    pub fn channel(&self) -> &Channel {
        match self {
            ChannelEvent::State(e) => &e.channel,
            ChannelEvent::Message(e) => &e.channel,
            ChannelEvent::Exception(e) => &e.channel,
            ChannelEvent::ChildState(e) => &e.channel,
        }
    }

    pub fn future(&self) -> &ChannelFuture {
        match self {
            ChannelEvent::State(e) => &e.future,
            ChannelEvent::Message(e) => &e.future,
            ChannelEvent::Exception(e) => &e.future,
            ChannelEvent::ChildState(e) => &e.future,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, ChannelEvent::Exception(_))
    }
}

impl From<StateEvent> for ChannelEvent {
    fn from(event: StateEvent) -> Self {
        ChannelEvent::State(event)
    }
}

impl From<MessageEvent> for ChannelEvent {
    fn from(event: MessageEvent) -> Self {
        ChannelEvent::Message(event)
    }
}

impl From<ExceptionEvent> for ChannelEvent {
    fn from(event: ExceptionEvent) -> Self {
        ChannelEvent::Exception(event)
    }
}

impl From<ChildChannelStateEvent> for ChannelEvent {
    fn from(event: ChildChannelStateEvent) -> Self {
        ChannelEvent::ChildState(event)
    }
}

impl fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEvent::State(e) => match e.change {
                StateChange::Open(open) => write!(f, "{} OPEN: {}", e.channel, open),
                StateChange::Bound(Some(addr)) => write!(f, "{} BOUND: {}", e.channel, addr),
                StateChange::Bound(None) => write!(f, "{} UNBOUND", e.channel),
                StateChange::Connected(Some(addr)) => {
                    write!(f, "{} CONNECTED: {}", e.channel, addr)
                }
                StateChange::Connected(None) => write!(f, "{} DISCONNECTED", e.channel),
                StateChange::InterestOps(ops) => {
                    write!(f, "{} INTEREST_CHANGED: {}", e.channel, ops)
                }
            },
            ChannelEvent::Message(e) => write!(f, "{} MESSAGE", e.channel),
            ChannelEvent::Exception(e) => write!(f, "{} EXCEPTION: {}", e.channel, e.cause),
            ChannelEvent::ChildState(e) => write!(
                f,
                "{} CHILD_{}: {}",
                e.channel,
                if e.open { "OPEN" } else { "CLOSED" },
                e.child.id()
            ),
        }
    }
}

/// Extracts a writable byte payload from a message.
///
/// Accepts [`ChannelBuffer`](crate::buffer::ChannelBuffer), `Bytes`,
/// `Vec<u8>`, `String` and `&'static str`; anything else is handed back.
pub(crate) fn into_bytes(message: Message) -> Result<Bytes, Message> {
    use crate::buffer::ChannelBuffer;

    let message = match message.downcast::<ChannelBuffer>() {
        Ok(buffer) => return Ok(buffer.into_bytes()),
        Err(other) => other,
    };
    let message = match message.downcast::<Bytes>() {
        Ok(bytes) => return Ok(*bytes),
        Err(other) => other,
    };
    let message = match message.downcast::<Vec<u8>>() {
        Ok(vec) => return Ok(Bytes::from(*vec)),
        Err(other) => other,
    };
    let message = match message.downcast::<String>() {
        Ok(s) => return Ok(Bytes::from(*s)),
        Err(other) => other,
    };
    match message.downcast::<&'static str>() {
        Ok(s) => Ok(Bytes::from_static(s.as_bytes())),
        Err(other) => Err(other),
    }
}
