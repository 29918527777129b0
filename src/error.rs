//! Error Types
//!
//! Every fallible operation in netpipe returns a [`NetError`]. Errors fall into
//! four classes, and the class decides how the framework reacts:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬─────────────────────────────┐
//! │ Category     │ Examples                     │ Reaction                    │
//! ├──────────────┼──────────────────────────────┼─────────────────────────────┤
//! │ Transport    │ reset, refused, timed out    │ ExceptionEvent, close       │
//! │ Protocol     │ corrupt header, frame size   │ ExceptionEvent upstream     │
//! │ Programming  │ double completion, bad decode│ logged at error, never lost │
//! │ Pipeline     │ factory failure, bad option  │ returned to the caller      │
//! └──────────────┴──────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! Errors that have to be observed by more than one party (a future with many
//! listeners, an exception event) are shared as a [`Cause`].

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// A shared, immutable error handed to every observer of a failure.
pub type Cause = Arc<NetError>;

/// Result alias used by handlers and codecs.
pub type NetResult<T> = Result<T, NetError>;

/// Coarse classification of a [`NetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// OS-level I/O failure during accept, read, write or connect
    Transport,
    /// Malformed or oversized input seen by a codec
    Protocol,
    /// A broken handler or misuse of the API
    Programming,
    /// Pipeline construction or configuration failure
    Pipeline,
}

/// Errors produced by buffers, pipelines, codecs and the transport.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel was closed before the operation could complete
    #[error("channel closed")]
    ChannelClosed,

    /// The operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// An operation was attempted in a state that does not allow it
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A relative read asked for more bytes than are readable
    #[error("buffer underflow: requested {requested} bytes, {readable} readable")]
    BufferUnderflow { requested: usize, readable: usize },

    /// An absolute access fell outside the written region of a buffer
    #[error("index out of bounds: {index}+{len} exceeds writer index {limit}")]
    IndexOutOfBounds {
        index: usize,
        len: usize,
        limit: usize,
    },

    /// A frame exceeded the configured maximum length
    #[error("frame too long: {0}")]
    TooLongFrame(String),

    /// The byte stream does not follow the expected wire format
    #[error("corrupted stream: {0}")]
    CorruptedStream(String),

    /// The pipeline factory could not produce a pipeline
    #[error("pipeline initialization failed: {0}")]
    PipelineInit(String),

    /// No handler is registered under the given name
    #[error("no handler named '{0}'")]
    NoSuchHandler(String),

    /// A handler with the given name is already registered
    #[error("duplicate handler name: '{0}'")]
    DuplicateHandler(String),

    /// A configuration option has the wrong type or an invalid value
    #[error("invalid option '{name}': {reason}")]
    InvalidOption { name: String, reason: String },

    /// The transport cannot write a message of this type
    #[error("unsupported message type: expected {0}")]
    UnsupportedMessage(&'static str),

    /// The operation is not supported by this kind of channel
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// An outbound connection did not complete in time
    #[error("connection timed out: {0}")]
    ConnectTimeout(SocketAddr),

    /// A downstream event reached a pipeline with no sink attached
    #[error("pipeline is not attached to a channel sink")]
    NotAttached,

    /// The worker owning the channel is shutting down
    #[error("worker is shutting down")]
    WorkerShutdown,

    /// A blocking wait was attempted on an I/O worker thread
    #[error("blocking operation attempted on an I/O thread")]
    BlockingOperation,

    /// Binding a listening channel failed
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: Cause,
    },

    /// A handler panicked while processing an event
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// An application-defined handler error
    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl NetError {
    /// Wraps an application error so it can be returned from a handler.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        NetError::Handler(err.into())
    }

    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NetError::Io(_)
            | NetError::ChannelClosed
            | NetError::Cancelled
            | NetError::ConnectTimeout(_)
            | NetError::WorkerShutdown
            | NetError::Bind { .. } => ErrorCategory::Transport,

            NetError::TooLongFrame(_)
            | NetError::CorruptedStream(_)
            | NetError::BufferUnderflow { .. }
            | NetError::Handler(_) => ErrorCategory::Protocol,

            NetError::IllegalState(_)
            | NetError::IndexOutOfBounds { .. }
            | NetError::UnsupportedMessage(_)
            | NetError::Unsupported(_)
            | NetError::NotAttached
            | NetError::BlockingOperation
            | NetError::HandlerPanic(_) => ErrorCategory::Programming,

            NetError::PipelineInit(_)
            | NetError::NoSuchHandler(_)
            | NetError::DuplicateHandler(_)
            | NetError::InvalidOption { .. } => ErrorCategory::Pipeline,
        }
    }

    /// Returns true if this error means the peer or socket went away.
    pub fn is_closed(&self) -> bool {
        match self {
            NetError::ChannelClosed => true,
            NetError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    pub(crate) fn invalid_option(name: &str, reason: impl Into<String>) -> Self {
        NetError::InvalidOption {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(NetError::ChannelClosed.category(), ErrorCategory::Transport);
        assert_eq!(
            NetError::CorruptedStream("bad".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            NetError::IllegalState("twice".into()).category(),
            ErrorCategory::Programming
        );
        assert_eq!(
            NetError::PipelineInit("boom".into()).category(),
            ErrorCategory::Pipeline
        );
    }

    #[test]
    fn test_is_closed() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(NetError::Io(reset).is_closed());
        assert!(NetError::ChannelClosed.is_closed());
        assert!(!NetError::Cancelled.is_closed());
    }

    #[test]
    fn test_display() {
        let err = NetError::BufferUnderflow {
            requested: 4,
            readable: 2,
        };
        assert_eq!(
            err.to_string(),
            "buffer underflow: requested 4 bytes, 2 readable"
        );
    }
}
