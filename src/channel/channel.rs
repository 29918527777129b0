//! Channels
//!
//! A [`Channel`] is one endpoint of network I/O: an accepted connection, an
//! outbound client connection, or a listening socket. Applications never
//! touch the socket directly. Every operation becomes a downstream event in
//! the channel's pipeline and returns a [`ChannelFuture`].
//!
//! ## Lifecycle
//!
//! ```text
//!   OPEN ──bind──> BOUND ──connect──> CONNECTED
//!     │              │                    │
//!     └──────────────┴──────close─────────┴──> CLOSED
//! ```
//!
//! The lifecycle only moves forward. Closing fires, in order, DISCONNECTED
//! (if it was connected), UNBOUND (if it was bound) and CLOSED.
//!
//! ## Thread Affinity
//!
//! A channel owned by a worker has all of its events processed on that
//! worker's thread. Operations called from any other thread are handed to
//! the worker as tasks, so handlers of one channel never run concurrently.

use crate::channel::config::{ChannelConfig, OptionValue};
use crate::channel::event::{ChannelEvent, Message, MessageEvent, StateChange};
use crate::channel::future::ChannelFuture;
use crate::channel::pipeline::{ChannelPipeline, ChannelPipelineFactory};
use crate::channel::sink::ChannelSink;
use crate::error::{Cause, NetError, NetResult};
use crate::transport::worker::{Task, WorkerHandle};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

/// No interest in any I/O readiness
pub const OP_NONE: u8 = 0;

/// Interested in reading; cleared to suspend reads
pub const OP_READ: u8 = 1;

/// Set while writes are pending; managed by the transport
pub const OP_WRITE: u8 = 4;

pub const OP_READ_WRITE: u8 = OP_READ | OP_WRITE;

/// Unique identifier of a channel within its factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Hands out channel ids, starting at 1.
#[derive(Debug, Clone, Default)]
pub struct ChannelIdGenerator(Arc<AtomicU64>);

impl ChannelIdGenerator {
    pub fn next(&self) -> ChannelId {
        ChannelId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum Lifecycle {
    Open = 0,
    Bound = 1,
    Connected = 2,
    Closed = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Open,
            1 => Lifecycle::Bound,
            2 => Lifecycle::Connected,
            _ => Lifecycle::Closed,
        }
    }
}

struct ChannelInner {
    id: ChannelId,
    parent: Option<WeakChannel>,
    pipeline: ChannelPipeline,
    lifecycle: AtomicU8,
    interest_ops: AtomicU8,
    config: RwLock<ChannelConfig>,
    local_address: OnceLock<SocketAddr>,
    remote_address: OnceLock<SocketAddr>,
    worker: Option<WorkerHandle>,
    close_future: ChannelFuture,
    /// Shared by every upstream event of this channel
    succeeded: ChannelFuture,
}

/// A handle to a network endpoint. Cloning is cheap.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// A non-owning reference to a [`Channel`].
#[derive(Clone)]
pub struct WeakChannel {
    inner: Weak<ChannelInner>,
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

impl Channel {
    /// Creates a channel and attaches `sink` to its pipeline.
    pub(crate) fn new(
        id: ChannelId,
        parent: Option<&Channel>,
        pipeline: ChannelPipeline,
        sink: Arc<dyn ChannelSink>,
        worker: Option<WorkerHandle>,
        config: ChannelConfig,
    ) -> NetResult<Channel> {
        pipeline.attach(sink)?;
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let this = WeakChannel {
                inner: weak.clone(),
            };
            ChannelInner {
                id,
                parent: parent.map(Channel::downgrade),
                pipeline,
                lifecycle: AtomicU8::new(Lifecycle::Open as u8),
                interest_ops: AtomicU8::new(OP_READ),
                config: RwLock::new(config),
                local_address: OnceLock::new(),
                remote_address: OnceLock::new(),
                worker,
                close_future: ChannelFuture::for_weak(this.clone(), None),
                succeeded: ChannelFuture::for_weak(this, Some(Ok(()))),
            }
        });
        Ok(Channel { inner })
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// The listening channel that accepted this one.
    pub fn parent(&self) -> Option<Channel> {
        self.inner.parent.as_ref().and_then(WeakChannel::upgrade)
    }

    pub fn pipeline(&self) -> &ChannelPipeline {
        &self.inner.pipeline
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.lifecycle.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle() != Lifecycle::Closed
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Bound | Lifecycle::Connected)
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle() == Lifecycle::Connected
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.local_address.get().copied()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.remote_address.get().copied()
    }

    pub fn interest_ops(&self) -> u8 {
        self.inner.interest_ops.load(Ordering::Acquire)
    }

    /// Returns true if the transport reads from this channel.
    pub fn is_readable(&self) -> bool {
        self.interest_ops() & OP_READ != 0
    }

    /// Returns false while outbound data is waiting for the socket.
    pub fn is_writable(&self) -> bool {
        self.interest_ops() & OP_WRITE == 0
    }

    /// Completes when the channel is closed, for whatever reason.
    pub fn close_future(&self) -> ChannelFuture {
        self.inner.close_future.clone()
    }

    pub(crate) fn succeeded_future(&self) -> ChannelFuture {
        self.inner.succeeded.clone()
    }

    pub(crate) fn set_bound(&self) {
        self.advance(Lifecycle::Bound);
    }

    pub(crate) fn set_connected(&self) {
        self.advance(Lifecycle::Connected);
    }

    fn advance(&self, to: Lifecycle) {
        let _ = self
            .inner
            .lifecycle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < to as u8).then_some(to as u8)
            });
    }

    /// Marks the channel closed and completes its close future.
    ///
    /// Returns the state it was in, or `None` if it was already closed.
    pub(crate) fn set_closed(&self) -> Option<Lifecycle> {
        let prior = self
            .inner
            .lifecycle
            .swap(Lifecycle::Closed as u8, Ordering::AcqRel);
        let prior = Lifecycle::from_u8(prior);
        if prior == Lifecycle::Closed {
            return None;
        }
        self.inner.interest_ops.store(OP_NONE, Ordering::Release);
        let _ = self.inner.close_future.set_success();
        Some(prior)
    }

    pub(crate) fn set_local_address(&self, addr: SocketAddr) {
        let _ = self.inner.local_address.set(addr);
    }

    pub(crate) fn set_remote_address(&self, addr: SocketAddr) {
        let _ = self.inner.remote_address.set(addr);
    }

    pub(crate) fn update_interest_ops(&self, ops: u8) {
        self.inner.interest_ops.store(ops, Ordering::Release);
    }

    pub(crate) fn worker(&self) -> Option<&WorkerHandle> {
        self.inner.worker.as_ref()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// A snapshot of the channel's configuration.
    pub fn config(&self) -> ChannelConfig {
        self.inner.config.read().unwrap().clone()
    }

    pub(crate) fn with_config<R>(&self, f: impl FnOnce(&ChannelConfig) -> R) -> R {
        f(&self.inner.config.read().unwrap())
    }

    /// Sets an option by name and applies it to the live socket.
    ///
    /// Returns `Ok(false)` if the option is unknown.
    pub fn set_option(&self, name: &str, value: OptionValue) -> NetResult<bool> {
        let applied = self.inner.config.write().unwrap().set_option(name, value)?;
        if applied && self.is_open() {
            if let Some(worker) = &self.inner.worker {
                worker.execute(Task::ApplyConfig {
                    channel: self.clone(),
                });
            }
        }
        Ok(applied)
    }

    pub fn set_pipeline_factory(&self, factory: Arc<dyn ChannelPipelineFactory>) {
        self.inner
            .config
            .write()
            .unwrap()
            .set_pipeline_factory(factory);
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub fn bind(&self, local: SocketAddr) -> ChannelFuture {
        self.request(StateChange::Bound(Some(local)), false)
    }

    /// Connects to `remote`. The returned future can be cancelled.
    pub fn connect(&self, remote: SocketAddr) -> ChannelFuture {
        self.request(StateChange::Connected(Some(remote)), true)
    }

    pub fn disconnect(&self) -> ChannelFuture {
        self.request(StateChange::Connected(None), false)
    }

    pub fn unbind(&self) -> ChannelFuture {
        self.request(StateChange::Bound(None), false)
    }

    /// Closes the channel. Closing an already-closed channel succeeds.
    pub fn close(&self) -> ChannelFuture {
        if !self.is_open() {
            return self.succeeded_future();
        }
        self.request(StateChange::Open(false), false)
    }

    /// Writes a message. It passes through the downstream handlers, which
    /// must turn it into bytes before it reaches the transport.
    pub fn write<M: Any + Send>(&self, message: M) -> ChannelFuture {
        self.write_message(Box::new(message), None)
    }

    /// Writes a message addressed to `remote`.
    pub fn write_to<M: Any + Send>(&self, message: M, remote: SocketAddr) -> ChannelFuture {
        self.write_message(Box::new(message), Some(remote))
    }

    fn write_message(
        &self,
        message: Message,
        remote: Option<SocketAddr>,
    ) -> ChannelFuture {
        if !self.is_open() {
            return ChannelFuture::failed(self, NetError::ChannelClosed);
        }
        let future = ChannelFuture::for_channel(self, false);
        self.send_downstream(ChannelEvent::Message(MessageEvent::new(
            self.clone(),
            future.clone(),
            message,
            remote,
        )));
        future
    }

    /// Changes the interest ops. Only [`OP_READ`] is honored; the write bit
    /// is managed by the transport.
    pub fn set_interest_ops(&self, ops: u8) -> ChannelFuture {
        self.request(StateChange::InterestOps(ops), false)
    }

    /// Suspends (`false`) or resumes (`true`) reading.
    pub fn set_readable(&self, readable: bool) -> ChannelFuture {
        let ops = if readable {
            self.interest_ops() | OP_READ
        } else {
            self.interest_ops() & !OP_READ
        };
        self.set_interest_ops(ops)
    }

    fn request(&self, change: StateChange, cancellable: bool) -> ChannelFuture {
        if !self.is_open() {
            return ChannelFuture::failed(self, NetError::ChannelClosed);
        }
        let future = ChannelFuture::for_channel(self, cancellable);
        self.send_downstream(ChannelEvent::request(self, future.clone(), change));
        future
    }

    // ========================================================================
    // Event routing
    // ========================================================================

    /// Sends a downstream event, on the owning worker's thread.
    pub(crate) fn send_downstream(&self, event: ChannelEvent) {
        match &self.inner.worker {
            Some(worker) if !worker.is_current() => worker.execute(Task::Downstream(event)),
            _ => self.inner.pipeline.send_downstream(event),
        }
    }

    /// Sends an upstream event, on the owning worker's thread.
    pub(crate) fn fire_upstream(&self, event: ChannelEvent) {
        match &self.inner.worker {
            Some(worker) if !worker.is_current() => worker.execute(Task::Upstream(event)),
            _ => self.inner.pipeline.send_upstream(event),
        }
    }

    pub(crate) fn fire_channel_open(&self) {
        if let Some(parent) = self.parent() {
            parent.fire_upstream(ChannelEvent::child_state(&parent, self, true));
        }
        self.fire_upstream(ChannelEvent::state(self, StateChange::Open(true)));
    }

    pub(crate) fn fire_channel_bound(&self, local: SocketAddr) {
        self.fire_upstream(ChannelEvent::state(self, StateChange::Bound(Some(local))));
    }

    pub(crate) fn fire_channel_connected(&self, remote: SocketAddr) {
        self.fire_upstream(ChannelEvent::state(
            self,
            StateChange::Connected(Some(remote)),
        ));
    }

    pub(crate) fn fire_interest_changed(&self, ops: u8) {
        self.fire_upstream(ChannelEvent::state(self, StateChange::InterestOps(ops)));
    }

    pub(crate) fn fire_exception_caught(&self, cause: impl Into<Cause>) {
        self.fire_upstream(ChannelEvent::exception(self, cause));
    }

    /// Fires the events that follow a close from state `prior`.
    pub(crate) fn fire_close_sequence(&self, prior: Lifecycle) {
        if prior >= Lifecycle::Connected {
            self.fire_upstream(ChannelEvent::state(self, StateChange::Connected(None)));
        }
        if prior >= Lifecycle::Bound {
            self.fire_upstream(ChannelEvent::state(self, StateChange::Bound(None)));
        }
        self.fire_upstream(ChannelEvent::state(self, StateChange::Open(false)));
        if let Some(parent) = self.parent() {
            parent.fire_upstream(ChannelEvent::child_state(&parent, self, false));
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[id: {}", self.id())?;
        match (self.local_address(), self.remote_address()) {
            (Some(local), Some(remote)) if self.inner.parent.is_some() => {
                write!(f, ", {} => {}", remote, local)?
            }
            (Some(local), Some(remote)) => write!(f, ", {} => {}", local, remote)?,
            (Some(local), None) => write!(f, ", {}", local)?,
            _ => {}
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
