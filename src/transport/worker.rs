//! I/O Worker
//!
//! A worker owns a readiness selector and every connection registered with
//! it. It is the only thread that ever touches those sockets or runs their
//! pipelines.
//!
//! ## Loop
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ 1. wait for readiness (select timeout, or none if a channel  │
//! │    still has unread data from the last tick)                 │
//! │ 2. run queued tasks (registrations, writes, closes, events)  │
//! │ 3. for each ready connection: finish connect / read / flush  │
//! │ 4. run tasks queued by the handlers in step 3                │
//! │ 5. expire overdue connects                                   │
//! │ 6. on shutdown: flush what fits, close everything, exit      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads are bounded per tick so one busy connection cannot starve the
//! others; a connection that hit the bound is revisited on the next tick
//! without waiting for a fresh readiness event.

use crate::buffer::ChannelBuffer;
use crate::channel::{Channel, ChannelEvent, ChannelFuture, OP_READ, OP_WRITE};
use crate::error::{Cause, NetError, NetResult};
use crate::transport::config::ReactorConfig;
use crate::transport::mark_io_thread;
use crate::transport::socket::apply_socket_options;
use crate::transport::write_queue::WriteQueue;
use bytes::{Bytes, BytesMut};
use crossbeam_queue::SegQueue;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Token reserved for the task-queue waker
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Readiness events handled per selector wakeup
const EVENTS_CAPACITY: usize = 1024;

/// Work handed to a worker by other threads (or by its own handlers).
pub(crate) enum Task {
    /// Take ownership of an accepted connection
    Register { channel: Channel, stream: TcpStream },
    /// Start an outbound connection
    Connect {
        channel: Channel,
        remote: SocketAddr,
        future: ChannelFuture,
    },
    /// Deliver an upstream event on the worker thread
    Upstream(ChannelEvent),
    /// Deliver a downstream event on the worker thread
    Downstream(ChannelEvent),
    /// Queue bytes for the socket
    Write {
        channel: Channel,
        data: Bytes,
        future: ChannelFuture,
    },
    Close {
        channel: Channel,
        future: ChannelFuture,
    },
    SetInterestOps {
        channel: Channel,
        ops: u8,
        future: ChannelFuture,
    },
    /// Re-apply the channel's socket options
    ApplyConfig { channel: Channel },
}

impl Task {
    /// Completes a task that can no longer run because the worker stopped.
    fn reject(self) {
        match self {
            Task::Register { channel, stream } => {
                drop(stream);
                channel.set_closed();
                debug!(channel = %channel.id(), "Dropped a connection registered after shutdown");
            }
            Task::Connect {
                channel, future, ..
            } => {
                let _ = future.set_failure(NetError::WorkerShutdown);
                channel.set_closed();
            }
            Task::Upstream(event) => {
                trace!(event = ?event, "Dropped an upstream event after shutdown");
            }
            Task::Downstream(event) => {
                let _ = event.future().set_failure(NetError::WorkerShutdown);
            }
            Task::Write { future, .. } => {
                let _ = future.set_failure(NetError::ChannelClosed);
            }
            Task::Close { channel, future } => {
                channel.set_closed();
                let _ = future.set_success();
            }
            Task::SetInterestOps { future, .. } => {
                let _ = future.set_failure(NetError::WorkerShutdown);
            }
            Task::ApplyConfig { .. } => {}
        }
    }
}

pub(crate) struct WorkerShared {
    id: usize,
    tasks: SegQueue<Task>,
    waker: Waker,
    thread: OnceLock<ThreadId>,
    /// Set when shutdown is requested
    shutdown: AtomicBool,
    /// Set once the loop has closed every connection
    terminated: AtomicBool,
}

/// A handle for submitting work to a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Returns true when called from this worker's own thread.
    pub fn is_current(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Asks the worker to stop. Returns immediately; the worker notices
    /// within one select timeout at the latest.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn execute(&self, task: Task) {
        if self.shared.terminated.load(Ordering::SeqCst) {
            task.reject();
            return;
        }
        self.shared.tasks.push(task);

        // The worker may have finished its final drain in the meantime
        if self.shared.terminated.load(Ordering::SeqCst) {
            while let Some(task) = self.shared.tasks.pop() {
                task.reject();
            }
            return;
        }
        if !self.is_current() {
            self.wake();
        }
    }

    /// Hands an accepted connection to this worker.
    pub(crate) fn register(&self, channel: Channel, stream: TcpStream) -> NetResult<()> {
        if self.is_shutdown() {
            drop(stream);
            channel.set_closed();
            return Err(NetError::WorkerShutdown);
        }
        self.execute(Task::Register { channel, stream });
        Ok(())
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!(worker = self.shared.id, error = %e, "Failed to wake worker");
        }
    }
}

struct PendingConnect {
    future: ChannelFuture,
    remote: SocketAddr,
    deadline: Option<Instant>,
}

struct Connection {
    channel: Channel,
    stream: TcpStream,
    writes: WriteQueue,
    /// Interest currently registered with the selector
    registered: Option<Interest>,
    connecting: Option<PendingConnect>,
}

impl Connection {
    fn desired_interest(&self) -> Option<Interest> {
        if self.connecting.is_some() {
            return Some(Interest::WRITABLE);
        }
        let read = self.channel.interest_ops() & OP_READ != 0;
        let write = !self.writes.is_empty();
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

fn token_of(channel: &Channel) -> Token {
    Token(channel.id().as_u64() as usize)
}

/// The event loop of one I/O thread.
pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    poll: Poll,
    config: ReactorConfig,
    connections: HashMap<Token, Connection>,
    connecting: HashSet<Token>,
    /// Connections that stopped reading because of the per-tick bound
    rescan: Vec<Token>,
}

impl Worker {
    pub(crate) fn new(id: usize, config: ReactorConfig) -> io::Result<(Worker, WorkerHandle)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(WorkerShared {
            id,
            tasks: SegQueue::new(),
            waker,
            thread: OnceLock::new(),
            shutdown: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        let handle = WorkerHandle {
            shared: Arc::clone(&shared),
        };
        let worker = Worker {
            shared,
            poll,
            config,
            connections: HashMap::new(),
            connecting: HashSet::new(),
            rescan: Vec::new(),
        };
        Ok((worker, handle))
    }

    pub(crate) fn run(mut self) {
        mark_io_thread();
        let _ = self.shared.thread.set(thread::current().id());
        debug!(worker = self.shared.id, "Worker started");

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            let timeout = if self.rescan.is_empty() {
                self.config.select_timeout
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != ErrorKind::Interrupted {
                    warn!(worker = self.shared.id, error = %e, "Unexpected error in the selector loop");
                    thread::sleep(Duration::from_secs(1));
                }
                continue;
            }

            self.run_tasks();

            let mut ready: Vec<(Token, bool, bool)> = events
                .iter()
                .filter(|event| event.token() != WAKER_TOKEN)
                .map(|event| {
                    let readable =
                        event.is_readable() || event.is_read_closed() || event.is_error();
                    let writable =
                        event.is_writable() || event.is_write_closed() || event.is_error();
                    (event.token(), readable, writable)
                })
                .collect();
            for token in std::mem::take(&mut self.rescan) {
                if !ready.iter().any(|(t, _, _)| *t == token) {
                    ready.push((token, true, false));
                }
            }
            for (token, readable, writable) in ready {
                self.process(token, readable, writable);
            }

            self.run_tasks();
            self.expire_connects();
        }

        self.shutdown();
        debug!(worker = self.shared.id, "Worker stopped");
    }

    fn run_tasks(&mut self) {
        while let Some(task) = self.shared.tasks.pop() {
            self.run_task(task);
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Register { channel, stream } => self.register(channel, stream),
            Task::Connect {
                channel,
                remote,
                future,
            } => self.connect(channel, remote, future),
            Task::Upstream(event) => {
                let pipeline = event.channel().pipeline().clone();
                pipeline.send_upstream(event);
            }
            Task::Downstream(event) => {
                let pipeline = event.channel().pipeline().clone();
                pipeline.send_downstream(event);
            }
            Task::Write {
                channel,
                data,
                future,
            } => self.write(channel, data, future),
            Task::Close { channel, future } => self.close(&channel, Some(future)),
            Task::SetInterestOps {
                channel,
                ops,
                future,
            } => self.set_interest_ops(channel, ops, future),
            Task::ApplyConfig { channel } => {
                if let Some(conn) = self.connections.get(&token_of(&channel)) {
                    let result = channel.with_config(|config| apply_socket_options(&conn.stream, config));
                    if let Err(e) = result {
                        warn!(channel = %channel.id(), error = %e, "Failed to apply socket options");
                    }
                }
            }
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn register(&mut self, channel: Channel, mut stream: TcpStream) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            Task::Register { channel, stream }.reject();
            return;
        }

        let token = token_of(&channel);
        if let Err(e) = channel.with_config(|config| apply_socket_options(&stream, config)) {
            debug!(channel = %channel.id(), error = %e, "Failed to apply socket options");
        }
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            warn!(channel = %channel.id(), error = %e, "Failed to register an accepted connection");
            channel.set_closed();
            return;
        }

        let local = stream.local_addr().ok();
        if let Some(local) = local {
            channel.set_local_address(local);
        }
        let remote = stream.peer_addr().ok();
        if let Some(remote) = remote {
            channel.set_remote_address(remote);
        }
        channel.set_bound();
        channel.set_connected();
        channel.update_interest_ops(OP_READ);

        self.connections.insert(
            token,
            Connection {
                channel: channel.clone(),
                stream,
                writes: WriteQueue::new(),
                registered: Some(Interest::READABLE),
                connecting: None,
            },
        );
        trace!(worker = self.shared.id, channel = %channel, "Registered connection");

        channel.fire_channel_open();
        if let Some(local) = local {
            channel.fire_channel_bound(local);
        }
        if let Some(remote) = remote {
            channel.fire_channel_connected(remote);
        }
    }

    fn connect(&mut self, channel: Channel, remote: SocketAddr, future: ChannelFuture) {
        let token = token_of(&channel);
        if self.connections.contains_key(&token) {
            let _ = future.set_failure(NetError::IllegalState(
                "channel is already connected".to_string(),
            ));
            return;
        }
        if !channel.is_open() {
            let _ = future.set_failure(NetError::ChannelClosed);
            return;
        }
        if future.is_cancelled() {
            self.close(&channel, None);
            return;
        }

        let registry = self.poll.registry();
        let result = TcpStream::connect(remote).and_then(|mut stream| {
            channel.with_config(|config| apply_socket_options(&stream, config))?;
            registry.register(&mut stream, token, Interest::WRITABLE)?;
            Ok(stream)
        });

        match result {
            Ok(stream) => {
                let deadline = channel
                    .with_config(|config| config.connect_timeout())
                    .map(|timeout| Instant::now() + timeout);
                self.connecting.insert(token);
                self.connections.insert(
                    token,
                    Connection {
                        channel,
                        stream,
                        writes: WriteQueue::new(),
                        registered: Some(Interest::WRITABLE),
                        connecting: Some(PendingConnect {
                            future,
                            remote,
                            deadline,
                        }),
                    },
                );
            }
            Err(e) => {
                let cause: Cause = Arc::new(NetError::Io(e));
                let _ = future.set_failure(cause.clone());
                channel.fire_exception_caught(cause);
                self.close(&channel, None);
            }
        }
    }

    fn finish_connect(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let outcome = match conn.stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match conn.stream.peer_addr() {
                Ok(remote) => Ok(remote),
                // Spurious wakeup, the handshake is still in progress
                Err(e) if e.kind() == ErrorKind::NotConnected => return,
                Err(e) => Err(e),
            },
        };

        let remote = match outcome {
            Ok(remote) => remote,
            Err(e) => {
                self.fail_connect(token, NetError::Io(e));
                return;
            }
        };

        let Some(pending) = conn.connecting.take() else {
            return;
        };
        let channel = conn.channel.clone();
        let local = conn.stream.local_addr().ok();
        self.connecting.remove(&token);

        if let Some(local) = local {
            channel.set_local_address(local);
        }
        channel.set_remote_address(remote);
        channel.set_bound();
        channel.set_connected();

        if let Err(e) = self.update_interest(token) {
            let cause: Cause = Arc::new(NetError::Io(e));
            let _ = pending.future.set_failure(cause.clone());
            channel.fire_exception_caught(cause);
            self.close(&channel, None);
            return;
        }

        let _ = pending.future.set_success();
        if let Some(local) = local {
            channel.fire_channel_bound(local);
        }
        channel.fire_channel_connected(remote);
        self.flush(token);
    }

    fn fail_connect(&mut self, token: Token, err: NetError) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let cause: Cause = Arc::new(err);
        if let Some(pending) = conn.connecting.take() {
            let _ = pending.future.set_failure(cause.clone());
        }
        let channel = conn.channel.clone();
        channel.fire_exception_caught(cause);
        self.close(&channel, None);
    }

    fn expire_connects(&mut self) {
        if self.connecting.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut cancelled = Vec::new();
        let mut timed_out = Vec::new();
        for token in &self.connecting {
            let Some(pending) = self
                .connections
                .get(token)
                .and_then(|conn| conn.connecting.as_ref())
            else {
                continue;
            };
            if pending.future.is_cancelled() {
                cancelled.push(*token);
            } else if pending.deadline.is_some_and(|deadline| now >= deadline) {
                timed_out.push((*token, pending.remote));
            }
        }

        for token in cancelled {
            if let Some(channel) = self.channel_of(token) {
                self.close(&channel, None);
            }
        }
        for (token, remote) in timed_out {
            self.fail_connect(token, NetError::ConnectTimeout(remote));
        }
    }

    // ========================================================================
    // I/O
    // ========================================================================

    fn process(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get(&token) else {
            return;
        };
        if conn.connecting.is_some() {
            if readable || writable {
                self.finish_connect(token);
            }
            return;
        }
        if readable && !self.read(token) {
            return;
        }
        if writable {
            self.flush(token);
        }
    }

    /// Reads until the socket is drained or the per-tick bound is hit.
    ///
    /// Returns false if the connection was closed.
    fn read(&mut self, token: Token) -> bool {
        for _ in 0..self.config.max_reads_per_tick {
            let Some(conn) = self.connections.get_mut(&token) else {
                return false;
            };
            if !conn.channel.is_readable() {
                return true;
            }
            let size = conn
                .channel
                .with_config(|config| config.receive_buffer_size())
                .unwrap_or(self.config.read_buffer_size);
            let mut buf = BytesMut::zeroed(size);
            let result = conn.stream.read(&mut buf);
            let channel = conn.channel.clone();

            match result {
                Ok(0) => {
                    trace!(channel = %channel.id(), "Peer closed the connection");
                    self.close(&channel, None);
                    return false;
                }
                Ok(n) => {
                    buf.truncate(n);
                    let remote = channel.remote_address();
                    channel
                        .pipeline()
                        .send_upstream(ChannelEvent::message(&channel, ChannelBuffer::from(buf), remote));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = NetError::Io(e);
                    if err.is_closed() {
                        debug!(channel = %channel.id(), error = %err, "Connection reset by peer");
                    }
                    channel.fire_exception_caught(err);
                    self.close(&channel, None);
                    return false;
                }
            }
        }
        self.rescan.push(token);
        true
    }

    fn write(&mut self, channel: Channel, data: Bytes, future: ChannelFuture) {
        let token = token_of(&channel);
        let Some(conn) = self.connections.get_mut(&token) else {
            let err = if channel.is_open() {
                NetError::IllegalState("channel is not connected".to_string())
            } else {
                NetError::ChannelClosed
            };
            let _ = future.set_failure(err);
            return;
        };

        let idle = conn.writes.is_empty();
        conn.writes.push(data, future);
        if idle && conn.connecting.is_none() {
            self.flush(token);
        }
    }

    fn flush(&mut self, token: Token) {
        let result = match self.connections.get_mut(&token) {
            Some(conn) if conn.connecting.is_none() => conn.writes.flush(&mut conn.stream),
            _ => return,
        };
        let result = result.and_then(|_| {
            self.update_interest(token)
                .map_err(|e| Arc::new(NetError::Io(e)))
        });
        if let Err(cause) = result {
            if let Some(channel) = self.channel_of(token) {
                channel.fire_exception_caught(cause);
                self.close(&channel, None);
            }
        }
    }

    fn set_interest_ops(&mut self, channel: Channel, ops: u8, future: ChannelFuture) {
        let current = channel.interest_ops();
        let ops = (ops & OP_READ) | (current & OP_WRITE);
        if ops == current {
            let _ = future.set_success();
            return;
        }
        channel.update_interest_ops(ops);

        let token = token_of(&channel);
        if self.connections.contains_key(&token) {
            if let Err(e) = self.update_interest(token) {
                let cause: Cause = Arc::new(NetError::Io(e));
                let _ = future.set_failure(cause.clone());
                channel.fire_exception_caught(cause);
                self.close(&channel, None);
                return;
            }
            if ops & OP_READ != 0 {
                self.rescan.push(token);
            }
        }

        let _ = future.set_success();
        channel.fire_interest_changed(ops);
    }

    /// Brings the selector registration and the channel's write bit in line
    /// with the connection's state.
    fn update_interest(&mut self, token: Token) -> io::Result<()> {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };

        let ops = conn.channel.interest_ops();
        let ops = if conn.writes.is_empty() {
            ops & !OP_WRITE
        } else {
            ops | OP_WRITE
        };
        conn.channel.update_interest_ops(ops);

        let desired = conn.desired_interest();
        if desired == conn.registered {
            return Ok(());
        }
        match (conn.registered, desired) {
            (None, Some(interest)) => registry.register(&mut conn.stream, token, interest)?,
            (Some(_), Some(interest)) => registry.reregister(&mut conn.stream, token, interest)?,
            (Some(_), None) => registry.deregister(&mut conn.stream)?,
            (None, None) => {}
        }
        conn.registered = desired;
        Ok(())
    }

    // ========================================================================
    // Close
    // ========================================================================

    fn channel_of(&self, token: Token) -> Option<Channel> {
        self.connections.get(&token).map(|conn| conn.channel.clone())
    }

    /// Closes a channel owned by this worker, registered or not.
    ///
    /// Pending writes and a pending connect fail with `ChannelClosed` in
    /// the order they were issued, then the close events fire.
    fn close(&mut self, channel: &Channel, future: Option<ChannelFuture>) {
        let token = token_of(channel);
        self.connecting.remove(&token);
        if let Some(mut conn) = self.connections.remove(&token) {
            if conn.registered.is_some() {
                if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                    debug!(channel = %channel.id(), error = %e, "Failed to deregister connection");
                }
            }
            let closed: Cause = Arc::new(NetError::ChannelClosed);
            if let Some(pending) = conn.connecting.take() {
                let _ = pending.future.set_failure(closed.clone());
            }
            conn.writes.fail_all(&closed);
            // Dropping the connection closes the socket
        }

        if let Some(future) = future {
            let _ = future.set_success();
        }
        if let Some(prior) = channel.set_closed() {
            channel.fire_close_sequence(prior);
        }
    }

    fn shutdown(&mut self) {
        let channels: Vec<Channel> = self
            .connections
            .values()
            .map(|conn| conn.channel.clone())
            .collect();
        if !channels.is_empty() {
            debug!(
                worker = self.shared.id,
                connections = channels.len(),
                "Closing connections on shutdown"
            );
        }

        for channel in &channels {
            self.flush(token_of(channel));
        }
        for channel in &channels {
            self.close(channel, None);
        }
        // Tasks queued by the close handlers still get a chance to run
        self.run_tasks();

        self.shared.terminated.store(true, Ordering::SeqCst);
        while let Some(task) = self.shared.tasks.pop() {
            task.reject();
        }
        if !self.connections.is_empty() {
            error!(
                worker = self.shared.id,
                connections = self.connections.len(),
                "Connections registered during shutdown were leaked"
            );
        }
    }
}
