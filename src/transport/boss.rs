//! Acceptor
//!
//! Each bound listening channel gets one acceptor ("boss") thread. It waits
//! for incoming connections, builds a pipeline for each one with the
//! listening channel's pipeline factory, and registers the new child channel
//! with the next worker.
//!
//! ```text
//!   loop {
//!       wait (poll timeout, or the remaining backoff)
//!       close requested?        ──> stop
//!       accept until WouldBlock
//!           ok     ──> build pipeline ──> child channel ──> next worker
//!           failed ──> warn, back off, accept again later
//!   }
//!   stop: release the port, complete close futures, fire UNBOUND + CLOSED
//! ```

use crate::channel::{Channel, ChannelConfig, ChannelFuture};
use crate::error::{NetError, NetResult};
use crate::transport::pool::WorkerPool;
use crate::transport::socket_sink::SocketSink;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Shared between an acceptor thread and whoever asks it to stop.
pub(crate) struct BossControl {
    closed: AtomicBool,
    finished: AtomicBool,
    waker: Waker,
    close_futures: Mutex<Vec<ChannelFuture>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BossControl {
    /// Asks the acceptor to stop; `future` completes once it has.
    pub(crate) fn request_close(&self, future: Option<ChannelFuture>) {
        let mut pending = self.close_futures.lock().unwrap();
        if self.finished.load(Ordering::Acquire) {
            drop(pending);
            if let Some(future) = future {
                let _ = future.set_success();
            }
            return;
        }
        pending.extend(future);
        drop(pending);

        self.closed.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }
    }

    /// True once the acceptor has released its port and fired CLOSED.
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Waits for the acceptor thread to exit.
    pub(crate) fn join(&self) {
        let Some(handle) = self.thread.lock().unwrap().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Acceptor thread panicked");
        }
    }
}

pub(crate) struct Boss {
    channel: Channel,
    listener: TcpListener,
    poll: Poll,
    workers: Arc<WorkerPool>,
    control: Arc<BossControl>,
    backoff_until: Option<Instant>,
}

impl Boss {
    /// Prepares an acceptor for `listener`. Nothing runs until
    /// [`start`](Self::start).
    pub(crate) fn new(
        channel: Channel,
        mut listener: TcpListener,
        workers: Arc<WorkerPool>,
    ) -> io::Result<Boss> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let control = Arc::new(BossControl {
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            waker,
            close_futures: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
        });
        Ok(Boss {
            channel,
            listener,
            poll,
            workers,
            control,
            backoff_until: None,
        })
    }

    pub(crate) fn control(&self) -> Arc<BossControl> {
        Arc::clone(&self.control)
    }

    /// Spawns the acceptor thread.
    pub(crate) fn start(self, name: String) -> io::Result<Arc<BossControl>> {
        let control = self.control();
        let handle = thread::Builder::new().name(name).spawn(move || self.run())?;
        *control.thread.lock().unwrap() = Some(handle);
        Ok(control)
    }

    fn run(mut self) {
        let local = self.channel.local_address();
        info!(channel = %self.channel.id(), address = ?local, "Acceptor started");

        let config = self.workers.config().clone();
        let mut events = Events::with_capacity(128);
        while !self.control.closed.load(Ordering::Acquire) {
            let timeout = match self.backoff_until {
                Some(until) => until
                    .saturating_duration_since(Instant::now())
                    .min(config.accept_poll_timeout),
                None => config.accept_poll_timeout,
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != ErrorKind::Interrupted {
                    warn!(error = %e, "Failed to poll the listening socket");
                    self.backoff_until = Some(Instant::now() + config.accept_backoff);
                }
                continue;
            }
            if self.control.closed.load(Ordering::Acquire) {
                break;
            }

            match self.backoff_until {
                Some(until) if Instant::now() < until => continue,
                Some(_) => self.backoff_until = None,
                None => {
                    if !events.iter().any(|event| event.token() == LISTENER) {
                        continue;
                    }
                }
            }
            self.accept_all(config.accept_backoff);
        }

        self.finish();
    }

    fn accept_all(&mut self, backoff: Duration) {
        loop {
            match self.listener.accept() {
                Ok((stream, remote)) => self.hand_off(stream, remote),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(channel = %self.channel.id(), error = %e, "Failed to accept a connection");
                    self.backoff_until = Some(Instant::now() + backoff);
                    return;
                }
            }
        }
    }

    /// Builds the child channel for an accepted connection and registers it
    /// with the next worker. On failure the connection is closed.
    fn hand_off(&self, stream: TcpStream, remote: SocketAddr) {
        let result = self.child_channel(stream);
        match result {
            Ok(child) => debug!(parent = %self.channel.id(), child = %child.id(), %remote, "Accepted connection"),
            Err(e) => warn!(
                channel = %self.channel.id(),
                %remote,
                error = %e,
                "Failed to initialize an accepted socket"
            ),
        }
    }

    fn child_channel(&self, stream: TcpStream) -> NetResult<Channel> {
        let factory = self.channel.config().pipeline_factory().ok_or_else(|| {
            NetError::PipelineInit("listening channel has no pipeline factory".to_string())
        })?;
        let pipeline = factory.get_pipeline().map_err(|e| match e {
            NetError::PipelineInit(_) => e,
            other => NetError::PipelineInit(other.to_string()),
        })?;

        let worker = self.workers.next_worker().clone();
        let child = Channel::new(
            self.workers.ids().next(),
            Some(&self.channel),
            pipeline,
            Arc::new(SocketSink),
            Some(worker.clone()),
            ChannelConfig::default(),
        )?;
        worker.register(child.clone(), stream)?;
        Ok(child)
    }

    fn finish(self) {
        let Boss {
            channel,
            mut listener,
            poll,
            control,
            ..
        } = self;

        if let Err(e) = poll.registry().deregister(&mut listener) {
            debug!(error = %e, "Failed to deregister the listening socket");
        }
        drop(listener);

        let futures = {
            let mut pending = control.close_futures.lock().unwrap();
            control.finished.store(true, Ordering::Release);
            std::mem::take(&mut *pending)
        };

        let prior = channel.set_closed();
        for future in futures {
            let _ = future.set_success();
        }
        if let Some(prior) = prior {
            channel.fire_close_sequence(prior);
        }
        info!(channel = %channel.id(), "Acceptor stopped");
    }
}
