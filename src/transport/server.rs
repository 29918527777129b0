//! Server Socket Channels
//!
//! A [`ServerSocketChannelFactory`] creates listening channels. Binding one
//! opens the socket and starts its acceptor; closing it stops the acceptor,
//! which then fires UNBOUND and CLOSED.
//!
//! Listening channels are not owned by a worker, so their events run on the
//! thread that caused them: bind on the caller, child notifications on the
//! child's worker, close on the acceptor.

use crate::channel::{
    Channel, ChannelConfig, ChannelEvent, ChannelFactory, ChannelFuture, ChannelPipeline,
    ChannelSink, StateChange, StateEvent,
};
use crate::error::{NetError, NetResult};
use crate::transport::boss::{Boss, BossControl};
use crate::transport::config::ReactorConfig;
use crate::transport::pool::WorkerPool;
use crate::transport::socket::bind_listener;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

struct ServerShared {
    workers: Arc<WorkerPool>,
    bosses: Mutex<Vec<Arc<BossControl>>>,
    next_boss: AtomicUsize,
    released: AtomicBool,
}

/// Creates listening TCP channels served by a pool of workers.
pub struct ServerSocketChannelFactory {
    shared: Arc<ServerShared>,
}

impl ServerSocketChannelFactory {
    /// Starts a new worker pool for this factory.
    pub fn new(config: ReactorConfig) -> NetResult<Self> {
        Ok(Self::with_pool(Arc::new(WorkerPool::start(config)?)))
    }

    /// Uses an existing worker pool, possibly shared with other factories.
    pub fn with_pool(workers: Arc<WorkerPool>) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                workers,
                bosses: Mutex::new(Vec::new()),
                next_boss: AtomicUsize::new(0),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.shared.workers
    }
}

impl ChannelFactory for ServerSocketChannelFactory {
    fn new_channel(&self, pipeline: ChannelPipeline) -> NetResult<Channel> {
        if self.shared.released.load(Ordering::Acquire) {
            return Err(NetError::IllegalState(
                "channel factory has been released".to_string(),
            ));
        }
        let sink = ServerSocketSink {
            shared: Arc::clone(&self.shared),
            boss: Mutex::new(None),
        };
        let channel = Channel::new(
            self.shared.workers.ids().next(),
            None,
            pipeline,
            Arc::new(sink),
            None,
            ChannelConfig::default(),
        )?;
        channel.fire_channel_open();
        Ok(channel)
    }

    fn release_external_resources(&self) {
        self.shared.released.store(true, Ordering::Release);
        let bosses = std::mem::take(&mut *self.shared.bosses.lock().unwrap());
        for boss in &bosses {
            boss.request_close(None);
        }
        for boss in &bosses {
            boss.join();
        }
        self.shared.workers.shutdown();
    }
}

/// Sink of a listening channel.
struct ServerSocketSink {
    shared: Arc<ServerShared>,
    boss: Mutex<Option<Arc<BossControl>>>,
}

impl ServerSocketSink {
    fn bind(&self, channel: &Channel, future: ChannelFuture, local: SocketAddr) -> NetResult<()> {
        if self.boss.lock().unwrap().is_some() || channel.is_bound() {
            return Err(NetError::IllegalState(
                "listening channel is already bound".to_string(),
            ));
        }

        let listener = channel.with_config(|config| bind_listener(local, config))?;
        let bound = listener.local_addr()?;
        let acceptor = Boss::new(channel.clone(), listener, Arc::clone(&self.shared.workers))?;

        channel.set_local_address(bound);
        channel.set_bound();
        let _ = future.set_success();
        channel.fire_channel_bound(bound);

        // A handler may have closed the channel in response to BOUND
        if !channel.is_open() {
            return Ok(());
        }

        let name = format!(
            "{}-boss-{}",
            self.shared.workers.config().thread_name,
            self.shared.next_boss.fetch_add(1, Ordering::Relaxed)
        );
        match acceptor.start(name) {
            Ok(control) => {
                {
                    let mut bosses = self.shared.bosses.lock().unwrap();
                    bosses.retain(|boss| !boss.is_finished());
                    bosses.push(Arc::clone(&control));
                }
                *self.boss.lock().unwrap() = Some(Arc::clone(&control));
                if !channel.is_open() {
                    control.request_close(None);
                }
                info!(channel = %channel.id(), address = %bound, "Bound listening channel");
            }
            Err(e) => {
                error!(channel = %channel.id(), error = %e, "Failed to start the acceptor thread");
                channel.fire_exception_caught(NetError::Io(e));
                channel.close();
            }
        }
        Ok(())
    }

    fn close(&self, channel: &Channel, future: ChannelFuture) {
        let boss = self.boss.lock().unwrap().clone();
        match boss {
            Some(control) => control.request_close(Some(future)),
            None => {
                let _ = future.set_success();
                if let Some(prior) = channel.set_closed() {
                    channel.fire_close_sequence(prior);
                }
            }
        }
    }
}

impl ChannelSink for ServerSocketSink {
    fn event_sunk(&self, _pipeline: &ChannelPipeline, event: ChannelEvent) -> NetResult<()> {
        match event {
            ChannelEvent::State(StateEvent {
                channel,
                future,
                change,
            }) => match change {
                StateChange::Open(false) | StateChange::Bound(None) => {
                    self.close(&channel, future);
                    Ok(())
                }
                StateChange::Bound(Some(local)) => self.bind(&channel, future, local),
                StateChange::Open(true) => {
                    let _ = future.set_success();
                    Ok(())
                }
                StateChange::Connected(_) => {
                    Err(NetError::Unsupported("connecting a listening channel"))
                }
                StateChange::InterestOps(_) => Err(NetError::Unsupported(
                    "changing interest ops of a listening channel",
                )),
            },
            ChannelEvent::Message(_) => Err(NetError::Unsupported("writing to a listening channel")),
            ChannelEvent::Exception(_) | ChannelEvent::ChildState(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChannelBuffer;
    use crate::channel::{
        ChannelHandler, ChannelHandlerContext, ChildChannelStateEvent, ExceptionEvent,
        MessageEvent, SimpleChannelHandler,
    };
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn factory() -> ServerSocketChannelFactory {
        ServerSocketChannelFactory::new(
            ReactorConfig::default()
                .with_worker_count(2)
                .with_select_timeout(Duration::from_millis(50)),
        )
        .unwrap()
    }

    /// Writes every received buffer back to the sender.
    struct Echo;

    impl SimpleChannelHandler for Echo {
        fn message_received(&self, _ctx: &ChannelHandlerContext, e: MessageEvent) -> NetResult<()> {
            if let Ok(buffer) = e.message.downcast::<ChannelBuffer>() {
                e.channel.write(*buffer);
            }
            Ok(())
        }
    }

    /// Records child open/close notifications on the listening channel.
    #[derive(Default)]
    struct ChildTracker {
        events: Mutex<String>,
    }

    impl SimpleChannelHandler for ChildTracker {
        fn child_channel_open(
            &self,
            _ctx: &ChannelHandlerContext,
            _e: ChildChannelStateEvent,
        ) -> NetResult<()> {
            self.events.lock().unwrap().push('1');
            Ok(())
        }

        fn child_channel_closed(
            &self,
            _ctx: &ChannelHandlerContext,
            _e: ChildChannelStateEvent,
        ) -> NetResult<()> {
            self.events.lock().unwrap().push('2');
            Ok(())
        }

        fn exception_caught(&self, _ctx: &ChannelHandlerContext, _e: ExceptionEvent) -> NetResult<()> {
            Ok(())
        }
    }

    fn listening_channel(
        factory: &ServerSocketChannelFactory,
        tracker: Arc<ChildTracker>,
    ) -> Channel {
        let pipeline = ChannelPipeline::new();
        pipeline
            .add_last("tracker", ChannelHandler::shared_upstream(tracker))
            .unwrap();
        let channel = factory.new_channel(pipeline).unwrap();
        channel.set_pipeline_factory(Arc::new(|| -> NetResult<ChannelPipeline> {
            let pipeline = ChannelPipeline::new();
            pipeline.add_last("echo", ChannelHandler::upstream(Echo))?;
            Ok(pipeline)
        }));
        channel
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_echo_round_trip() {
        let factory = factory();
        let tracker = Arc::new(ChildTracker::default());
        let channel = listening_channel(&factory, tracker);
        channel
            .bind("127.0.0.1:0".parse().unwrap())
            .wait()
            .unwrap();
        let addr = channel.local_address().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"hello reactor").unwrap();

        let mut echoed = [0u8; 13];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello reactor");

        channel.close().wait().unwrap();
        factory.release_external_resources();
    }

    #[test]
    fn test_child_open_and_close_notifications() {
        let factory = factory();
        let tracker = Arc::new(ChildTracker::default());
        let channel = listening_channel(&factory, tracker.clone());
        channel
            .bind("127.0.0.1:0".parse().unwrap())
            .wait()
            .unwrap();

        let client = TcpStream::connect(channel.local_address().unwrap()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            tracker.events.lock().unwrap().as_str() == "1"
        }));
        drop(client);
        assert!(wait_until(Duration::from_secs(5), || {
            tracker.events.lock().unwrap().as_str() == "12"
        }));

        channel.close().wait().unwrap();
        factory.release_external_resources();
    }

    #[test]
    fn test_close_stops_acceptor_promptly() {
        let factory = factory();
        let channel = listening_channel(&factory, Arc::new(ChildTracker::default()));
        channel
            .bind("127.0.0.1:0".parse().unwrap())
            .wait()
            .unwrap();
        let addr = channel.local_address().unwrap();

        let start = Instant::now();
        channel.close().wait().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(!channel.is_open());
        assert!(!channel.is_bound());

        // The port is released
        std::net::TcpListener::bind(addr).unwrap();

        let start = Instant::now();
        factory.release_external_resources();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_closed_acceptors_are_not_retained() {
        let factory = factory();
        for _ in 0..5 {
            let channel = listening_channel(&factory, Arc::new(ChildTracker::default()));
            channel
                .bind("127.0.0.1:0".parse().unwrap())
                .wait()
                .unwrap();
            channel.close().wait().unwrap();
        }

        let live = listening_channel(&factory, Arc::new(ChildTracker::default()));
        live.bind("127.0.0.1:0".parse().unwrap()).wait().unwrap();
        {
            let bosses = factory.shared.bosses.lock().unwrap();
            assert_eq!(bosses.len(), 1);
            assert!(!bosses[0].is_finished());
        }

        live.close().wait().unwrap();
        factory.release_external_resources();
    }

    #[test]
    fn test_bind_failure_fails_future() {
        let factory = factory();
        let channel = listening_channel(&factory, Arc::new(ChildTracker::default()));

        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let future = channel.bind(taken.local_addr().unwrap());
        let cause = future.wait().unwrap_err();
        assert!(matches!(*cause, NetError::Io(_)));
        assert!(!channel.is_bound());

        channel.close().wait().unwrap();
        factory.release_external_resources();
    }

    #[test]
    fn test_listening_channel_rejects_writes() {
        let factory = factory();
        let channel = listening_channel(&factory, Arc::new(ChildTracker::default()));
        let future = channel.write(ChannelBuffer::from("nope"));
        assert!(matches!(*future.cause().unwrap(), NetError::Unsupported(_)));
        channel.close();
        factory.release_external_resources();
    }

    #[test]
    fn test_released_factory_refuses_channels() {
        let factory = factory();
        factory.release_external_resources();
        assert!(factory.new_channel(ChannelPipeline::new()).is_err());
    }
}
