//! Client Socket Channels
//!
//! A [`ClientSocketChannelFactory`] creates outbound channels. Each one is
//! pinned to a worker when it is created; `connect` hands the non-blocking
//! connect to that worker, which completes the future once the handshake
//! finishes, fails, or runs past `connectTimeoutMillis`.

use crate::channel::{Channel, ChannelConfig, ChannelFactory, ChannelPipeline};
use crate::error::{NetError, NetResult};
use crate::transport::config::ReactorConfig;
use crate::transport::pool::WorkerPool;
use crate::transport::socket_sink::SocketSink;
use std::sync::Arc;
use tracing::debug;

/// Creates outbound TCP channels served by a pool of workers.
pub struct ClientSocketChannelFactory {
    workers: Arc<WorkerPool>,
}

impl ClientSocketChannelFactory {
    /// Starts a new worker pool for this factory.
    pub fn new(config: ReactorConfig) -> NetResult<Self> {
        Ok(Self::with_pool(Arc::new(WorkerPool::start(config)?)))
    }

    /// Uses an existing worker pool, possibly shared with other factories.
    pub fn with_pool(workers: Arc<WorkerPool>) -> Self {
        Self { workers }
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }
}

impl ChannelFactory for ClientSocketChannelFactory {
    fn new_channel(&self, pipeline: ChannelPipeline) -> NetResult<Channel> {
        let worker = self.workers.next_worker().clone();
        if worker.is_shutdown() {
            return Err(NetError::WorkerShutdown);
        }
        let channel = Channel::new(
            self.workers.ids().next(),
            None,
            pipeline,
            Arc::new(SocketSink),
            Some(worker),
            ChannelConfig::default(),
        )?;
        debug!(channel = %channel.id(), "Created client channel");
        channel.fire_channel_open();
        Ok(channel)
    }

    fn release_external_resources(&self) {
        self.workers.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChannelBuffer;
    use crate::channel::{
        ChannelHandler, ChannelHandlerContext, ExceptionEvent, MessageEvent, OptionValue,
        SimpleChannelHandler,
    };
    use std::io::{Read, Write};
    use socket2::{Domain, Socket, Type};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::Mutex;
    use std::time::Duration;

    fn factory() -> ClientSocketChannelFactory {
        ClientSocketChannelFactory::new(
            ReactorConfig::default()
                .with_worker_count(1)
                .with_select_timeout(Duration::from_millis(50)),
        )
        .unwrap()
    }

    /// Collects received bytes and swallows exceptions.
    #[derive(Default)]
    struct Collect {
        received: Mutex<Vec<u8>>,
    }

    impl SimpleChannelHandler for Collect {
        fn message_received(&self, _ctx: &ChannelHandlerContext, e: MessageEvent) -> NetResult<()> {
            if let Some(buffer) = e.message_ref::<ChannelBuffer>() {
                self.received
                    .lock()
                    .unwrap()
                    .extend_from_slice(buffer.as_readable());
            }
            Ok(())
        }

        fn exception_caught(&self, _ctx: &ChannelHandlerContext, _e: ExceptionEvent) -> NetResult<()> {
            Ok(())
        }
    }

    /// A listener that never accepts and whose accept queue is already full,
    /// so further handshakes go unanswered.
    struct StalledListener {
        addr: SocketAddr,
        _socket: Socket,
        _queued: Vec<std::net::TcpStream>,
    }

    fn stalled_listener() -> StalledListener {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&bind.into()).unwrap();
        socket.listen(0).unwrap();
        let addr = socket.local_addr().unwrap().as_socket().unwrap();

        let mut queued = Vec::new();
        loop {
            match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(stream) => queued.push(stream),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => panic!("unexpected connect failure: {}", e),
            }
            assert!(queued.len() < 64, "accept queue never filled");
        }
        StalledListener {
            addr,
            _socket: socket,
            _queued: queued,
        }
    }

    fn client_channel(factory: &ClientSocketChannelFactory, collect: Arc<Collect>) -> Channel {
        let pipeline = ChannelPipeline::new();
        pipeline
            .add_last("collect", ChannelHandler::shared_upstream(collect))
            .unwrap();
        factory.new_channel(pipeline).unwrap()
    }

    #[test]
    fn test_connect_write_and_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 4];
            socket.read_exact(&mut request).unwrap();
            socket.write_all(b"pong").unwrap();
            request
        });

        let factory = factory();
        let collect = Arc::new(Collect::default());
        let channel = client_channel(&factory, collect.clone());

        let connect = channel.connect(addr);
        // Queued behind the connect on the same worker
        let write = channel.write(ChannelBuffer::from("ping"));
        connect.wait().unwrap();
        write.wait().unwrap();
        assert!(channel.is_connected());
        assert_eq!(channel.remote_address(), Some(addr));

        assert_eq!(&server.join().unwrap(), b"ping");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while collect.received.lock().unwrap().len() < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(collect.received.lock().unwrap().as_slice(), b"pong");

        channel.close().wait().unwrap();
        assert!(!channel.is_open());
        factory.release_external_resources();
    }

    #[test]
    fn test_connect_refused_fails_future() {
        let addr: SocketAddr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let factory = factory();
        let channel = client_channel(&factory, Arc::new(Collect::default()));
        let cause = channel.connect(addr).wait().unwrap_err();
        assert!(matches!(*cause, NetError::Io(_)));

        channel.close_future().wait().unwrap();
        assert!(!channel.is_open());
        factory.release_external_resources();
    }

    #[test]
    fn test_connect_timeout() {
        let factory = factory();
        let channel = client_channel(&factory, Arc::new(Collect::default()));
        channel
            .set_option("connectTimeoutMillis", OptionValue::Int(100))
            .unwrap();

        let stalled = stalled_listener();
        let future = channel.connect(stalled.addr);
        let outcome = future.wait_timeout(Duration::from_secs(5));
        let cause = outcome.expect("connect completes").unwrap_err();
        assert!(matches!(*cause, NetError::ConnectTimeout(_)));
        channel
            .close_future()
            .wait_timeout(Duration::from_secs(5))
            .expect("channel closes")
            .unwrap();
        factory.release_external_resources();
    }

    #[test]
    fn test_cancelled_connect_closes_channel() {
        let factory = factory();
        let channel = client_channel(&factory, Arc::new(Collect::default()));

        let stalled = stalled_listener();
        let future = channel.connect(stalled.addr);
        assert!(future.cancel());
        assert!(future.is_cancelled());
        channel
            .close_future()
            .wait_timeout(Duration::from_secs(5))
            .expect("channel closes")
            .unwrap();
        factory.release_external_resources();
    }

    #[test]
    fn test_write_before_connect_fails() {
        let factory = factory();
        let channel = client_channel(&factory, Arc::new(Collect::default()));
        let cause = channel
            .write(ChannelBuffer::from("early"))
            .wait()
            .unwrap_err();
        assert!(matches!(*cause, NetError::IllegalState(_)));
        channel.close();
        factory.release_external_resources();
    }

    #[test]
    fn test_new_channel_after_release() {
        let factory = factory();
        factory.release_external_resources();
        assert!(matches!(
            factory.new_channel(ChannelPipeline::new()),
            Err(NetError::WorkerShutdown)
        ));
    }
}
