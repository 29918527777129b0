//! netpipe line echo server
//!
//! A small server built on the framework: every line a client sends is
//! written back to it. Sending `QUIT` closes the connection.

use anyhow::Context;
use netpipe::bootstrap::ServerBootstrap;
use netpipe::channel::{
    ChannelHandler, ChannelHandlerContext, ChannelPipeline, ExceptionEvent, MessageEvent,
    SimpleChannelHandler, StateEvent,
};
use netpipe::codec::{DelimiterBasedFrameDecoder, FrameDecoder, StringDecoder, StringEncoder};
use netpipe::transport::{ReactorConfig, ServerSocketChannelFactory};
use netpipe::NetResult;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Number of I/O worker threads
    workers: usize,
    /// Longest accepted line, in bytes
    max_line: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: netpipe::DEFAULT_HOST.to_string(),
            port: netpipe::DEFAULT_PORT,
            workers: ReactorConfig::default().worker_count,
            max_line: 8192,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i).to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = parse_value(&args, i, "port number");
                    i += 2;
                }
                "--workers" | "-w" => {
                    config.workers = parse_value(&args, i, "worker count");
                    i += 2;
                }
                "--max-line" => {
                    config.max_line = parse_value(&args, i, "line length");
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("netpipe version {}", netpipe::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn value_of(args: &[String], i: usize) -> &str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", args[i]);
            std::process::exit(1);
        }
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, what: &str) -> T {
    value_of(args, i).parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid {}", what);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
netpipe - line echo server

USAGE:
    netpipe [OPTIONS]

OPTIONS:
    -h, --host <HOST>       Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>       Port to listen on (default: 7000)
    -w, --workers <N>       Number of I/O worker threads (default: 2 x CPUs)
        --max-line <BYTES>  Longest accepted line (default: 8192)
    -v, --version           Print version information
        --help              Print this help message

EXAMPLES:
    netpipe                        # Start on 127.0.0.1:7000
    netpipe --port 7001 -w 4       # Port 7001 with four workers

CONNECTING:
    $ nc 127.0.0.1 7000
    hello
    hello
    QUIT

Set RUST_LOG=debug to trace connections.
"#
    );
}

/// Connection counters shared by every channel
#[derive(Default)]
struct EchoStats {
    active: AtomicU64,
    total: AtomicU64,
    lines: AtomicU64,
}

/// Writes every received line back, newline-terminated.
struct EchoHandler {
    stats: Arc<EchoStats>,
}

impl SimpleChannelHandler for EchoHandler {
    fn channel_connected(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        debug!(channel = %e.channel.id(), remote = ?e.channel.remote_address(), "Client connected");
        ctx.send_upstream(e.into());
        Ok(())
    }

    fn message_received(&self, _ctx: &ChannelHandlerContext, e: MessageEvent) -> NetResult<()> {
        let Some(line) = e.message_ref::<String>() else {
            return Ok(());
        };
        self.stats.lines.fetch_add(1, Ordering::Relaxed);

        if line.trim().eq_ignore_ascii_case("quit") {
            let channel = e.channel.clone();
            e.channel
                .write("bye\n")
                .add_listener(move |_| {
                    channel.close();
                });
            return Ok(());
        }

        e.channel.write(format!("{}\n", line));
        Ok(())
    }

    fn exception_caught(&self, _ctx: &ChannelHandlerContext, e: ExceptionEvent) -> NetResult<()> {
        warn!(channel = %e.channel.id(), error = %e.cause, "Closing channel after error");
        e.channel.close();
        Ok(())
    }

    fn channel_disconnected(&self, ctx: &ChannelHandlerContext, e: StateEvent) -> NetResult<()> {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        debug!(channel = %e.channel.id(), "Client disconnected");
        ctx.send_upstream(e.into());
        Ok(())
    }
}

fn resolve(address: &str) -> anyhow::Result<SocketAddr> {
    address
        .to_socket_addrs()
        .with_context(|| format!("Invalid bind address {}", address))?
        .next()
        .with_context(|| format!("{} did not resolve to any address", address))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging; RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    let local = resolve(&config.bind_address())?;

    let reactor = ReactorConfig::default().with_worker_count(config.workers);
    let factory = Arc::new(ServerSocketChannelFactory::new(reactor)?);
    info!(workers = config.workers, "Worker pool started");

    let stats = Arc::new(EchoStats::default());
    let echo = Arc::new(EchoHandler {
        stats: Arc::clone(&stats),
    });
    let max_line = config.max_line;

    let mut bootstrap = ServerBootstrap::new(factory);
    bootstrap.set_pipeline_factory(Arc::new(move || -> NetResult<ChannelPipeline> {
        let pipeline = ChannelPipeline::new();
        pipeline.add_last(
            "framer",
            ChannelHandler::upstream(FrameDecoder::new(DelimiterBasedFrameDecoder::lines(
                max_line,
            )?)),
        )?;
        pipeline.add_last("decoder", ChannelHandler::upstream(StringDecoder))?;
        pipeline.add_last("encoder", ChannelHandler::downstream(StringEncoder))?;
        pipeline.add_last("echo", ChannelHandler::shared_upstream(Arc::clone(&echo)))?;
        Ok(pipeline)
    }));
    bootstrap.set_option("child.tcpNoDelay", true);
    bootstrap.set_option("child.keepAlive", true);

    let listener = bootstrap
        .bind_to(local)
        .with_context(|| format!("Failed to start server on {}", local))?;
    info!(
        version = netpipe::VERSION,
        address = %listener.local_address().unwrap_or(local),
        "Echo server listening"
    );

    signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("Shutdown signal received, stopping server...");

    listener.close().await?;
    bootstrap.release_external_resources();

    info!(
        connections = stats.total.load(Ordering::Relaxed),
        lines = stats.lines.load(Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}
