//! Reactor Configuration
//!
//! Tunables shared by the acceptors and workers of a socket channel factory.

use crate::error::{NetError, NetResult};
use std::time::Duration;

/// Default number of bytes requested per socket read (8 KB)
pub const DEFAULT_READ_SIZE: usize = 8 * 1024;

/// Configuration of a worker pool and its acceptors.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of I/O worker threads
    pub worker_count: usize,

    /// Upper bound on a worker's readiness wait; also bounds how long a
    /// shutdown request can go unnoticed
    pub select_timeout: Duration,

    /// Upper bound on an acceptor's readiness wait
    pub accept_poll_timeout: Duration,

    /// Pause after an unexpected accept failure before accepting again
    pub accept_backoff: Duration,

    /// Reads performed for one channel before yielding to the others
    pub max_reads_per_tick: usize,

    /// Read size used when a channel has no `receiveBufferSize`
    pub read_buffer_size: usize,

    /// Prefix of the worker and acceptor thread names
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_count: cpus * 2,
            select_timeout: Duration::from_millis(500),
            accept_poll_timeout: Duration::from_secs(1),
            accept_backoff: Duration::from_secs(1),
            max_reads_per_tick: 16,
            read_buffer_size: DEFAULT_READ_SIZE,
            thread_name: "netpipe".to_string(),
        }
    }
}

impl ReactorConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Checks that every tunable is usable.
    pub fn validate(&self) -> NetResult<()> {
        if self.worker_count == 0 {
            return Err(NetError::invalid_option("workerCount", "must be at least 1"));
        }
        if self.select_timeout.is_zero() {
            return Err(NetError::invalid_option("selectTimeout", "must not be zero"));
        }
        if self.accept_poll_timeout.is_zero() {
            return Err(NetError::invalid_option(
                "acceptPollTimeout",
                "must not be zero",
            ));
        }
        if self.max_reads_per_tick == 0 {
            return Err(NetError::invalid_option(
                "maxReadsPerTick",
                "must be at least 1",
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(NetError::invalid_option(
                "readBufferSize",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
