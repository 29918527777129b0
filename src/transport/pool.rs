//! Worker Pool
//!
//! A fixed set of I/O workers. New connections are spread over them
//! round-robin; each worker runs on its own named thread.

use crate::channel::ChannelIdGenerator;
use crate::error::NetResult;
use crate::transport::config::ReactorConfig;
use crate::transport::worker::{Worker, WorkerHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Ids of every channel served by this pool; they double as selector
    /// tokens, so they must not collide across factories sharing the pool
    ids: ChannelIdGenerator,
    config: ReactorConfig,
}

impl WorkerPool {
    /// Starts `config.worker_count` workers.
    pub fn start(config: ReactorConfig) -> NetResult<WorkerPool> {
        config.validate()?;

        let mut pool = WorkerPool {
            workers: Vec::with_capacity(config.worker_count),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::with_capacity(config.worker_count)),
            ids: ChannelIdGenerator::default(),
            config,
        };

        // On error the partially built pool is dropped, which stops the
        // workers started so far
        for id in 0..pool.config.worker_count {
            let (worker, handle) = Worker::new(id, pool.config.clone())?;
            let thread = thread::Builder::new()
                .name(format!("{}-worker-{}", pool.config.thread_name, id))
                .spawn(move || worker.run())?;
            pool.workers.push(handle);
            pool.threads.get_mut().unwrap().push(thread);
        }

        info!(workers = pool.workers.len(), "Worker pool started");
        Ok(pool)
    }

    /// Picks the worker for the next channel, round-robin.
    pub fn next_worker(&self) -> &WorkerHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub(crate) fn ids(&self) -> &ChannelIdGenerator {
        &self.ids
    }

    /// Stops every worker and waits for their threads to exit.
    ///
    /// Called from a worker thread, that thread is signalled but not joined.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    fn small_pool(workers: usize) -> WorkerPool {
        WorkerPool::start(
            ReactorConfig::default()
                .with_worker_count(workers)
                .with_select_timeout(Duration::from_millis(50)),
        )
        .unwrap()
    }

    #[test]
    fn test_round_robin_fairness() {
        let pool = small_pool(3);
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..30 {
            *counts.entry(pool.next_worker().id()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|count| *count == 10));
    }

    #[test]
    fn test_shutdown_is_prompt() {
        let pool = small_pool(2);
        let start = Instant::now();
        pool.shutdown();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(pool.workers().iter().all(WorkerHandle::is_shutdown));

        // A second shutdown is harmless
        pool.shutdown();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = WorkerPool::start(ReactorConfig::default().with_worker_count(0));
        assert!(result.is_err());
    }
}
