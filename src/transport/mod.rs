//! Transport Module
//!
//! The non-blocking TCP transport: a pool of I/O workers, each multiplexing
//! many connections over one readiness selector, and one acceptor thread per
//! listening channel that hands new connections to the workers round-robin.
//!
//! ## Threads
//!
//! ```text
//!                     ┌──────────────────┐
//!   connect() ──────> │  acceptor (boss) │  one per listening channel
//!                     └────────┬─────────┘
//!                              │ register (round-robin)
//!            ┌─────────────────┼─────────────────┐
//!            ▼                 ▼                 ▼
//!     ┌────────────┐    ┌────────────┐    ┌────────────┐
//!     │  worker 0  │    │  worker 1  │    │  worker N  │   readiness loop,
//!     │ poll+tasks │    │ poll+tasks │    │ poll+tasks │   reads, writes,
//!     └────────────┘    └────────────┘    └────────────┘   handler dispatch
//! ```
//!
//! A connection stays on the worker it was registered with for its whole
//! life. Other threads talk to a worker only through its task queue.

pub(crate) mod boss;
pub mod client;
pub mod config;
pub mod pool;
pub mod server;
mod socket;
mod socket_sink;
pub(crate) mod worker;
mod write_queue;

// Re-export commonly used types
pub use client::ClientSocketChannelFactory;
pub use config::ReactorConfig;
pub use pool::WorkerPool;
pub use server::ServerSocketChannelFactory;
pub use worker::WorkerHandle;

use std::cell::Cell;

thread_local! {
    static IO_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Returns true on a transport worker thread.
///
/// Blocking on a future from such a thread would stall every channel the
/// worker owns.
pub fn is_io_thread() -> bool {
    IO_THREAD.with(Cell::get)
}

pub(crate) fn mark_io_thread() {
    IO_THREAD.with(|flag| flag.set(true));
}
