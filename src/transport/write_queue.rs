//! Outbound Write Queue
//!
//! Each connection keeps the writes it could not push to the socket yet.
//! The queue is drained in order; a write's future completes only once its
//! last byte has been accepted by the socket.

use crate::channel::ChannelFuture;
use crate::error::{Cause, NetError};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write};
use std::sync::Arc;

struct PendingWrite {
    data: Bytes,
    future: ChannelFuture,
    /// Set once any byte of this write reached the socket
    started: bool,
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    pending: VecDeque<PendingWrite>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, data: Bytes, future: ChannelFuture) {
        self.pending.push_back(PendingWrite {
            data,
            future,
            started: false,
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Writes as much as the socket accepts, leaving the rest queued when
    /// the socket would block.
    ///
    /// On a hard I/O error the write in progress is failed with that error
    /// and the error is returned; the rest of the queue is left for the
    /// caller to fail when it closes the connection.
    pub(crate) fn flush<W: Write>(&mut self, socket: &mut W) -> Result<(), Cause> {
        while let Some(head) = self.pending.front_mut() {
            if !head.started && head.future.is_cancelled() {
                self.pending.pop_front();
                continue;
            }

            while head.data.has_remaining() {
                match socket.write(head.data.chunk()) {
                    Ok(0) => {
                        let cause: Cause =
                            Arc::new(NetError::Io(io::Error::from(ErrorKind::WriteZero)));
                        let _ = head.future.set_failure(cause.clone());
                        self.pending.pop_front();
                        return Err(cause);
                    }
                    Ok(n) => {
                        head.data.advance(n);
                        head.started = true;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        return Ok(());
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let cause: Cause = Arc::new(NetError::Io(e));
                        let _ = head.future.set_failure(cause.clone());
                        self.pending.pop_front();
                        return Err(cause);
                    }
                }
            }

            if let Some(done) = self.pending.pop_front() {
                let _ = done.future.set_success();
            }
        }
        Ok(())
    }

    /// Fails every queued write, oldest first.
    pub(crate) fn fail_all(&mut self, cause: &Cause) {
        for write in self.pending.drain(..) {
            let _ = write.future.set_failure(cause.clone());
        }
    }
}
