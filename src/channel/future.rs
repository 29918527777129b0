//! Completion Futures
//!
//! A [`ChannelFuture`] is the result handle of an asynchronous channel
//! operation (bind, connect, write, close). It starts out pending and is
//! completed exactly once, either with success or with a [`Cause`].
//!
//! ## Observing Completion
//!
//! ```text
//!                    set_success / set_failure / cancel
//!   PENDING ───────────────────────────────────────────────> DONE
//!      │                                                      │
//!      │ add_listener: queued                                 │ add_listener: runs now
//!      │ wait: blocks                                         │ wait: returns now
//!      │ .await: registers waker                              │ .await: Ready
//! ```
//!
//! Listeners run synchronously on the thread that completes the future,
//! which is usually an I/O worker, so they must never block.

use crate::channel::channel::{Channel, WeakChannel};
use crate::error::{Cause, NetError, NetResult};
use crate::transport::is_io_thread;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::warn;

type Listener = Box<dyn FnOnce(&ChannelFuture) + Send>;

/// The handle of an asynchronous channel operation.
///
/// Cloning a future is cheap; all clones observe the same completion.
#[derive(Clone)]
pub struct ChannelFuture {
    inner: Arc<FutureInner>,
}

struct FutureInner {
    /// The channel the operation belongs to (non-owning)
    channel: Option<WeakChannel>,

    /// Whether `cancel()` may complete this future
    cancellable: bool,

    state: Mutex<FutureState>,

    /// Signalled once when the future completes
    done: Condvar,
}

#[derive(Default)]
struct FutureState {
    outcome: Option<Result<(), Cause>>,
    listeners: Vec<Listener>,
    wakers: Vec<Waker>,
}

impl ChannelFuture {
    /// Creates a pending future that is not tied to any channel.
    pub fn new(cancellable: bool) -> Self {
        Self::with_parts(None, cancellable, None)
    }

    /// Creates a pending future for an operation on `channel`.
    pub fn for_channel(channel: &Channel, cancellable: bool) -> Self {
        Self::with_parts(Some(channel.downgrade()), cancellable, None)
    }

    /// Creates a future that has already succeeded.
    pub fn succeeded(channel: &Channel) -> Self {
        Self::with_parts(Some(channel.downgrade()), false, Some(Ok(())))
    }

    /// Creates a future that has already failed.
    pub fn failed(channel: &Channel, cause: impl Into<Cause>) -> Self {
        Self::with_parts(Some(channel.downgrade()), false, Some(Err(cause.into())))
    }

    pub(crate) fn for_weak(channel: WeakChannel, outcome: Option<Result<(), Cause>>) -> Self {
        Self::with_parts(Some(channel), false, outcome)
    }

    fn with_parts(
        channel: Option<WeakChannel>,
        cancellable: bool,
        outcome: Option<Result<(), Cause>>,
    ) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                channel,
                cancellable,
                state: Mutex::new(FutureState {
                    outcome,
                    ..Default::default()
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// The channel this operation belongs to, if it is still alive.
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel.as_ref().and_then(WeakChannel::upgrade)
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.inner.state.lock().unwrap().outcome, Some(Ok(())))
    }

    /// Returns true if the future was completed by [`cancel`](Self::cancel).
    pub fn is_cancelled(&self) -> bool {
        matches!(
            &self.inner.state.lock().unwrap().outcome,
            Some(Err(cause)) if matches!(**cause, NetError::Cancelled)
        )
    }

    /// The failure cause, if the future failed.
    pub fn cause(&self) -> Option<Cause> {
        match &self.inner.state.lock().unwrap().outcome {
            Some(Err(cause)) => Some(Arc::clone(cause)),
            _ => None,
        }
    }

    /// The outcome, if the future is done.
    pub fn result(&self) -> Option<Result<(), Cause>> {
        self.inner.state.lock().unwrap().outcome.clone()
    }

    /// Marks the operation as successful and notifies listeners.
    ///
    /// Fails with [`NetError::IllegalState`] if the future is already done.
    pub fn set_success(&self) -> NetResult<()> {
        self.complete(Ok(()))
    }

    /// Marks the operation as failed and notifies listeners.
    ///
    /// Fails with [`NetError::IllegalState`] if the future is already done.
    pub fn set_failure(&self, cause: impl Into<Cause>) -> NetResult<()> {
        self.complete(Err(cause.into()))
    }

    /// Cancels the operation.
    ///
    /// Returns false if the future is not cancellable or already done.
    pub fn cancel(&self) -> bool {
        if !self.inner.cancellable {
            return false;
        }
        self.complete(Err(Arc::new(NetError::Cancelled))).is_ok()
    }

    fn complete(&self, outcome: Result<(), Cause>) -> NetResult<()> {
        let (listeners, wakers) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.outcome.is_some() {
                return Err(NetError::IllegalState(
                    "future has already been completed".to_string(),
                ));
            }
            state.outcome = Some(outcome);
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
            )
        };

        self.inner.done.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for listener in listeners {
            self.notify(listener);
        }
        Ok(())
    }

    /// Registers a callback invoked once when the future completes.
    ///
    /// If the future is already done the callback runs immediately on the
    /// calling thread.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&ChannelFuture) + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.outcome.is_none() {
                state.listeners.push(Box::new(listener));
                return;
            }
        }
        self.notify(Box::new(listener));
    }

    fn notify(&self, listener: Listener) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| listener(self))) {
            warn!(
                panic = %crate::channel::pipeline::panic_message(panic.as_ref()),
                "Future listener panicked"
            );
        }
    }

    /// Blocks until the future completes and returns its outcome.
    ///
    /// On an I/O worker thread this returns [`NetError::BlockingOperation`]
    /// immediately, since the worker itself is what completes futures.
    pub fn wait(&self) -> Result<(), Cause> {
        if is_io_thread() && !self.is_done() {
            return Err(Arc::new(NetError::BlockingOperation));
        }
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self.inner.done.wait(state).unwrap();
        }
    }

    /// Blocks for at most `timeout`.
    ///
    /// Returns `None` if the future is still pending when the time is up.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), Cause>> {
        if is_io_thread() && !self.is_done() {
            return Some(Err(Arc::new(NetError::BlockingOperation)));
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.inner.done.wait_timeout(state, deadline - now).unwrap().0;
        }
    }
}

impl Future for ChannelFuture {
    type Output = Result<(), Cause>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap();
        match &state.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for ChannelFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.result() {
            None => "pending".to_string(),
            Some(Ok(())) => "success".to_string(),
            Some(Err(cause)) => format!("failure({})", cause),
        };
        f.debug_struct("ChannelFuture")
            .field("state", &state)
            .field("cancellable", &self.inner.cancellable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_success_is_set_once() {
        let future = ChannelFuture::new(false);
        assert!(!future.is_done());

        future.set_success().unwrap();
        assert!(future.is_done());
        assert!(future.is_success());

        assert!(matches!(
            future.set_success(),
            Err(NetError::IllegalState(_))
        ));
        assert!(matches!(
            future.set_failure(NetError::ChannelClosed),
            Err(NetError::IllegalState(_))
        ));
        assert!(future.is_success());
    }

    #[test]
    fn test_failure_keeps_cause() {
        let future = ChannelFuture::new(false);
        future.set_failure(NetError::ChannelClosed).unwrap();

        assert!(!future.is_success());
        assert!(matches!(*future.cause().unwrap(), NetError::ChannelClosed));
        assert!(future.set_success().is_err());
    }

    #[test]
    fn test_listeners_fire_once() {
        let future = ChannelFuture::new(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let early = Arc::clone(&calls);
        future.add_listener(move |f| {
            assert!(f.is_success());
            early.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        future.set_success().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Late listeners run immediately with the final result
        let late = Arc::clone(&calls);
        future.add_listener(move |f| {
            assert!(f.is_success());
            late.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 11);

        let _ = future.set_success();
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_cancel() {
        let fixed = ChannelFuture::new(false);
        assert!(!fixed.cancel());
        assert!(!fixed.is_done());

        let future = ChannelFuture::new(true);
        assert!(future.cancel());
        assert!(future.is_cancelled());
        assert!(matches!(*future.cause().unwrap(), NetError::Cancelled));

        // Terminal futures ignore further cancellation
        assert!(!future.cancel());

        let done = ChannelFuture::new(true);
        done.set_success().unwrap();
        assert!(!done.cancel());
        assert!(done.is_success());
    }

    #[test]
    fn test_wait_across_threads() {
        let future = ChannelFuture::new(false);
        let completer = future.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.set_success().unwrap();
        });

        assert!(future.wait().is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let future = ChannelFuture::new(false);
        assert!(future.wait_timeout(Duration::from_millis(10)).is_none());

        future.set_failure(NetError::Cancelled).unwrap();
        let outcome = future.wait_timeout(Duration::from_millis(10)).unwrap();
        assert!(outcome.is_err());
    }

    #[test]
    fn test_await_with_block_on() {
        let future = ChannelFuture::new(false);
        let completer = future.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.set_success().unwrap();
        });

        let outcome = tokio_test::block_on(future);
        assert!(outcome.is_ok());
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_await_in_runtime() {
        let future = ChannelFuture::new(false);
        let completer = future.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer.set_failure(NetError::ChannelClosed).unwrap();
        });

        let cause = future.await.unwrap_err();
        assert!(cause.is_closed());
    }

    #[test]
    fn test_panicking_listener_does_not_poison() {
        let future = ChannelFuture::new(false);
        future.add_listener(|_| panic!("listener bug"));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        future.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        future.set_success().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(future.is_success());
    }
}
