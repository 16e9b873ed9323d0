//! Raw transports which sit underneath a push stream.
//!
//! A raw transport is the actual network connection (or an in-memory stand-in
//! for one). Socket-level controls such as timeouts, keep-alive and no-delay
//! only make sense at this layer, so [`RawTransport`] is the fixed set of
//! operations that [`SecretSocket`][crate::socket::SecretSocket] forwards
//! through the push stream to the transport beneath it.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::time::{Instant, Sleep};

pub mod duplex;
pub mod tcp;

/// Socket-level operations provided by a raw transport.
///
/// All methods take `&self`: the transport is owned by the push stream doing
/// I/O on it, and everyone else only holds a shared borrow.
pub trait RawTransport {
    /// Total bytes read from the wire.
    fn bytes_read(&self) -> u64;

    /// Total bytes written to the wire.
    fn bytes_written(&self) -> u64;

    /// Set the inactivity timeout. `None` disables it.
    ///
    /// The timer only runs while a read or write on the transport is pending.
    /// A transport nobody polls (a paused push stream with nothing to write)
    /// never times out.
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Enable or disable keep-alive probes, with an optional initial delay.
    fn set_keep_alive(&self, enable: bool, initial_delay: Option<Duration>) -> io::Result<()>;

    /// Enable or disable Nagle's algorithm.
    fn set_no_delay(&self, no_delay: bool) -> io::Result<()>;

    /// Increment the reference count of the transport.
    fn add_ref(&self);

    /// Decrement the reference count of the transport.
    fn unref(&self);

    /// Whether anything holds a reference to the transport.
    fn has_ref(&self) -> bool;

    /// Abruptly reset the connection, discarding any unsent data.
    fn reset_and_destroy(&self) -> io::Result<()>;
}

/// Control state shared between a transport's I/O path and its `&self`
/// control methods.
pub(crate) struct Controls {
    refs: AtomicUsize,
    timeout: Mutex<Option<Duration>>,
    timeout_changed: AtomicBool,
    reset: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    waker: AtomicWaker,
}

impl fmt::Debug for Controls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controls")
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("timeout", &*self.timeout.lock())
            .field("reset", &self.reset.load(Ordering::Relaxed))
            .field("bytes_read", &self.bytes_read.load(Ordering::Relaxed))
            .field("bytes_written", &self.bytes_written.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            // Connections start referenced, like a freshly opened socket.
            refs: AtomicUsize::new(1),
            timeout: Mutex::new(None),
            timeout_changed: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            waker: AtomicWaker::new(),
        }
    }
}

impl Controls {
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub(crate) fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::AcqRel);
    }

    pub(crate) fn record_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::AcqRel);
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock() = timeout;
        self.timeout_changed.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unref(&self) {
        let _ = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                refs.checked_sub(1)
            });
    }

    pub(crate) fn has_ref(&self) -> bool {
        self.refs.load(Ordering::Acquire) > 0
    }

    pub(crate) fn reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Fails with `ConnectionReset` once the transport has been reset.
    pub(crate) fn poll_reset(&self, cx: &mut Context<'_>) -> io::Result<()> {
        self.waker.register(cx.waker());
        if self.reset.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            ));
        }
        Ok(())
    }

    fn take_timeout_changed(&self) -> bool {
        self.timeout_changed.swap(false, Ordering::AcqRel)
    }
}

/// Inactivity timer driven from a transport's pending reads and writes.
#[derive(Debug, Default)]
pub(crate) struct IdleTimer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl IdleTimer {
    /// Restart the timer after activity on the transport.
    pub(crate) fn touch(&mut self, controls: &Controls) {
        if let (Some(sleep), Some(timeout)) = (self.sleep.as_mut(), controls.timeout()) {
            sleep.as_mut().reset(Instant::now() + timeout);
        }
    }

    /// Poll for expiry of the inactivity timeout.
    pub(crate) fn poll_expired(&mut self, cx: &mut Context<'_>, controls: &Controls) -> Poll<io::Error> {
        if controls.take_timeout_changed() {
            self.sleep = None;
        }

        let Some(timeout) = controls.timeout() else {
            self.sleep = None;
            return Poll::Pending;
        };

        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));

        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.sleep = None;
                tracing::debug!(?timeout, "transport idle timeout");
                Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_do_not_underflow() {
        let controls = Controls::default();
        assert!(controls.has_ref());

        controls.unref();
        controls.unref();
        assert!(!controls.has_ref());

        controls.add_ref();
        assert!(controls.has_ref());
    }

    #[tokio::test]
    async fn idle_timer_fires_after_timeout() {
        let controls = Controls::default();
        let mut timer = IdleTimer::default();

        let pending = std::future::poll_fn(|cx| Poll::Ready(timer.poll_expired(cx, &controls))).await;
        assert!(pending.is_pending());

        controls.set_timeout(Some(Duration::from_millis(50)));
        let error = std::future::poll_fn(|cx| timer.poll_expired(cx, &controls)).await;
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }
}
