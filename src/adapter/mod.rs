//! Pull-based duplex streams over push-based sources.
//!
//! [`DuplexAdapter`] owns a [`PushStream`] and exposes it through
//! [`AsyncRead`] and [`AsyncWrite`]. Push events are drained whenever the
//! adapter is polled: data is buffered up to a high-water mark (pausing the
//! push stream beyond it), write acceptance is turned into `Poll::Pending`
//! until the next `Drain`, and the push stream's `End`, `Finish`, `Error` and
//! `Close` events are folded into a single lifecycle which closes exactly once.

use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf as _, Bytes};
use futures_util::task::{waker_ref, ArcWake, AtomicWaker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use crate::error::{ConfigError, StreamError};
use crate::notify::{self, CloseListener};
use crate::push::{PushEvent, PushStream};

pub mod gate;

use self::gate::Gate;

/// Configuration for a [`DuplexAdapter`].
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Once this many bytes are buffered on the read side, the push stream is
    /// paused until the reader catches up.
    pub read_high_water_mark: usize,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            read_high_water_mark: 16 * 1024,
        }
    }
}

impl AdapterOptions {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.read_high_water_mark == 0 {
            return Err(ConfigError::new("read high-water mark must be non-zero"));
        }
        Ok(())
    }
}

/// Where an adapter is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Reading and writing are possible (each direction may be half-closed).
    Open,

    /// Teardown has started; waiting for the push stream to close.
    Closing,

    /// Closed. Nothing further happens.
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Open => f.write_str("open"),
            Lifecycle::Closing => f.write_str("closing"),
            Lifecycle::Closed => f.write_str("closed"),
        }
    }
}

/// Fans one push stream wakeup out to every waiter on the adapter.
#[derive(Debug, Default)]
struct WakerProxy {
    read: AtomicWaker,
    write: AtomicWaker,
    closed: AtomicWaker,
}

impl WakerProxy {
    fn wake_all(&self) {
        self.read.wake();
        self.write.wake();
        self.closed.wake();
    }
}

impl ArcWake for WakerProxy {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wake_all();
    }
}

/// Push events the adapter is subscribed to.
#[derive(Debug, Default)]
struct Listeners {
    data: bool,
    error: bool,
    close: bool,
    end: bool,
}

impl Listeners {
    fn attached() -> Self {
        Self {
            data: false,
            error: true,
            close: true,
            end: true,
        }
    }

    fn detach(&mut self) {
        trace!(data = self.data, "detaching push listeners");
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
struct Readable {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    ended: bool,
}

#[derive(Debug)]
enum EndState {
    NotStarted,
    Pending(Gate<Result<(), StreamError>>),
    Done(Result<(), StreamError>),
}

#[derive(Debug)]
struct Writable {
    awaiting_drain: bool,
    end: EndState,
    destroy_soon: bool,
}

#[derive(Debug, Default)]
struct Teardown {
    reason: Option<StreamError>,
    captured: Option<StreamError>,
}

/// Presents a [`PushStream`] as an `AsyncRead + AsyncWrite` stream.
///
/// The adapter is driven entirely by polling: every read, write, flush,
/// shutdown or close poll first drains pending push events. The push stream
/// starts paused and is only resumed once something reads from the adapter.
///
/// Half-closing the write side ([`poll_end`](Self::poll_end) or
/// `poll_shutdown`) leaves the read side untouched, so a peer's response can
/// still be read after the request has been sent.
///
/// After the push stream fails, the first read returns the error and later
/// reads report end of stream. Writes, flushes and half-close return the
/// captured error.
#[derive(Debug)]
pub struct DuplexAdapter<P> {
    push: P,
    options: AdapterOptions,
    listeners: Listeners,
    readable: Readable,
    writable: Writable,
    teardown: Option<Teardown>,
    lifecycle: Lifecycle,
    error: Option<StreamError>,
    read_error_taken: bool,
    wakers: Arc<WakerProxy>,
    notify: notify::Sender,
    listener: CloseListener,
}

impl<P: PushStream> DuplexAdapter<P> {
    /// Wrap `push` with default options.
    pub fn new(push: P) -> Self {
        Self::build(push, AdapterOptions::default())
    }

    /// Wrap `push` with custom options.
    pub fn with_options(push: P, options: AdapterOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self::build(push, options))
    }

    /// Construct with options which have already been validated.
    pub(crate) fn build(push: P, options: AdapterOptions) -> Self {
        let (notify, listener) = notify::channel();
        trace!(hwm = options.read_high_water_mark, "adapter created");
        Self {
            push,
            options,
            listeners: Listeners::attached(),
            readable: Readable::default(),
            writable: Writable {
                awaiting_drain: false,
                end: EndState::NotStarted,
                destroy_soon: false,
            },
            teardown: None,
            lifecycle: Lifecycle::Open,
            error: None,
            read_error_taken: false,
            wakers: Arc::new(WakerProxy::default()),
            notify,
            listener,
        }
    }

    /// The wrapped push stream.
    pub fn push(&self) -> &P {
        &self.push
    }

    /// The options this adapter was built with.
    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    /// Current lifecycle stage.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Whether the peer has finished sending.
    pub fn is_read_ended(&self) -> bool {
        self.readable.ended
    }

    /// A listener which resolves when this adapter closes.
    pub fn close_listener(&self) -> CloseListener {
        self.listener.clone()
    }

    /// Drain every push event which is ready.
    fn pump(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }

        let wakers = self.wakers.clone();
        let waker = waker_ref(&wakers);
        let mut cx = Context::from_waker(&waker);

        while self.lifecycle != Lifecycle::Closed {
            match self.push.poll_event(&mut cx) {
                Poll::Ready(Some(event)) => self.dispatch(event),
                Poll::Ready(None) => {
                    trace!("push stream exhausted without close");
                    self.on_close();
                }
                Poll::Pending => break,
            }
        }
    }

    fn dispatch(&mut self, event: PushEvent) {
        trace!(event = event.name(), "push event");
        match event {
            PushEvent::Data(chunk) => self.on_data(chunk),
            PushEvent::Drain => {
                if self.writable.awaiting_drain {
                    self.writable.awaiting_drain = false;
                    self.wakers.write.wake();
                    self.advance_destroy_soon();
                }
            }
            PushEvent::End if self.listeners.end => self.on_end(),
            PushEvent::Finish => {
                if let EndState::Pending(gate) = &mut self.writable.end {
                    if gate.resolve(Ok(())) {
                        trace!("half-close finished");
                    }
                }
                self.wakers.write.wake();
                self.advance_destroy_soon();
            }
            PushEvent::Error(error) if self.listeners.error => self.on_error(error.into()),
            PushEvent::Close if self.listeners.close => self.on_close(),
            event => trace!(event = event.name(), "no listener for event"),
        }
    }

    fn on_data(&mut self, chunk: Bytes) {
        // Push streams start paused and only deliver data once the first read
        // resumes them, so this only sees data a stream emitted regardless.
        // Keep it rather than lose bytes the peer already sent.
        if !self.listeners.data {
            trace!(len = chunk.len(), "data arrived before the first read");
        }

        self.readable.buffered += chunk.len();
        self.readable.chunks.push_back(chunk);

        if self.readable.buffered >= self.options.read_high_water_mark && !self.push.is_paused() {
            trace!(buffered = self.readable.buffered, "read buffer full, pausing");
            self.push.pause();
        }
        self.wakers.read.wake();
    }

    fn on_end(&mut self) {
        if self.readable.ended {
            trace!("duplicate end ignored");
            return;
        }
        debug!("peer ended");
        self.readable.ended = true;
        self.wakers.read.wake();
    }

    fn on_error(&mut self, error: StreamError) {
        debug!(%error, "push stream error");
        if let EndState::Pending(gate) = &mut self.writable.end {
            gate.resolve(Err(error.clone()));
        }
        self.begin_teardown(None, Some(error));
    }

    fn on_close(&mut self) {
        self.teardown.get_or_insert_with(Teardown::default);
        self.complete_close();
    }

    fn begin_teardown(&mut self, reason: Option<StreamError>, captured: Option<StreamError>) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }

        if let Some(teardown) = self.teardown.as_mut() {
            if let Some(captured) = captured {
                teardown.captured.get_or_insert(captured);
            }
            return;
        }

        // The push stream is destroyed with whatever caused the teardown,
        // which is the captured error when the push stream failed first.
        let cause = reason.clone().or_else(|| captured.clone());
        self.teardown = Some(Teardown { reason, captured });
        self.lifecycle = Lifecycle::Closing;

        let state = self.push.state();
        if state.destroyed {
            trace!("push stream already destroyed");
            self.complete_close();
            return;
        }

        if !state.destroying {
            debug!(reason = ?cause, "destroying push stream");
            self.push.destroy(cause.map(io::Error::from));
        }
        self.wakers.wake_all();
    }

    fn complete_close(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        self.lifecycle = Lifecycle::Closed;

        let teardown = self.teardown.take().unwrap_or_default();
        let error = teardown.captured.or(teardown.reason);
        self.listeners.detach();

        if let EndState::Pending(gate) = &mut self.writable.end {
            gate.resolve(Err(error.clone().unwrap_or_else(StreamError::closed)));
        }

        match &error {
            Some(error) => debug!(%error, "adapter closed with error"),
            None => debug!("adapter closed"),
        }

        self.notify.send(match &error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        });
        self.error = error;
        self.wakers.wake_all();
    }

    /// Ask the push stream for more data.
    ///
    /// The first call subscribes to `Data`; every call resumes the push stream
    /// if it is paused. Returns whether anything changed.
    pub fn request_more_data(&mut self) -> bool {
        if self.lifecycle == Lifecycle::Closed {
            return false;
        }

        let mut changed = false;
        if !self.listeners.data {
            trace!("attaching data listener");
            self.listeners.data = true;
            changed = true;
        }

        if self.push.is_paused() && self.readable.buffered < self.options.read_high_water_mark {
            trace!("resuming push stream");
            self.push.resume();
            changed = true;
        }

        changed
    }

    /// Error for write-side operations once teardown has started.
    fn write_error(&self) -> Option<StreamError> {
        match self.lifecycle {
            Lifecycle::Open => None,
            Lifecycle::Closing => Some(
                self.teardown
                    .as_ref()
                    .and_then(|t| t.captured.clone().or_else(|| t.reason.clone()))
                    .unwrap_or_else(StreamError::closed),
            ),
            Lifecycle::Closed => Some(self.error.clone().unwrap_or_else(StreamError::closed)),
        }
    }

    fn poll_read_buf(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        self.wakers.read.register(cx.waker());
        self.pump();

        loop {
            if !self.readable.chunks.is_empty() {
                while buf.remaining() > 0 {
                    let Some(front) = self.readable.chunks.front_mut() else {
                        break;
                    };
                    let n = front.len().min(buf.remaining());
                    buf.put_slice(&front[..n]);
                    if n == front.len() {
                        self.readable.chunks.pop_front();
                    } else {
                        front.advance(n);
                    }
                    self.readable.buffered -= n;
                }

                if self.readable.buffered < self.options.read_high_water_mark {
                    self.request_more_data();
                }
                return Poll::Ready(Ok(()));
            }

            if let Some(error) = &self.error {
                if !self.read_error_taken {
                    self.read_error_taken = true;
                    return Poll::Ready(Err(error.clone().into()));
                }
            }

            if self.readable.ended || self.lifecycle == Lifecycle::Closed {
                return Poll::Ready(Ok(()));
            }

            if self.request_more_data() {
                self.pump();
                continue;
            }

            return Poll::Pending;
        }
    }

    /// Submit `chunk` (taken out of the option on the first poll) and wait for
    /// the push stream to accept it.
    ///
    /// A chunk is not submitted while an earlier one is still waiting for
    /// `Drain`. Once submitted, the poll completes immediately if the push
    /// stream accepted it, or after the next `Drain` if it reported
    /// backpressure.
    pub fn poll_write_chunk(
        &mut self,
        cx: &mut Context<'_>,
        chunk: &mut Option<Bytes>,
    ) -> Poll<Result<(), StreamError>> {
        self.wakers.write.register(cx.waker());
        self.pump();

        if let Some(error) = self.write_error() {
            return Poll::Ready(Err(error));
        }

        if self.writable.awaiting_drain {
            return Poll::Pending;
        }

        if let Some(bytes) = chunk.take() {
            if self.writable.destroy_soon || !matches!(self.writable.end, EndState::NotStarted) {
                return Poll::Ready(Err(StreamError::write_after_end()));
            }

            if !self.push.write(bytes) {
                trace!("push stream applied backpressure");
                self.writable.awaiting_drain = true;
                self.pump();
                if let Some(error) = self.write_error() {
                    return Poll::Ready(Err(error));
                }
                if self.writable.awaiting_drain {
                    return Poll::Pending;
                }
            }
        }

        Poll::Ready(Ok(()))
    }

    /// Write one chunk, waiting out any backpressure.
    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        let mut chunk = Some(chunk);
        poll_fn(|cx| self.poll_write_chunk(cx, &mut chunk)).await
    }

    /// End the write side and wait for the push stream to finish flushing.
    ///
    /// Completes with the first of `Finish` (success) or `Error` (that
    /// error). Completes immediately if the push stream has already ended or
    /// is being destroyed.
    pub fn poll_end(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        self.wakers.write.register(cx.waker());
        self.pump();

        loop {
            match &mut self.writable.end {
                EndState::Done(result) => return Poll::Ready(result.clone()),
                EndState::Pending(gate) => {
                    return match gate.take() {
                        Some(result) => {
                            trace!(ok = result.is_ok(), "half-close complete");
                            self.writable.end = EndState::Done(result.clone());
                            Poll::Ready(result)
                        }
                        None => Poll::Pending,
                    };
                }
                EndState::NotStarted => {}
            }

            if let Some(error) = &self.error {
                let result = Err(error.clone());
                self.writable.end = EndState::Done(result.clone());
                return Poll::Ready(result);
            }

            if self.writable.awaiting_drain {
                return Poll::Pending;
            }

            let state = self.push.state();
            if state.ended || state.destroying || state.destroyed || self.lifecycle != Lifecycle::Open
            {
                trace!("push stream already ended");
                self.writable.end = EndState::Done(Ok(()));
                return Poll::Ready(Ok(()));
            }

            debug!("ending push stream");
            self.writable.end = EndState::Pending(Gate::new());
            self.push.end();
            self.pump();
        }
    }

    /// End the write side. See [`poll_end`](Self::poll_end).
    pub async fn end(&mut self) -> Result<(), StreamError> {
        poll_fn(|cx| self.poll_end(cx)).await
    }

    /// Tear the push stream down, optionally with the error that caused it.
    ///
    /// Await [`closed`](Self::closed) to learn the authoritative outcome: an
    /// error emitted by the push stream while it is being destroyed replaces
    /// `reason`.
    pub fn destroy(&mut self, reason: Option<io::Error>) {
        self.begin_teardown(reason.map(StreamError::from), None);
        self.pump();
    }

    /// End the write side, then destroy the push stream once it finishes.
    ///
    /// Writes still waiting for `Drain` are flushed first. Further writes
    /// fail, while reads keep returning whatever arrives until the close. An
    /// error from the push stream tears it down right away instead.
    pub fn destroy_soon(&mut self) {
        if self.lifecycle != Lifecycle::Open || self.writable.destroy_soon {
            return;
        }
        debug!("destroy once writes are flushed");
        self.writable.destroy_soon = true;
        self.advance_destroy_soon();
        self.pump();
    }

    fn advance_destroy_soon(&mut self) {
        if !self.writable.destroy_soon || self.lifecycle != Lifecycle::Open {
            return;
        }

        let flushed = match self.writable.end {
            EndState::NotStarted if self.writable.awaiting_drain => false,
            EndState::NotStarted => {
                let state = self.push.state();
                if state.ended || state.destroying || state.destroyed {
                    self.writable.end = EndState::Done(Ok(()));
                    true
                } else {
                    self.writable.end = EndState::Pending(Gate::new());
                    self.push.end();
                    false
                }
            }
            EndState::Pending(ref gate) => gate.is_resolved(),
            EndState::Done(_) => true,
        };

        if flushed {
            trace!("write side flushed");
            self.begin_teardown(None, None);
        }
    }

    /// Poll until the adapter has closed.
    pub fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        self.wakers.closed.register(cx.waker());
        self.pump();

        if self.lifecycle == Lifecycle::Closed {
            return Poll::Ready(match &self.error {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            });
        }
        Poll::Pending
    }

    /// Wait until the adapter has closed.
    pub async fn closed(&mut self) -> Result<(), StreamError> {
        poll_fn(|cx| self.poll_closed(cx)).await
    }
}

impl<P: PushStream + Unpin> AsyncRead for DuplexAdapter<P> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().poll_read_buf(cx, buf)
    }
}

impl<P: PushStream + Unpin> AsyncWrite for DuplexAdapter<P> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        this.wakers.write.register(cx.waker());
        this.pump();

        if let Some(error) = this.write_error() {
            return Poll::Ready(Err(error.into()));
        }

        if this.writable.awaiting_drain {
            return Poll::Pending;
        }

        if this.writable.destroy_soon || !matches!(this.writable.end, EndState::NotStarted) {
            return Poll::Ready(Err(StreamError::write_after_end().into()));
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if !this.push.write(Bytes::copy_from_slice(buf)) {
            trace!(len = buf.len(), "push stream applied backpressure");
            this.writable.awaiting_drain = true;
        }
        this.pump();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        this.wakers.write.register(cx.waker());
        this.pump();

        if this.writable.awaiting_drain {
            if let Some(error) = this.write_error() {
                return Poll::Ready(Err(error.into()));
            }
            return Poll::Pending;
        }

        if let Some(error) = &this.error {
            return Poll::Ready(Err(error.clone().into()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.get_mut().poll_end(cx).map_err(Into::into)
    }
}
