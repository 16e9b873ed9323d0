//! Test doubles for push streams and raw transports.
//!
//! [`MockPushStream`] emits exactly the events a test feeds it through its
//! [`MockHandle`], and records every call the adapter makes. [`MockTransport`]
//! records every control call with its arguments.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{PushEvent, PushState, PushStream};
use crate::stream::RawTransport;

#[derive(Debug)]
struct Shared {
    events: VecDeque<PushEvent>,
    accept_writes: bool,
    auto_close: bool,
    finish_on_end: bool,
    written: Vec<Bytes>,
    end_calls: usize,
    destroy_reasons: Vec<Option<String>>,
    pause_calls: usize,
    resume_calls: usize,
    paused: bool,
    state: PushState,
    closed: bool,
    waker: Option<Waker>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            events: VecDeque::new(),
            accept_writes: true,
            auto_close: true,
            finish_on_end: false,
            written: Vec::new(),
            end_calls: 0,
            destroy_reasons: Vec::new(),
            pause_calls: 0,
            resume_calls: 0,
            paused: true,
            state: PushState::default(),
            closed: false,
            waker: None,
        }
    }
}

impl Shared {
    fn push(&mut self, event: PushEvent) {
        self.events.push_back(event);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// A scripted push stream.
///
/// Starts paused, holds back `Data` events while paused, accepts writes by
/// default, and answers `destroy` with `Error(reason)` (if given) and `Close`.
#[derive(Debug)]
pub struct MockPushStream {
    shared: Arc<Mutex<Shared>>,
    raw: Option<MockTransport>,
    public_key: Option<Bytes>,
    remote_public_key: Option<Bytes>,
    handshake_hash: Option<Bytes>,
}

/// Drives and inspects a [`MockPushStream`] from the test body.
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MockPushStream {
    /// Create a push stream without a raw transport.
    pub fn new() -> (Self, MockHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let stream = Self {
            shared: shared.clone(),
            raw: None,
            public_key: None,
            remote_public_key: None,
            handshake_hash: None,
        };
        (stream, MockHandle { shared })
    }

    /// Attach a raw transport.
    pub fn with_transport(mut self, raw: MockTransport) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Set the identity values reported by the stream.
    pub fn with_keys(
        mut self,
        public_key: &'static [u8],
        remote_public_key: &'static [u8],
        handshake_hash: Option<&'static [u8]>,
    ) -> Self {
        self.public_key = Some(Bytes::from_static(public_key));
        self.remote_public_key = Some(Bytes::from_static(remote_public_key));
        self.handshake_hash = handshake_hash.map(Bytes::from_static);
        self
    }
}

impl MockHandle {
    /// Queue an event.
    pub fn emit(&self, event: PushEvent) {
        self.shared.lock().push(event);
    }

    /// Queue a `Data` event.
    pub fn data(&self, chunk: &'static [u8]) {
        self.emit(PushEvent::Data(Bytes::from_static(chunk)));
    }

    /// Queue an `Error` event.
    pub fn error(&self, kind: io::ErrorKind, message: &'static str) {
        self.emit(PushEvent::Error(io::Error::new(kind, message)));
    }

    /// Whether `write` reports capacity available.
    pub fn set_accept_writes(&self, accept: bool) {
        self.shared.lock().accept_writes = accept;
    }

    /// Whether `destroy` queues `Error`/`Close` by itself.
    pub fn set_auto_close(&self, auto_close: bool) {
        self.shared.lock().auto_close = auto_close;
    }

    /// Whether `end` queues `Finish` by itself.
    pub fn set_finish_on_end(&self, finish: bool) {
        self.shared.lock().finish_on_end = finish;
    }

    /// Overwrite the reported state flags.
    pub fn set_state(&self, state: PushState) {
        self.shared.lock().state = state;
    }

    /// Chunks passed to `write`, in order.
    pub fn written(&self) -> Vec<Bytes> {
        self.shared.lock().written.clone()
    }

    /// Number of `end` calls.
    pub fn end_calls(&self) -> usize {
        self.shared.lock().end_calls
    }

    /// Number of `destroy` calls.
    pub fn destroy_calls(&self) -> usize {
        self.shared.lock().destroy_reasons.len()
    }

    /// The reason passed to each `destroy` call, rendered as a string.
    pub fn destroy_reasons(&self) -> Vec<Option<String>> {
        self.shared.lock().destroy_reasons.clone()
    }

    /// Number of `pause` calls.
    pub fn pause_calls(&self) -> usize {
        self.shared.lock().pause_calls
    }

    /// Number of `resume` calls.
    pub fn resume_calls(&self) -> usize {
        self.shared.lock().resume_calls
    }

    /// Whether the stream is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Events queued but not yet polled.
    pub fn queued(&self) -> usize {
        self.shared.lock().events.len()
    }
}

impl PushStream for MockPushStream {
    type Raw = MockTransport;

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<PushEvent>> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Poll::Ready(None);
        }

        let blocked = shared.paused && matches!(shared.events.front(), Some(PushEvent::Data(_)));
        match shared.events.pop_front() {
            Some(event) if !blocked => {
                if matches!(event, PushEvent::Close) {
                    shared.closed = true;
                    shared.state.destroying = false;
                    shared.state.destroyed = true;
                }
                Poll::Ready(Some(event))
            }
            held => {
                if let Some(event) = held {
                    shared.events.push_front(event);
                }
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn write(&mut self, chunk: Bytes) -> bool {
        let mut shared = self.shared.lock();
        shared.written.push(chunk);
        shared.accept_writes
    }

    fn end(&mut self) {
        let mut shared = self.shared.lock();
        shared.end_calls += 1;
        shared.state.ended = true;
        if shared.finish_on_end {
            shared.push(PushEvent::Finish);
        }
    }

    fn destroy(&mut self, reason: Option<io::Error>) {
        let mut shared = self.shared.lock();
        shared
            .destroy_reasons
            .push(reason.as_ref().map(ToString::to_string));

        if shared.state.destroying || shared.state.destroyed {
            return;
        }
        shared.state.destroying = true;

        if shared.auto_close {
            if let Some(reason) = reason {
                shared.push(PushEvent::Error(reason));
            }
            shared.push(PushEvent::Close);
        }
    }

    fn pause(&mut self) {
        let mut shared = self.shared.lock();
        shared.pause_calls += 1;
        shared.paused = true;
    }

    fn resume(&mut self) {
        let mut shared = self.shared.lock();
        shared.resume_calls += 1;
        shared.paused = false;
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
    }

    fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    fn state(&self) -> PushState {
        self.shared.lock().state
    }

    fn raw(&self) -> Option<&MockTransport> {
        self.raw.as_ref()
    }

    fn public_key(&self) -> Option<&[u8]> {
        self.public_key.as_deref()
    }

    fn remote_public_key(&self) -> Option<&[u8]> {
        self.remote_public_key.as_deref()
    }

    fn handshake_hash(&self) -> Option<&[u8]> {
        self.handshake_hash.as_deref()
    }
}

/// A control call received by a [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawCall {
    /// `set_timeout(timeout)`
    SetTimeout(Option<Duration>),
    /// `set_keep_alive(enable, initial_delay)`
    SetKeepAlive(bool, Option<Duration>),
    /// `set_no_delay(no_delay)`
    SetNoDelay(bool),
    /// `add_ref()`
    AddRef,
    /// `unref()`
    Unref,
    /// `reset_and_destroy()`
    ResetAndDestroy,
}

#[derive(Debug)]
struct TransportState {
    calls: Vec<RawCall>,
    bytes_read: u64,
    bytes_written: u64,
    refs: usize,
}

/// A raw transport which records control calls. Clones share state.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                calls: Vec::new(),
                bytes_read: 0,
                bytes_written: 0,
                refs: 1,
            })),
        }
    }
}

impl MockTransport {
    /// Create a transport with zeroed counters and one reference.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wire-level byte counters.
    pub fn set_counters(&self, bytes_read: u64, bytes_written: u64) {
        let mut state = self.state.lock();
        state.bytes_read = bytes_read;
        state.bytes_written = bytes_written;
    }

    /// Control calls received so far, in order.
    pub fn calls(&self) -> Vec<RawCall> {
        self.state.lock().calls.clone()
    }

    fn record(&self, call: RawCall) {
        self.state.lock().calls.push(call);
    }
}

impl RawTransport for MockTransport {
    fn bytes_read(&self) -> u64 {
        self.state.lock().bytes_read
    }

    fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.record(RawCall::SetTimeout(timeout));
        Ok(())
    }

    fn set_keep_alive(&self, enable: bool, initial_delay: Option<Duration>) -> io::Result<()> {
        self.record(RawCall::SetKeepAlive(enable, initial_delay));
        Ok(())
    }

    fn set_no_delay(&self, no_delay: bool) -> io::Result<()> {
        self.record(RawCall::SetNoDelay(no_delay));
        Ok(())
    }

    fn add_ref(&self) {
        let mut state = self.state.lock();
        state.refs += 1;
        state.calls.push(RawCall::AddRef);
    }

    fn unref(&self) {
        let mut state = self.state.lock();
        state.refs = state.refs.saturating_sub(1);
        state.calls.push(RawCall::Unref);
    }

    fn has_ref(&self) -> bool {
        self.state.lock().refs > 0
    }

    fn reset_and_destroy(&self) -> io::Result<()> {
        self.record(RawCall::ResetAndDestroy);
        Ok(())
    }
}
