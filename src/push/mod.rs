//! The push-based side of the bridge.
//!
//! A [`PushStream`] is an event-driven duplex byte stream, typically an
//! encrypted channel running over a raw transport. Instead of answering read
//! calls it delivers [`PushEvent`]s as they happen, reports write
//! backpressure through the return value of [`PushStream::write`] followed by
//! a later [`PushEvent::Drain`], and announces the end of each direction with
//! [`PushEvent::End`] and [`PushEvent::Finish`].
//!
//! The [`DuplexAdapter`][crate::adapter::DuplexAdapter] turns one of these into
//! a pull-based `AsyncRead + AsyncWrite` stream.

use std::fmt;
use std::io;
use std::task::{Context, Poll};

use bytes::Bytes;

use crate::stream::RawTransport;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod plain;

/// A signal emitted by a push stream.
#[derive(Debug)]
pub enum PushEvent {
    /// A chunk of decoded application data.
    Data(Bytes),

    /// The write buffer has drained below its high-water mark after a write
    /// returned `false`.
    Drain,

    /// The remote side has finished sending; no more `Data` will follow.
    End,

    /// All written data has been flushed after [`PushStream::end`].
    Finish,

    /// The stream has been torn down. This is always the last event.
    Close,

    /// The stream failed. A `Close` follows.
    Error(io::Error),
}

impl PushEvent {
    /// The event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::Data(_) => "data",
            PushEvent::Drain => "drain",
            PushEvent::End => "end",
            PushEvent::Finish => "finish",
            PushEvent::Close => "close",
            PushEvent::Error(_) => "error",
        }
    }
}

/// Read-only state flags of a push stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushState {
    /// `end()` has been called; the writable side accepts no more data.
    pub ended: bool,

    /// `destroy()` has been called, or the stream failed, but `Close` has not
    /// been emitted yet.
    pub destroying: bool,

    /// The stream has emitted `Close`.
    pub destroyed: bool,

    /// The writable side has flushed and emitted `Finish`.
    pub finished: bool,
}

/// Which side of the handshake a push stream plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The dialing side.
    Initiator,

    /// The listening side.
    Responder,
}

impl Role {
    /// Whether this is the initiating (dialing) side.
    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// An event-driven duplex byte stream.
///
/// Implementations must start paused: no `Data` is emitted until
/// [`resume`](PushStream::resume) is called. Events are delivered in the
/// order they occur through [`poll_event`](PushStream::poll_event), which must
/// also drive any I/O the stream needs to make progress. Calls such as
/// `write`, `resume` or `destroy` made outside of `poll_event` should wake the
/// task which last polled for events.
pub trait PushStream {
    /// The raw transport beneath this stream.
    type Raw: RawTransport;

    /// Poll for the next event. `None` once the stream will never emit again.
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<PushEvent>>;

    /// Queue a chunk for writing. Returns `false` when the write buffer is
    /// full; a `Drain` event follows once it has room again.
    fn write(&mut self, chunk: Bytes) -> bool;

    /// End the writable side. `Finish` follows once everything is flushed.
    fn end(&mut self);

    /// Tear the stream down, optionally with the error that caused it.
    fn destroy(&mut self, reason: Option<io::Error>);

    /// Stop emitting `Data`.
    fn pause(&mut self);

    /// Start (or restart) emitting `Data`.
    fn resume(&mut self);

    /// Whether `Data` delivery is currently paused.
    fn is_paused(&self) -> bool;

    /// The current state flags.
    fn state(&self) -> PushState;

    /// The raw transport, if one is attached yet.
    fn raw(&self) -> Option<&Self::Raw>;

    /// The local public key.
    fn public_key(&self) -> Option<&[u8]>;

    /// The remote public key, once the handshake has received it.
    fn remote_public_key(&self) -> Option<&[u8]>;

    /// Digest of the completed handshake.
    fn handshake_hash(&self) -> Option<&[u8]>;
}

/// Establishes a push stream over a freshly connected raw transport.
///
/// The listening bridge establishes streams as [`Role::Responder`], the
/// dialing bridge as [`Role::Initiator`]. Establishing must not block: any
/// handshake runs as part of the returned stream's event loop, and a failed
/// handshake surfaces as a [`PushEvent::Error`].
pub trait Handshake<IO> {
    /// The push stream produced.
    type Stream: PushStream;

    /// Wrap `io` in a push stream playing `role`.
    fn establish(&self, io: IO, role: Role) -> Self::Stream;
}
