//! A push stream which exchanges identities but does not encrypt.
//!
//! [`PlainStream`] runs the push-stream event loop over any raw transport:
//! it performs a one-round identity exchange, then relays bytes unmodified.
//! It provides **no confidentiality and no authentication**; the remote
//! public key is whatever the peer claims. It exists so the listening and
//! dialing bridges can be used over trusted links and in tests, and as a
//! reference for how a real encrypted stream plugs into [`PushStream`].
//!
//! Each side sends a hello frame `[len: u8][public key: len bytes]`. Once
//! both hellos are through, the handshake digest is the initiator's key
//! followed by the responder's key.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use bytes::{Buf as _, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use super::{Handshake, PushEvent, PushState, PushStream, Role};
use crate::error::ConfigError;
use crate::stream::RawTransport;

/// Buffering configuration for a [`PlainStream`].
#[derive(Debug, Clone)]
pub struct PlainOptions {
    /// Writes return `false` once this many bytes are waiting to be flushed.
    pub write_high_water_mark: usize,

    /// Size of each read from the raw transport.
    pub read_chunk_size: usize,
}

impl Default for PlainOptions {
    fn default() -> Self {
        Self {
            write_high_water_mark: 16 * 1024,
            read_chunk_size: 8 * 1024,
        }
    }
}

impl PlainOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.write_high_water_mark == 0 {
            return Err(ConfigError::new("write high-water mark must be non-zero"));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::new("read chunk size must be non-zero"));
        }
        Ok(())
    }
}

/// Establishes [`PlainStream`]s for the listening and dialing bridges.
#[derive(Debug, Clone)]
pub struct PlainHandshake {
    public_key: Bytes,
    options: PlainOptions,
}

impl PlainHandshake {
    /// Create a handshake announcing `public_key`, which must be between 1
    /// and 255 bytes long.
    pub fn new(public_key: impl Into<Bytes>) -> Result<Self, ConfigError> {
        Self::with_options(public_key, PlainOptions::default())
    }

    /// Create a handshake with custom buffering options.
    pub fn with_options(
        public_key: impl Into<Bytes>,
        options: PlainOptions,
    ) -> Result<Self, ConfigError> {
        let public_key = public_key.into();
        if public_key.is_empty() || public_key.len() > usize::from(u8::MAX) {
            return Err(ConfigError::new("public key must be 1 to 255 bytes"));
        }
        options.validate()?;
        Ok(Self {
            public_key,
            options,
        })
    }

    /// The public key announced to peers.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

impl<IO> Handshake<IO> for PlainHandshake
where
    IO: AsyncRead + AsyncWrite + RawTransport + Unpin,
{
    type Stream = PlainStream<IO>;

    fn establish(&self, io: IO, role: Role) -> Self::Stream {
        PlainStream::new(io, role, self.public_key.clone(), self.options.clone())
    }
}

/// Hello frames in flight.
#[derive(Debug)]
struct Hello {
    outgoing: Bytes,
    incoming: BytesMut,
}

impl Hello {
    fn new(public_key: &[u8]) -> Self {
        let mut outgoing = BytesMut::with_capacity(public_key.len() + 1);
        outgoing.extend_from_slice(&[public_key.len() as u8]);
        outgoing.extend_from_slice(public_key);
        Self {
            outgoing: outgoing.freeze(),
            incoming: BytesMut::new(),
        }
    }

    /// Bytes still missing from the peer's hello.
    fn remaining(&self) -> usize {
        match self.incoming.first() {
            None => 1,
            Some(&len) => 1 + usize::from(len) - self.incoming.len(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.incoming.is_empty() && self.remaining() == 0
    }
}

/// A push stream over a raw transport. See the [module docs](self).
pub struct PlainStream<IO> {
    io: IO,
    role: Role,
    options: PlainOptions,
    public_key: Bytes,
    remote_public_key: Option<Bytes>,
    handshake_hash: Option<Bytes>,
    hello: Option<Hello>,
    paused: bool,
    outgoing: BytesMut,
    needs_drain: bool,
    read_ended: bool,
    read_buf: Box<[u8]>,
    state: PushState,
    failure: Option<io::Error>,
    events: VecDeque<PushEvent>,
    waker: Option<Waker>,
}

impl<IO> fmt::Debug for PlainStream<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainStream")
            .field("role", &self.role)
            .field("handshaking", &self.hello.is_some())
            .field("paused", &self.paused)
            .field("buffered", &self.outgoing.len())
            .field("state", &self.state)
            .finish()
    }
}

impl<IO> PlainStream<IO>
where
    IO: AsyncRead + AsyncWrite + RawTransport + Unpin,
{
    /// Start a stream over `io`. The identity exchange runs as soon as the
    /// stream is polled for events.
    pub fn new(io: IO, role: Role, public_key: Bytes, options: PlainOptions) -> Self {
        let hello = Hello::new(&public_key);
        let read_buf = vec![0u8; options.read_chunk_size.max(1)].into_boxed_slice();
        trace!(%role, "plain stream created");
        Self {
            io,
            role,
            options,
            public_key,
            remote_public_key: None,
            handshake_hash: None,
            hello: Some(hello),
            paused: true,
            outgoing: BytesMut::new(),
            needs_drain: false,
            read_ended: false,
            read_buf,
            state: PushState::default(),
            failure: None,
            events: VecDeque::new(),
            waker: None,
        }
    }

    /// The role this stream plays in the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake_by_ref();
        }
    }

    fn fail(&mut self, error: io::Error) {
        if self.state.destroying || self.state.destroyed {
            return;
        }
        debug!(%error, role = %self.role, "plain stream failed");
        self.state.destroying = true;
        self.failure = Some(error);
    }

    fn finish_destroy(&mut self, cx: &mut Context<'_>) {
        // Best effort: let the peer see a FIN if the transport still works.
        let _ = Pin::new(&mut self.io).poll_shutdown(cx);

        if let Some(error) = self.failure.take() {
            self.events.push_back(PushEvent::Error(error));
        }
        self.events.push_back(PushEvent::Close);
        self.state.destroying = false;
        self.state.destroyed = true;
        trace!(role = %self.role, "plain stream destroyed");
    }

    /// Run the identity exchange. Returns whether any progress was made.
    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
        let Some(hello) = self.hello.as_mut() else {
            return Ok(false);
        };
        let mut progress = false;

        while !hello.outgoing.is_empty() {
            match Pin::new(&mut self.io).poll_write(cx, &hello.outgoing) {
                Poll::Ready(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Poll::Ready(Ok(n)) => {
                    hello.outgoing.advance(n);
                    progress = true;
                }
                Poll::Ready(Err(error)) => return Err(error),
                Poll::Pending => break,
            }
        }

        while !hello.is_complete() {
            let want = hello.remaining();
            let mut buf = ReadBuf::new(&mut self.read_buf[..want]);
            match Pin::new(&mut self.io).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) if buf.filled().is_empty() => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during handshake",
                    ));
                }
                Poll::Ready(Ok(())) => {
                    hello.incoming.extend_from_slice(buf.filled());
                    progress = true;
                    if hello.incoming.first() == Some(&0) {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "peer sent an empty public key",
                        ));
                    }
                }
                Poll::Ready(Err(error)) => return Err(error),
                Poll::Pending => break,
            }
        }

        if hello.outgoing.is_empty() && hello.is_complete() {
            let remote = hello.incoming.split_off(1).freeze();
            self.complete_handshake(remote);
            progress = true;
        }

        Ok(progress)
    }

    fn complete_handshake(&mut self, remote: Bytes) {
        let (initiator, responder) = if self.role.is_initiator() {
            (&self.public_key, &remote)
        } else {
            (&remote, &self.public_key)
        };

        let mut hash = BytesMut::with_capacity(initiator.len() + responder.len());
        hash.extend_from_slice(initiator);
        hash.extend_from_slice(responder);

        self.handshake_hash = Some(hash.freeze());
        self.remote_public_key = Some(remote);
        self.hello = None;
        debug!(role = %self.role, "handshake complete");
    }

    /// Flush buffered writes and the end of the writable side.
    fn poll_flush_outgoing(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
        let mut progress = false;

        while !self.outgoing.is_empty() {
            match Pin::new(&mut self.io).poll_write(cx, &self.outgoing) {
                Poll::Ready(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Poll::Ready(Ok(n)) => {
                    self.outgoing.advance(n);
                    progress = true;
                }
                Poll::Ready(Err(error)) => return Err(error),
                Poll::Pending => break,
            }
        }

        if self.needs_drain && self.outgoing.is_empty() {
            self.needs_drain = false;
            self.events.push_back(PushEvent::Drain);
            progress = true;
        }

        if self.state.ended && !self.state.finished && self.outgoing.is_empty() {
            if let Poll::Ready(result) = Pin::new(&mut self.io).poll_shutdown(cx) {
                result?;
                self.state.finished = true;
                self.events.push_back(PushEvent::Finish);
                progress = true;
            }
        }

        Ok(progress)
    }

    /// Read the next chunk from the transport, if flowing.
    fn poll_read_incoming(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
        if self.paused || self.read_ended {
            return Ok(false);
        }

        let mut buf = ReadBuf::new(&mut self.read_buf);
        match Pin::new(&mut self.io).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().is_empty() {
                    self.read_ended = true;
                    self.events.push_back(PushEvent::End);
                } else {
                    let chunk = Bytes::copy_from_slice(buf.filled());
                    self.events.push_back(PushEvent::Data(chunk));
                }
                Ok(true)
            }
            Poll::Ready(Err(error)) => Err(error),
            Poll::Pending => Ok(false),
        }
    }

    fn drive(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
        if self.hello.is_some() {
            let progress = self.poll_handshake(cx)?;
            if self.hello.is_some() {
                return Ok(progress);
            }
        }

        let mut progress = self.poll_flush_outgoing(cx)?;
        progress |= self.poll_read_incoming(cx)?;

        if self.read_ended && self.state.finished {
            trace!(role = %self.role, "both directions done, closing");
            self.state.destroying = true;
            progress = true;
        }

        Ok(progress)
    }
}

impl<IO> PushStream for PlainStream<IO>
where
    IO: AsyncRead + AsyncWrite + RawTransport + Unpin,
{
    type Raw = IO;

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<PushEvent>> {
        match &self.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => self.waker = Some(cx.waker().clone()),
        }

        loop {
            if let Some(event) = self.events.pop_front() {
                return Poll::Ready(Some(event));
            }

            if self.state.destroyed {
                return Poll::Ready(None);
            }

            if self.state.destroying {
                self.finish_destroy(cx);
                continue;
            }

            match self.drive(cx) {
                Ok(true) => continue,
                Ok(false) => return Poll::Pending,
                Err(error) => self.fail(error),
            }
        }
    }

    fn write(&mut self, chunk: Bytes) -> bool {
        if self.state.ended || self.state.destroying || self.state.destroyed {
            self.fail(io::Error::new(io::ErrorKind::BrokenPipe, "write after end"));
            self.wake();
            return false;
        }

        self.outgoing.extend_from_slice(&chunk);
        let accepted = self.outgoing.len() < self.options.write_high_water_mark;
        if !accepted {
            trace!(buffered = self.outgoing.len(), "plain stream write buffer full");
            self.needs_drain = true;
        }
        self.wake();
        accepted
    }

    fn end(&mut self) {
        if self.state.ended || self.state.destroying || self.state.destroyed {
            return;
        }
        self.state.ended = true;
        self.wake();
    }

    fn destroy(&mut self, reason: Option<io::Error>) {
        if self.state.destroying || self.state.destroyed {
            return;
        }
        self.state.destroying = true;
        self.failure = reason;
        self.events.clear();
        self.wake();
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.wake();
        }
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn state(&self) -> PushState {
        self.state
    }

    fn raw(&self) -> Option<&IO> {
        Some(&self.io)
    }

    fn public_key(&self) -> Option<&[u8]> {
        Some(&self.public_key)
    }

    fn remote_public_key(&self) -> Option<&[u8]> {
        self.remote_public_key.as_deref()
    }

    fn handshake_hash(&self) -> Option<&[u8]> {
        self.handshake_hash.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use super::*;
    use crate::stream::duplex::DuplexStream;

    async fn next_event<P: PushStream>(stream: &mut P) -> Option<PushEvent> {
        poll_fn(|cx| stream.poll_event(cx)).await
    }

    fn pair(options: PlainOptions) -> (PlainStream<DuplexStream>, PlainStream<DuplexStream>) {
        let (a, b) = DuplexStream::new(1024);
        let initiator = PlainHandshake::with_options(&b"alice"[..], options.clone()).unwrap();
        let responder = PlainHandshake::with_options(&b"bob"[..], options).unwrap();
        (
            initiator.establish(a, Role::Initiator),
            responder.establish(b, Role::Responder),
        )
    }

    #[test]
    fn rejects_invalid_keys() {
        assert!(PlainHandshake::new(Bytes::new()).is_err());
        assert!(PlainHandshake::new(vec![7u8; 256]).is_err());
        assert!(PlainHandshake::with_options(
            &b"key"[..],
            PlainOptions {
                write_high_water_mark: 0,
                ..Default::default()
            }
        )
        .is_err());
    }

    #[tokio::test]
    async fn exchange_and_close() {
        let _ = tracing_subscriber::fmt::try_init();

        let (mut alice, mut bob) = pair(PlainOptions::default());

        let responder = tokio::spawn(async move {
            bob.resume();
            assert!(bob.write(Bytes::from_static(b"ping")));
            bob.end();

            let mut events = Vec::new();
            while let Some(event) = next_event(&mut bob).await {
                events.push(event.name());
            }
            (events, bob.remote_public_key().map(<[u8]>::to_vec))
        });

        alice.resume();
        let mut received = Vec::new();
        let mut names = Vec::new();
        while let Some(event) = next_event(&mut alice).await {
            names.push(event.name());
            match event {
                PushEvent::Data(chunk) => received.extend_from_slice(&chunk),
                PushEvent::End => alice.end(),
                _ => {}
            }
        }

        assert_eq!(received, b"ping");
        assert_eq!(names.last(), Some(&"close"));
        assert!(names.contains(&"finish"));
        assert!(!names.contains(&"error"));
        assert_eq!(alice.remote_public_key(), Some(&b"bob"[..]));
        assert_eq!(alice.handshake_hash(), Some(&b"alicebob"[..]));
        assert!(alice.state().destroyed);

        let (events, remote) = responder.await.unwrap();
        assert_eq!(remote.as_deref(), Some(&b"alice"[..]));
        assert_eq!(events, vec!["finish", "end", "close"]);
    }

    #[tokio::test]
    async fn backpressure_emits_drain() {
        let options = PlainOptions {
            write_high_water_mark: 4,
            ..Default::default()
        };
        let (mut alice, mut bob) = pair(options);

        let responder = tokio::spawn(async move {
            bob.resume();
            let mut received = Vec::new();
            while let Some(event) = next_event(&mut bob).await {
                match event {
                    PushEvent::Data(chunk) => received.extend_from_slice(&chunk),
                    PushEvent::End => bob.end(),
                    _ => {}
                }
            }
            received
        });

        assert!(!alice.write(Bytes::from_static(b"0123456789")));
        alice.resume();

        match next_event(&mut alice).await {
            Some(PushEvent::Drain) => {}
            other => panic!("expected drain, got {other:?}"),
        }

        alice.end();
        while next_event(&mut alice).await.is_some() {}

        assert_eq!(responder.await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn destroy_reports_reason_then_close() {
        let (mut alice, _bob) = pair(PlainOptions::default());

        alice.destroy(Some(io::Error::new(io::ErrorKind::Other, "boom")));
        alice.destroy(None);

        match next_event(&mut alice).await {
            Some(PushEvent::Error(error)) => assert_eq!(error.to_string(), "boom"),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(next_event(&mut alice).await, Some(PushEvent::Close)));
        assert!(next_event(&mut alice).await.is_none());
    }

    #[tokio::test]
    async fn handshake_eof_is_an_error() {
        use tokio::io::AsyncWriteExt as _;

        let (a, mut b) = DuplexStream::new(64);
        let mut alice = PlainHandshake::new(&b"alice"[..])
            .unwrap()
            .establish(a, Role::Initiator);
        b.shutdown().await.unwrap();

        match next_event(&mut alice).await {
            Some(PushEvent::Error(error)) => {
                assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(next_event(&mut alice).await, Some(PushEvent::Close)));
    }
}
