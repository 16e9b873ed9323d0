//! Socket-shaped wrapper around a [`DuplexAdapter`].
//!
//! [`SecretSocket`] adds what callers expect from a network socket on top of
//! the adapter: identity (public keys and the handshake digest, read from the
//! push stream), wire-level byte counters, and transport controls. Counters
//! and controls go straight to the raw transport beneath the push stream,
//! since only that layer sees real TCP timers and byte counts.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::adapter::{AdapterOptions, DuplexAdapter, Lifecycle};
use crate::error::{ConfigError, StreamError};
use crate::info::{ConnectionInfo, HasConnectionInfo, MaybeAddr};
use crate::notify::CloseListener;
use crate::push::PushStream;
use crate::stream::RawTransport;

/// Whether a socket has completed its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// The raw transport is connected but the handshake is still running.
    Opening,

    /// The handshake is complete (or there is no transport to wait for).
    Open,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyState::Opening => f.write_str("opening"),
            ReadyState::Open => f.write_str("open"),
        }
    }
}

/// A pull-based socket over a push stream.
#[derive(Debug)]
pub struct SecretSocket<P> {
    adapter: DuplexAdapter<P>,
}

impl<P: PushStream> From<DuplexAdapter<P>> for SecretSocket<P> {
    fn from(adapter: DuplexAdapter<P>) -> Self {
        Self { adapter }
    }
}

impl<P: PushStream> SecretSocket<P> {
    /// Wrap `push` with default adapter options.
    pub fn new(push: P) -> Self {
        DuplexAdapter::new(push).into()
    }

    /// Wrap `push` with custom adapter options.
    pub fn with_options(push: P, options: AdapterOptions) -> Result<Self, ConfigError> {
        DuplexAdapter::with_options(push, options).map(Into::into)
    }

    /// The adapter beneath this socket.
    pub fn adapter(&self) -> &DuplexAdapter<P> {
        &self.adapter
    }

    /// Mutable access to the adapter beneath this socket.
    pub fn adapter_mut(&mut self) -> &mut DuplexAdapter<P> {
        &mut self.adapter
    }

    /// Unwrap the socket into its adapter.
    pub fn into_adapter(self) -> DuplexAdapter<P> {
        self.adapter
    }

    /// The push stream beneath this socket.
    pub fn push(&self) -> &P {
        self.adapter.push()
    }

    fn raw(&self) -> io::Result<&P::Raw> {
        self.push()
            .raw()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no raw transport"))
    }

    /// Our public key.
    pub fn public_key(&self) -> Option<&[u8]> {
        self.push().public_key()
    }

    /// The peer's public key, once the handshake has received it.
    pub fn remote_public_key(&self) -> Option<&[u8]> {
        self.push().remote_public_key()
    }

    /// Digest of the completed handshake.
    pub fn handshake_hash(&self) -> Option<&[u8]> {
        self.push().handshake_hash()
    }

    /// Bytes read from the wire by the raw transport, including framing.
    pub fn bytes_read(&self) -> u64 {
        self.raw().map(RawTransport::bytes_read).unwrap_or(0)
    }

    /// Bytes written to the wire by the raw transport, including framing.
    pub fn bytes_written(&self) -> u64 {
        self.raw().map(RawTransport::bytes_written).unwrap_or(0)
    }

    /// Set the inactivity timeout on the raw transport.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.raw()?.set_timeout(timeout)
    }

    /// Configure keep-alive probes on the raw transport.
    pub fn set_keep_alive(&self, enable: bool, initial_delay: Option<Duration>) -> io::Result<()> {
        self.raw()?.set_keep_alive(enable, initial_delay)
    }

    /// Enable or disable Nagle's algorithm on the raw transport.
    pub fn set_no_delay(&self, no_delay: bool) -> io::Result<()> {
        self.raw()?.set_no_delay(no_delay)
    }

    /// Take a reference on the raw transport.
    pub fn add_ref(&self) -> io::Result<()> {
        self.raw()?.add_ref();
        Ok(())
    }

    /// Release a reference on the raw transport.
    pub fn unref(&self) -> io::Result<()> {
        self.raw()?.unref();
        Ok(())
    }

    /// Whether anything holds a reference on the raw transport.
    pub fn has_ref(&self) -> bool {
        self.raw().map(RawTransport::has_ref).unwrap_or(false)
    }

    /// Reset the raw transport and tear the socket down.
    pub fn reset_and_destroy(&mut self) -> io::Result<()> {
        self.raw()?.reset_and_destroy()?;
        self.adapter.destroy(Some(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        )));
        Ok(())
    }

    /// Whether the raw transport is connected but the handshake is not done.
    pub fn connecting(&self) -> bool {
        self.push().raw().is_some() && self.handshake_hash().is_none()
    }

    /// Whether there is no raw transport yet.
    pub fn pending(&self) -> bool {
        self.push().raw().is_none()
    }

    /// `Opening` while [`connecting`](Self::connecting), otherwise `Open`.
    pub fn ready_state(&self) -> ReadyState {
        if self.connecting() {
            ReadyState::Opening
        } else {
            ReadyState::Open
        }
    }

    /// Current lifecycle stage of the adapter.
    pub fn lifecycle(&self) -> Lifecycle {
        self.adapter.lifecycle()
    }

    /// Write one chunk, waiting out any backpressure.
    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        self.adapter.write_chunk(chunk).await
    }

    /// End the write side, leaving the read side open.
    pub async fn end(&mut self) -> Result<(), StreamError> {
        self.adapter.end().await
    }

    /// Tear the socket down. See [`DuplexAdapter::destroy`].
    pub fn destroy(&mut self, reason: Option<io::Error>) {
        self.adapter.destroy(reason)
    }

    /// Flush pending writes, end the write side and destroy the socket once
    /// the push stream finishes. See [`DuplexAdapter::destroy_soon`].
    pub fn destroy_soon(&mut self) {
        self.adapter.destroy_soon()
    }

    /// Wait until the socket has closed.
    pub async fn closed(&mut self) -> Result<(), StreamError> {
        self.adapter.closed().await
    }

    /// A listener which resolves when this socket closes.
    pub fn close_listener(&self) -> CloseListener {
        self.adapter.close_listener()
    }
}

impl<P> HasConnectionInfo for SecretSocket<P>
where
    P: PushStream,
    P::Raw: HasConnectionInfo,
{
    type Addr = MaybeAddr<<P::Raw as HasConnectionInfo>::Addr>;

    fn info(&self) -> ConnectionInfo<Self::Addr> {
        match self.push().raw() {
            Some(raw) => raw.info().map(MaybeAddr::Known),
            None => ConnectionInfo::default(),
        }
    }
}

impl<P: PushStream + Unpin> AsyncRead for SecretSocket<P> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().adapter).poll_read(cx, buf)
    }
}

impl<P: PushStream + Unpin> AsyncWrite for SecretSocket<P> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().adapter).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().adapter).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().adapter).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::push::mock::{MockPushStream, MockTransport, RawCall};
    use crate::push::plain::PlainStream;
    use crate::push::PushEvent;
    use crate::stream::tcp::TcpStream;

    assert_impl_all!(SecretSocket<PlainStream<TcpStream>>: Send, Unpin, AsyncRead, AsyncWrite, HasConnectionInfo);

    #[test]
    fn controls_reach_raw_transport() {
        let raw = MockTransport::new();
        let (push, _handle) = MockPushStream::new();
        let mut socket = SecretSocket::new(push.with_transport(raw.clone()));

        socket.set_timeout(Some(Duration::from_secs(5))).unwrap();
        socket.set_timeout(None).unwrap();
        socket
            .set_keep_alive(true, Some(Duration::from_millis(1500)))
            .unwrap();
        socket.set_no_delay(true).unwrap();
        socket.unref().unwrap();
        assert!(!socket.has_ref());
        socket.add_ref().unwrap();
        assert!(socket.has_ref());
        socket.reset_and_destroy().unwrap();

        assert_eq!(
            raw.calls(),
            vec![
                RawCall::SetTimeout(Some(Duration::from_secs(5))),
                RawCall::SetTimeout(None),
                RawCall::SetKeepAlive(true, Some(Duration::from_millis(1500))),
                RawCall::SetNoDelay(true),
                RawCall::Unref,
                RawCall::AddRef,
                RawCall::ResetAndDestroy,
            ]
        );
        assert_eq!(socket.lifecycle(), Lifecycle::Closed);
    }

    #[test]
    fn counters_come_from_raw_transport() {
        let raw = MockTransport::new();
        raw.set_counters(120, 64);

        let (push, _handle) = MockPushStream::new();
        let socket = SecretSocket::new(push.with_transport(raw.clone()));
        assert_eq!(socket.bytes_read(), 120);
        assert_eq!(socket.bytes_written(), 64);

        raw.set_counters(300, 64);
        assert_eq!(socket.bytes_read(), 300);
    }

    #[test]
    fn controls_without_transport_fail() {
        let (push, _handle) = MockPushStream::new();
        let mut socket = SecretSocket::new(push);

        assert!(socket.pending());
        assert!(!socket.connecting());
        assert_eq!(socket.ready_state(), ReadyState::Open);
        assert_eq!(socket.bytes_read(), 0);
        assert!(!socket.has_ref());

        let error = socket.set_no_delay(true).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
        let error = socket.reset_and_destroy().unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
        assert_eq!(socket.lifecycle(), Lifecycle::Open);
    }

    #[test]
    fn ready_state_follows_handshake() {
        let (push, _handle) = MockPushStream::new();
        let socket = SecretSocket::new(
            push.with_transport(MockTransport::new())
                .with_keys(b"local", b"remote", None),
        );
        assert!(socket.connecting());
        assert!(!socket.pending());
        assert_eq!(socket.ready_state(), ReadyState::Opening);
        assert_eq!(socket.ready_state().to_string(), "opening");

        let (push, _handle) = MockPushStream::new();
        let socket = SecretSocket::new(
            push.with_transport(MockTransport::new())
                .with_keys(b"local", b"remote", Some(b"digest")),
        );
        assert!(!socket.connecting());
        assert_eq!(socket.ready_state(), ReadyState::Open);
        assert_eq!(socket.public_key(), Some(&b"local"[..]));
        assert_eq!(socket.remote_public_key(), Some(&b"remote"[..]));
        assert_eq!(socket.handshake_hash(), Some(&b"digest"[..]));
    }

    #[tokio::test]
    async fn destroy_soon_ends_before_destroying() {
        let (push, handle) = MockPushStream::new();
        let mut socket = SecretSocket::new(push);

        socket.write_chunk(Bytes::from_static(b"bye")).await.unwrap();
        socket.destroy_soon();
        assert_eq!(handle.end_calls(), 1);
        assert_eq!(handle.destroy_calls(), 0);

        handle.emit(PushEvent::Finish);
        socket.closed().await.unwrap();
        assert_eq!(handle.destroy_calls(), 1);
        assert_eq!(socket.lifecycle(), Lifecycle::Closed);
    }
}
