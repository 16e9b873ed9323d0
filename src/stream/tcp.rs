//! TCP raw transport.
//!
//! This module provides a `TcpStream` type that wraps `tokio::net::TcpStream`,
//! retains the remote address reported when a server accepts the connection,
//! counts the bytes which actually cross the wire, and implements the
//! socket-level controls of [`RawTransport`] through [`socket2::SockRef`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
pub use tokio::net::TcpListener;
use tokio::net::ToSocketAddrs;

use super::{Controls, IdleTimer, RawTransport};
use crate::info::{make_canonical, ConnectionInfo, HasConnectionInfo};

/// A TCP Stream, wrapping `tokio::net::TcpStream` with byte accounting and
/// socket controls.
///
/// The socket is released as soon as the stream is reset, so the peer sees a
/// RST while this value (and whatever owns it) is still alive.
pub struct TcpStream {
    stream: Mutex<Option<tokio::net::TcpStream>>,
    remote: Option<SocketAddr>,
    controls: Controls,
    idle: IdleTimer,
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream")
            .field("stream", &self.stream)
            .field("controls", &self.controls)
            .finish()
    }
}

impl TcpStream {
    /// Connect to a remote address. See `tokio::net::TcpStream::connect`.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        Ok(Self::client(stream))
    }

    /// Create a new `TcpStream` from an existing `tokio::net::TcpStream` for a client
    /// connection. Client connections should have valid `peer_addr` and `local_addr`.
    pub fn client(inner: tokio::net::TcpStream) -> Self {
        Self::new(inner, None)
    }

    /// Create a new `TcpStream` from an existing `tokio::net::TcpStream` for a server
    /// connection. Server connections should have a valid `local_addr` but may not have a
    /// `peer_addr`, hence the remote address must be provided.
    pub fn server(inner: tokio::net::TcpStream, remote: SocketAddr) -> Self {
        Self::new(inner, Some(make_canonical(remote)))
    }

    fn new(stream: tokio::net::TcpStream, remote: Option<SocketAddr>) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            remote,
            controls: Controls::default(),
            idle: IdleTimer::default(),
        }
    }

    fn with_stream<T>(&self, f: impl FnOnce(&tokio::net::TcpStream) -> io::Result<T>) -> io::Result<T> {
        match self.stream.lock().as_ref() {
            Some(stream) => f(stream),
            None => Err(released()),
        }
    }

    /// Remote address of the connection. See `tokio::net::TcpStream::peer_addr`.
    ///
    /// For servers, this will return the remote address provided when creating the stream,
    /// instead of an `io::Error`.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.remote {
            Some(addr) => Ok(addr),
            None => self.with_stream(|stream| stream.peer_addr()).map(make_canonical),
        }
    }

    /// Local address of the connection. See `tokio::net::TcpStream::local_addr`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.with_stream(|stream| stream.local_addr()).map(make_canonical)
    }

    /// Unwraps the `TcpStream`, returning the inner `tokio::net::TcpStream`.
    ///
    /// Fails with `NotConnected` once the stream has been reset.
    pub fn into_inner(self) -> io::Result<tokio::net::TcpStream> {
        self.stream.into_inner().ok_or_else(released)
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tcp socket was reset")
}

impl From<tokio::net::TcpStream> for TcpStream {
    fn from(stream: tokio::net::TcpStream) -> Self {
        Self::client(stream)
    }
}

impl HasConnectionInfo for TcpStream {
    type Addr = SocketAddr;

    fn info(&self) -> ConnectionInfo<Self::Addr> {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        ConnectionInfo {
            local_addr: self.local_addr().unwrap_or(unspecified),
            remote_addr: self.peer_addr().unwrap_or(unspecified),
        }
    }
}

impl RawTransport for TcpStream {
    fn bytes_read(&self) -> u64 {
        self.controls.bytes_read()
    }

    fn bytes_written(&self) -> u64 {
        self.controls.bytes_written()
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        tracing::trace!(?timeout, "tcp set_timeout");
        self.controls.set_timeout(timeout);
        Ok(())
    }

    fn set_keep_alive(&self, enable: bool, initial_delay: Option<Duration>) -> io::Result<()> {
        tracing::trace!(enable, ?initial_delay, "tcp set_keep_alive");
        self.with_stream(|stream| {
            let socket = SockRef::from(stream);
            match (enable, initial_delay) {
                (true, Some(delay)) if !delay.is_zero() => {
                    socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(delay))
                }
                (enable, _) => socket.set_keepalive(enable),
            }
        })
    }

    fn set_no_delay(&self, no_delay: bool) -> io::Result<()> {
        tracing::trace!(no_delay, "tcp set_no_delay");
        self.with_stream(|stream| stream.set_nodelay(no_delay))
    }

    fn add_ref(&self) {
        self.controls.add_ref();
    }

    fn unref(&self) {
        self.controls.unref();
    }

    fn has_ref(&self) -> bool {
        self.controls.has_ref()
    }

    fn reset_and_destroy(&self) -> io::Result<()> {
        let Some(stream) = self.stream.lock().take() else {
            return Ok(());
        };
        tracing::debug!("tcp reset");

        // With a zero linger, closing the descriptor sends a RST and drops
        // anything still queued. Never shut down first: that would be a FIN.
        let linger = SockRef::from(&stream).set_linger(Some(Duration::ZERO));
        drop(stream);

        self.controls.reset();
        linger
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.controls.poll_reset(cx)?;
        let Some(stream) = this.stream.get_mut() else {
            return Poll::Ready(Err(released()));
        };

        let filled = buf.filled().len();
        match Pin::new(stream).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.controls.record_read(buf.filled().len() - filled);
                this.idle.touch(&this.controls);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            Poll::Pending => this.idle.poll_expired(cx, &this.controls).map(Err),
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        this.controls.poll_reset(cx)?;
        let Some(stream) = this.stream.get_mut() else {
            return Poll::Ready(Err(released()));
        };

        match Pin::new(stream).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.controls.record_written(n);
                this.idle.touch(&this.controls);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            // A peer that stops reading stalls writes, which counts as idle too.
            Poll::Pending => this.idle.poll_expired(cx, &this.controls).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        this.controls.poll_reset(cx)?;
        match this.stream.get_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(released())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        this.controls.poll_reset(cx)?;
        match this.stream.get_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Err(released())),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    #[tokio::test]
    async fn test_tcp_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();

            let mut stream = TcpStream::server(stream, remote);
            let addr = stream.peer_addr().unwrap();
            assert_eq!(addr, remote);
            let addr = stream.info().remote_addr;
            assert_eq!(addr, remote);

            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            assert_eq!(stream.bytes_read(), 5);
        });

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let peer = stream.peer_addr().unwrap();
            assert_eq!(addr.port(), peer.port());

            stream.write_all(b"hello").await.unwrap();
            assert_eq!(stream.bytes_written(), 5);
        });

        let (s, c) = tokio::join!(server, client);
        s.unwrap();
        c.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_controls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let _accepted = accepted.unwrap();

        client.set_no_delay(true).unwrap();
        assert!(client.with_stream(|s| s.nodelay()).unwrap());

        client
            .set_keep_alive(true, Some(Duration::from_secs(30)))
            .unwrap();
        assert!(client.with_stream(|s| SockRef::from(s).keepalive()).unwrap());

        client.set_keep_alive(false, None).unwrap();
        assert!(!client.with_stream(|s| SockRef::from(s).keepalive()).unwrap());
    }

    #[tokio::test]
    async fn test_tcp_reset_fails_pending_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let _accepted = accepted.unwrap();

        client.reset_and_destroy().unwrap();

        let mut buf = [0u8; 8];
        let error = client.read(&mut buf).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);

        // Controls on a released socket fail instead of panicking.
        let error = client.set_no_delay(true).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
        client.reset_and_destroy().unwrap();
        assert!(client.into_inner().is_err());
    }

    #[tokio::test]
    async fn test_tcp_reset_is_abortive_for_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (mut accepted, _) = accepted.unwrap();

        // The reset stream stays alive for the whole read below.
        client.reset_and_destroy().unwrap();

        let mut buf = [0u8; 8];
        let error = accepted.read(&mut buf).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);
        drop(client);
    }

    #[tokio::test]
    async fn test_tcp_idle_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let _accepted = accepted.unwrap();

        client.set_timeout(Some(Duration::from_millis(20))).unwrap();

        let mut buf = [0u8; 8];
        let error = client.read(&mut buf).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_tcp_idle_timeout_on_stalled_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let _accepted = accepted.unwrap();

        client.set_timeout(Some(Duration::from_millis(50))).unwrap();

        // The peer never reads, so the socket buffers fill up and stay full.
        let payload = vec![0u8; 32 * 1024 * 1024];
        let error = client.write_all(&payload).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        assert!(client.bytes_written() > 0);
    }
}
