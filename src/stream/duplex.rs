//! An in-memory raw transport.
//!
//! This isn't just a plain-old stream, becasue the listening bridge needs
//! multiple connect/accept pairs to behave like a real listener.
//!
//! Right now, this is done with a `DuplexClient` and `DuplexIncoming` pair,
//! which produce a new duplex stream for each connection.
//!
//! Using the connect and accept parts manually can be a bit tricky, since
//! the single process must be polling the incoming side in order for the
//! connect side to suceed:
//! ```
//! # use duplexify::stream::duplex;
//! # use futures_util::StreamExt as _;
//! # async fn demo_duplex() {
//! let (client, mut incoming) = duplex::pair();
//!
//! let (client_conn, server_conn) = tokio::join!(client.connect(1024), incoming.next());
//! # }
//! ```

use core::fmt;
use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Controls, IdleTimer, RawTransport};
use crate::info::{ConnectionInfo, HasConnectionInfo};

/// Address (blank) for a duplex stream
#[derive(Default, Clone, PartialEq, Eq, Hash)]
pub struct DuplexAddr {
    _priv: (),
}

impl fmt::Debug for DuplexAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DuplexAddr")
    }
}

impl DuplexAddr {
    /// Create a new duplex address
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl fmt::Display for DuplexAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "duplex")
    }
}

/// A duplex stream transports data entirely in memory within the tokio runtime.
///
/// Socket options which have no in-memory meaning (keep-alive, no-delay) are
/// accepted and ignored; timeouts, reference counts and resets behave as they
/// do for [`TcpStream`][super::tcp::TcpStream].
#[derive(Debug)]
#[pin_project]
pub struct DuplexStream {
    #[pin]
    inner: tokio::io::DuplexStream,
    controls: Controls,
    idle: IdleTimer,
}

impl DuplexStream {
    /// Create a new duplex stream pair.
    ///
    /// Normally, this method is not needed, an you should prefer using
    /// [`DuplexClient`] and [`DuplexIncoming`] together to create a
    /// client/server pair of duplex streams.
    pub fn new(max_buf_size: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        (Self::wrap(a), Self::wrap(b))
    }

    fn wrap(inner: tokio::io::DuplexStream) -> Self {
        Self {
            inner,
            controls: Controls::default(),
            idle: IdleTimer::default(),
        }
    }
}

impl HasConnectionInfo for DuplexStream {
    type Addr = DuplexAddr;

    fn info(&self) -> ConnectionInfo<DuplexAddr> {
        ConnectionInfo::default()
    }
}

impl RawTransport for DuplexStream {
    fn bytes_read(&self) -> u64 {
        self.controls.bytes_read()
    }

    fn bytes_written(&self) -> u64 {
        self.controls.bytes_written()
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.controls.set_timeout(timeout);
        Ok(())
    }

    fn set_keep_alive(&self, _enable: bool, _initial_delay: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn set_no_delay(&self, _no_delay: bool) -> io::Result<()> {
        Ok(())
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
        self.controls.reset();
        Ok(())
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        this.controls.poll_reset(cx)?;

        let filled = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.controls.record_read(buf.filled().len() - filled);
                this.idle.touch(this.controls);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            Poll::Pending => this.idle.poll_expired(cx, this.controls).map(Err),
        }
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.project();
        this.controls.poll_reset(cx)?;

        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.controls.record_written(n);
                this.idle.touch(this.controls);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            Poll::Pending => this.idle.poll_expired(cx, this.controls).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.project();
        this.controls.poll_reset(cx)?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.project();
        this.controls.poll_reset(cx)?;
        this.inner.poll_shutdown(cx)
    }
}

/// Client for connecting to a duplex server
///
/// This is a wrapper around a tokio channel, which is used to send
/// and recieve data between multiple clients and a server.
#[derive(Debug, Clone)]
pub struct DuplexClient {
    sender: tokio::sync::mpsc::Sender<DuplexConnectionRequest>,
}

impl DuplexClient {
    /// Connect to the other half of this duplex setup.
    ///
    /// The `max_buf_size` is the maximum size of the buffer used for the stream.
    pub async fn connect(&self, max_buf_size: usize) -> Result<DuplexStream, io::Error> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let request = DuplexConnectionRequest::new(tx, max_buf_size);
        self.sender
            .send(request)
            .await
            .map_err(|_| io::ErrorKind::ConnectionRefused)?;
        Ok(rx.await.map_err(|_| io::ErrorKind::ConnectionReset)?)
    }
}

/// Gets sent to server to create connection
struct DuplexConnectionRequest {
    ack: tokio::sync::oneshot::Sender<DuplexStream>,
    max_buf_size: usize,
}

impl fmt::Debug for DuplexConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexConnectionRequest")
            .field("max_buf_size", &self.max_buf_size)
            .finish()
    }
}

impl DuplexConnectionRequest {
    fn new(ack: tokio::sync::oneshot::Sender<DuplexStream>, max_buf_size: usize) -> Self {
        Self { ack, max_buf_size }
    }

    /// Tell waiting clients that the connection has been established
    fn ack(self, max_buf_size: Option<usize>) -> Result<DuplexStream, io::Error> {
        let max_buf_size = match max_buf_size {
            Some(size) => std::cmp::min(size, self.max_buf_size),
            None => self.max_buf_size,
        };

        let (tx, rx) = DuplexStream::new(max_buf_size);
        self.ack
            .send(tx)
            .map_err(|_| io::ErrorKind::ConnectionReset)?;
        Ok(rx)
    }
}

/// Stream of incoming connections.
#[derive(Debug)]
pub struct DuplexIncoming {
    receiver: tokio::sync::mpsc::Receiver<DuplexConnectionRequest>,
    max_buf_size: Option<usize>,
}

impl DuplexIncoming {
    fn new(receiver: tokio::sync::mpsc::Receiver<DuplexConnectionRequest>) -> Self {
        Self {
            receiver,
            max_buf_size: None,
        }
    }

    /// Set the maximum buffer size for incoming connections
    pub fn with_max_buf_size(mut self, max_buf_size: usize) -> Self {
        self.max_buf_size = Some(max_buf_size);
        self
    }

    /// Poll for the next incoming connection, `None` once every client is gone.
    pub fn poll_incoming(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<DuplexStream, io::Error>>> {
        match ready!(self.receiver.poll_recv(cx)) {
            Some(request) => Poll::Ready(Some(request.ack(self.max_buf_size))),
            None => Poll::Ready(None),
        }
    }
}

impl futures_core::Stream for DuplexIncoming {
    type Item = Result<DuplexStream, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_incoming(cx)
    }
}

/// Create a new duplex client and incoming pair.
///
/// The client can be cloned and re-used cheaply, and the incoming provides
/// a stream of incoming duplex connections.
pub fn pair() -> (DuplexClient, DuplexIncoming) {
    let (sender, receiver) = tokio::sync::mpsc::channel(32);
    (DuplexClient { sender }, DuplexIncoming::new(receiver))
}

#[cfg(test)]
mod test {

    #[tokio::test]
    async fn test_duplex() {
        use super::*;
        use futures_util::StreamExt;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, incoming) = pair();
        let mut incoming = incoming.fuse();

        let (mut client_stream, mut server_stream) =
            tokio::try_join!(client.connect(1024), async {
                incoming.next().await.unwrap()
            })
            .unwrap();

        let mut buf = [0u8; 1024];

        tokio::try_join!(
            client_stream.write_all(b"hello"),
            server_stream.read_exact(&mut buf[..5])
        )
        .unwrap();

        assert_eq!(&buf[..5], b"hello");
        assert_eq!(client_stream.bytes_written(), 5);
        assert_eq!(server_stream.bytes_read(), 5);

        tokio::try_join!(
            server_stream.write_all(b"world"),
            client_stream.read_exact(&mut buf[..5])
        )
        .unwrap();

        assert_eq!(&buf[..5], b"world");
    }

    #[tokio::test]
    async fn test_duplex_reset() {
        use super::*;
        use tokio::io::AsyncReadExt;

        let (mut a, _b) = DuplexStream::new(64);
        a.reset_and_destroy().unwrap();

        let mut buf = [0u8; 8];
        let error = a.read(&mut buf).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);
    }
}
