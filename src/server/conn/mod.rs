//! Accepting raw connections and turning them into secret sockets.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::info::HasConnectionInfo;
use crate::stream::duplex::{DuplexIncoming, DuplexStream};
use crate::stream::tcp::{TcpListener, TcpStream};

mod acceptor;

pub use self::acceptor::SecretAcceptor;

/// Accept incoming connections for a server.
pub trait Accept {
    /// The connection type for this acceptor
    type Conn: HasConnectionInfo + AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// The error type for this acceptor
    type Error: Into<Box<dyn std::error::Error + Send + Sync>>;

    /// Poll for a new connection
    fn poll_accept(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Self::Conn, Self::Error>>;
}

/// Extension trait for Accept
pub trait AcceptExt: Accept {
    /// Wrap the acceptor in a future that resolves to a single connection.
    ///
    /// For example, to accept only a single duplex connection, you can do:
    /// ```
    /// # use duplexify::server::conn::AcceptExt;
    /// # use duplexify::stream::duplex;
    /// # async fn demo_accept() {
    /// let (client, mut acceptor) = duplex::pair();
    ///
    /// let (client_conn, server_conn) = tokio::try_join!(client.connect(1024), acceptor.accept()).unwrap();
    /// # }
    /// ```
    fn accept(&mut self) -> AcceptOne<'_, Self>
    where
        Self: Sized + Unpin,
    {
        AcceptOne { inner: self }
    }
}

impl<A> AcceptExt for A where A: Accept {}

/// A future that resolves to a single connection
#[derive(Debug)]
#[pin_project]
pub struct AcceptOne<'a, A> {
    inner: &'a mut A,
}

impl<'a, A> Future for AcceptOne<'a, A>
where
    A: Accept + Unpin,
{
    type Output = Result<A::Conn, A::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut **self.project().inner).poll_accept(cx)
    }
}

impl Accept for TcpListener {
    type Conn = TcpStream;
    type Error = io::Error;

    fn poll_accept(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Self::Conn, Self::Error>> {
        TcpListener::poll_accept(&self, cx).map_ok(|(stream, remote)| TcpStream::server(stream, remote))
    }
}

impl Accept for DuplexIncoming {
    type Conn = DuplexStream;
    type Error = io::Error;

    fn poll_accept(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Self::Conn, Self::Error>> {
        match self.poll_incoming(cx) {
            Poll::Ready(Some(result)) => Poll::Ready(result),
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "duplex clients closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;
    use crate::stream::duplex;

    #[tokio::test]
    async fn accept_one_duplex() {
        let (client, mut incoming) = duplex::pair();

        let (mut client_conn, mut server_conn) =
            tokio::try_join!(client.connect(64), incoming.accept()).unwrap();

        client_conn.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn accept_tcp_records_remote() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, server) = tokio::join!(
            TcpStream::connect(addr),
            AcceptExt::accept(&mut listener)
        );
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(server.info().remote_addr, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn duplex_incoming_closes_with_clients() {
        let (client, mut incoming) = duplex::pair();
        drop(client);

        let error = incoming.accept().await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionAborted);
    }
}
