use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project::pin_project;
use tracing::trace;

use super::Accept;
use crate::adapter::{AdapterOptions, DuplexAdapter};
use crate::error::ConfigError;
use crate::info::HasConnectionInfo;
use crate::push::{Handshake, PushStream, Role};
use crate::socket::SecretSocket;
use crate::stream::RawTransport;

/// Accepts raw connections and wraps each in a [`SecretSocket`].
///
/// Every accepted connection is handed to the handshake in the
/// [`Responder`](Role::Responder) role. The handshake itself runs as the
/// socket is first read or written, so a slow or failing peer never stalls
/// the accept loop; a failed handshake shows up as an error on that socket.
#[pin_project]
pub struct SecretAcceptor<A, H> {
    #[pin]
    inner: A,
    handshake: H,
    options: AdapterOptions,
}

impl<A, H> fmt::Debug for SecretAcceptor<A, H>
where
    A: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretAcceptor")
            .field("inner", &self.inner)
            .field("options", &self.options)
            .finish()
    }
}

impl<A, H> SecretAcceptor<A, H> {
    /// Wrap an acceptor of raw connections.
    pub fn new(inner: A, handshake: H) -> Self {
        Self {
            inner,
            handshake,
            options: AdapterOptions::default(),
        }
    }

    /// Use `options` for the adapter of every accepted socket.
    pub fn with_options(mut self, options: AdapterOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    /// The raw acceptor.
    pub fn get_ref(&self) -> &A {
        &self.inner
    }

    /// The handshake applied to accepted connections.
    pub fn handshake(&self) -> &H {
        &self.handshake
    }
}

impl<A, H> Accept for SecretAcceptor<A, H>
where
    A: Accept,
    A::Conn: RawTransport,
    H: Handshake<A::Conn>,
    H::Stream: Send + Unpin + 'static,
    <H::Stream as PushStream>::Raw: HasConnectionInfo,
{
    type Conn = SecretSocket<H::Stream>;
    type Error = A::Error;

    fn poll_accept(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Self::Conn, Self::Error>> {
        let this = self.project();
        let raw = ready!(this.inner.poll_accept(cx))?;
        trace!(remote = %raw.info().remote_addr(), "accepted raw connection");

        let push = this.handshake.establish(raw, Role::Responder);
        Poll::Ready(Ok(DuplexAdapter::build(push, this.options.clone()).into()))
    }
}

impl<A, H> futures_core::Stream for SecretAcceptor<A, H>
where
    A: Accept,
    A::Conn: RawTransport,
    H: Handshake<A::Conn>,
    H::Stream: Send + Unpin + 'static,
    <H::Stream as PushStream>::Raw: HasConnectionInfo,
{
    type Item = Result<SecretSocket<H::Stream>, A::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_accept(cx).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt as _;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;
    use crate::push::plain::PlainHandshake;
    use crate::stream::duplex;

    #[tokio::test]
    async fn accepted_sockets_complete_handshake() {
        let _ = tracing_subscriber::fmt::try_init();

        let (client, incoming) = duplex::pair();
        let server_handshake = PlainHandshake::new(&b"server"[..]).unwrap();
        let mut acceptor = SecretAcceptor::new(incoming, server_handshake);

        let client_handshake = PlainHandshake::new(&b"client"[..]).unwrap();
        let (raw, accepted) = tokio::join!(client.connect(1024), acceptor.next());
        let mut dialed = SecretSocket::new(client_handshake.establish(raw.unwrap(), Role::Initiator));
        let mut accepted = accepted.unwrap().unwrap();

        assert!(accepted.connecting());

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            accepted.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            assert_eq!(accepted.remote_public_key(), Some(&b"client"[..]));
            assert!(!accepted.connecting());
            accepted.write_all(b"pong").await.unwrap();
            accepted.shutdown().await.unwrap();
        });

        dialed.write_all(b"ping").await.unwrap();
        let mut reply = Vec::new();
        dialed.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");
        assert_eq!(dialed.remote_public_key(), Some(&b"server"[..]));
        assert_eq!(dialed.handshake_hash(), Some(&b"clientserver"[..]));

        server.await.unwrap();
    }

    #[test]
    fn rejects_invalid_options() {
        let (_client, incoming) = duplex::pair();
        let handshake = PlainHandshake::new(&b"server"[..]).unwrap();
        let acceptor = SecretAcceptor::new(incoming, handshake).with_options(AdapterOptions {
            read_high_water_mark: 0,
        });
        assert!(acceptor.is_err());
    }

    static_assertions::assert_impl_all!(
        SecretAcceptor<duplex::DuplexIncoming, PlainHandshake>: Accept, futures_core::Stream
    );
}
