//! Serving HTTP/1 over secret sockets.
//!
//! [`Server`] pulls connections from any [`Accept`] implementation (usually a
//! [`SecretAcceptor`]), and drives each one on its own task with hyper's
//! HTTP/1 connection state machine and a cloned [`tower::Service`].

use std::future::{Future, IntoFuture};
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::{fmt, io};

use futures_util::future::FutureExt as _;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use tracing::instrument::Instrumented;
use tracing::{debug, trace, Instrument};

use crate::bridge::io::HyperIo;
use crate::bridge::service::TowerHyperService;
use crate::error::BoxError;
use crate::info::HasConnectionInfo;
use crate::push::Handshake;
use crate::stream::tcp::{TcpListener, TcpStream};
use crate::BoxFuture;

pub mod conn;

pub use self::conn::{Accept, AcceptExt, SecretAcceptor};

type Connection<A, S> = http1::Connection<HyperIo<<A as Accept>::Conn>, TowerHyperService<S>>;

/// A server that accepts connections and runs each one with a
/// [`tower::Service`] over HTTP/1.
pub struct Server<A, S> {
    incoming: A,
    service: S,
    protocol: http1::Builder,
}

impl<A, S> fmt::Debug for Server<A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").finish()
    }
}

impl<A, S> Server<A, S> {
    /// Create a new server with the given acceptor and service. The service
    /// is cloned for each connection.
    pub fn new(incoming: A, service: S) -> Self {
        Self {
            incoming,
            service,
            protocol: http1::Builder::new(),
        }
    }

    /// Use a custom HTTP/1 connection builder.
    pub fn with_protocol(mut self, protocol: http1::Builder) -> Self {
        self.protocol = protocol;
        self
    }

    /// The acceptor this server pulls connections from.
    pub fn incoming(&self) -> &A {
        &self.incoming
    }

    /// Shutdown the server gracefully when the given future resolves.
    pub fn with_graceful_shutdown<F, B>(self, signal: F) -> GracefulShutdown<A, S, F>
    where
        S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
        A: Accept + Unpin,
        F: Future<Output = ()> + Send + 'static,
    {
        GracefulShutdown::new(self, signal)
    }
}

impl<H, S> Server<SecretAcceptor<TcpListener, H>, S>
where
    H: Handshake<TcpStream>,
{
    /// Bind a TCP listener to `addr` and secure each accepted connection
    /// with `handshake`.
    pub async fn bind(addr: std::net::SocketAddr, handshake: H, service: S) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        debug!(addr = %listener.local_addr()?, "server listening");
        Ok(Server::new(SecretAcceptor::new(listener, handshake), service))
    }
}

impl<A, S, B> IntoFuture for Server<A, S>
where
    S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    A: Accept + Unpin,
{
    type IntoFuture = Serving<A, S>;
    type Output = Result<(), ServerError>;

    fn into_future(self) -> Self::IntoFuture {
        Serving { server: self }
    }
}

/// A future that drives the server to accept connections.
#[derive(Debug)]
#[pin_project::pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Serving<A, S> {
    server: Server<A, S>,
}

impl<A, S> Serving<A, S>
where
    A: Accept + Unpin,
{
    /// Polls the server to accept a single new connection.
    ///
    /// The returned connection should be spawned on the runtime.
    fn poll_once<B>(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Instrumented<Connection<A, S>>, ServerError>>
    where
        S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let server = self.project().server;

        let stream = ready!(Pin::new(&mut server.incoming).poll_accept(cx)).map_err(ServerError::accept)?;
        let remote = stream.info().remote_addr().to_string();
        trace!(%remote, "accepted connection");

        let span = tracing::span!(tracing::Level::TRACE, "connection", %remote);
        let conn = server
            .protocol
            .serve_connection(HyperIo::new(stream), TowerHyperService::new(server.service.clone()))
            .instrument(span);
        Poll::Ready(Ok(conn))
    }
}

impl<A, S, B> Future for Serving<A, S>
where
    S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    A: Accept + Unpin,
{
    type Output = Result<(), ServerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().poll_once(cx) {
                Poll::Ready(Ok(conn)) => {
                    tokio::spawn(async move {
                        if let Err(error) = conn.await {
                            debug!("connection error: {}", error);
                        }
                    });
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CloseSender(Option<tokio::sync::watch::Receiver<()>>);

impl CloseSender {
    fn send(&mut self) {
        let _ = self.0.take();
        trace!("sending close signal");
    }
}

#[derive(Debug, Clone)]
struct CloseReceiver(Arc<tokio::sync::watch::Sender<()>>);

impl IntoFuture for CloseReceiver {
    type IntoFuture = CloseFuture;
    type Output = ();

    fn into_future(self) -> Self::IntoFuture {
        CloseFuture(Box::pin(async move {
            self.0.closed().await;
        }))
    }
}

#[pin_project::pin_project]
struct CloseFuture(#[pin] BoxFuture<'static, ()>);

impl Future for CloseFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

/// Resolves once every `CloseSender` clone has sent or been dropped.
fn close() -> (CloseSender, CloseReceiver) {
    let (tx, rx) = tokio::sync::watch::channel(());
    (CloseSender(Some(rx)), CloseReceiver(Arc::new(tx)))
}

/// A server which stops accepting when a signal fires, then waits for its
/// open connections to finish.
#[pin_project::pin_project]
pub struct GracefulShutdown<A, S, F> {
    #[pin]
    server: Serving<A, S>,

    #[pin]
    signal: F,
    signalled: bool,

    channel: CloseReceiver,
    shutdown: CloseSender,

    #[pin]
    finished: CloseFuture,
    connection: CloseSender,
}

impl<A, S, F> GracefulShutdown<A, S, F>
where
    A: Accept + Unpin,
    F: Future<Output = ()>,
{
    fn new(server: Server<A, S>, signal: F) -> Self {
        let (tx, rx) = close();
        let (tx2, rx2) = close();
        Self {
            server: Serving { server },
            signal,
            signalled: false,
            channel: rx,
            shutdown: tx,
            finished: rx2.into_future(),
            connection: tx2,
        }
    }
}

impl<A, S, F> fmt::Debug for GracefulShutdown<A, S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulShutdown")
            .field("signalled", &self.signalled)
            .finish()
    }
}

impl<A, S, F, B> Future for GracefulShutdown<A, S, F>
where
    S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    A: Accept + Unpin,
    F: Future<Output = ()>,
{
    type Output = Result<(), ServerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if !*this.signalled {
            loop {
                if let Poll::Ready(()) = this.signal.as_mut().poll(cx) {
                    debug!("received shutdown signal");
                    *this.signalled = true;
                    this.shutdown.send();
                    this.connection.send();
                    break;
                }

                match this.server.as_mut().poll_once(cx) {
                    Poll::Ready(Ok(conn)) => {
                        let shutdown_rx = this.channel.clone();
                        let mut finished_tx = this.connection.clone();

                        tokio::spawn(async move {
                            let shutdown = shutdown_rx.into_future().fuse().instrument(conn.span().clone());
                            let mut shutdown = pin!(shutdown);
                            let mut conn = pin!(conn);
                            tokio::select! {
                                rv = &mut conn => {
                                    if let Err(error) = rv {
                                        debug!("connection error: {}", error);
                                    }
                                    debug!("connection closed");
                                },
                                _ = &mut shutdown => {
                                    debug!("connection received shutdown signal");
                                    conn.as_mut().inner_pin_mut().graceful_shutdown();
                                    if let Err(error) = conn.await {
                                        debug!("connection error during shutdown: {}", error);
                                    }
                                },
                            }
                            finished_tx.send();
                        });
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }

        ready!(this.finished.as_mut().poll(cx));
        debug!("all connections closed");
        Poll::Ready(Ok(()))
    }
}

/// An error that can occur when serving connections.
///
/// This error is only returned at the end of the server. Individual connection's
/// errors are logged and discarded.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Accept Error
    #[error("accept error: {0}")]
    Accept(#[source] BoxError),

    /// IO Errors
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    fn accept<A>(error: A) -> Self
    where
        A: Into<BoxError>,
    {
        let boxed = error.into();
        debug!("accept error: {}", boxed);
        Self::Accept(boxed)
    }
}
