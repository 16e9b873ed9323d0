//! Dialing secret sockets, and HTTP/1 requests over them.

use std::fmt;

use http::header::HOST;
use http::{HeaderValue, Request, Response, Uri};
use hyper::body::Incoming;
use thiserror::Error;
use tracing::{debug, Instrument};

use crate::bridge::io::HyperIo;
use crate::error::{BoxError, ConnectError};
use crate::push::Handshake;
use crate::stream::tcp::TcpStream;

mod connector;

pub use self::connector::{ConnectorConfig, SecretConnector};

/// Client error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Error occured while dialing the remote endpoint.
    #[error("transport: {0}")]
    Transport(#[from] ConnectError),

    /// Error occured in the HTTP protocol exchange.
    #[error("protocol: {0}")]
    Protocol(#[from] hyper::Error),

    /// The request could not be sent as given, such as an invalid URI.
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
}

/// A minimal HTTP/1 client which opens a fresh secret socket for every
/// request.
pub struct Client<H> {
    connector: SecretConnector<H>,
}

impl<H: Clone> Clone for Client<H> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
        }
    }
}

impl<H> fmt::Debug for Client<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connector", &self.connector)
            .finish()
    }
}

impl<H> From<SecretConnector<H>> for Client<H> {
    fn from(connector: SecretConnector<H>) -> Self {
        Self { connector }
    }
}

impl<H> Client<H> {
    /// A client dialing with `handshake` and the default configuration.
    pub fn new(handshake: H) -> Self {
        SecretConnector::new(handshake).into()
    }

    /// The connector used to dial each request.
    pub fn connector(&self) -> &SecretConnector<H> {
        &self.connector
    }
}

impl<H> Client<H>
where
    H: Handshake<TcpStream>,
    H::Stream: Send + Unpin + 'static,
{
    /// Send a request on a new connection to the request's authority.
    ///
    /// The connection is closed once the response body has been read or
    /// dropped.
    pub async fn request<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>, Error>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let (host, port) = connector::get_host_and_port(req.uri())?;
        let socket = self.connector.connect(&host, port).await?;

        if !req.headers().contains_key(HOST) {
            if let Some(authority) = req.uri().authority() {
                let value = HeaderValue::from_str(authority.as_str()).map_err(http::Error::from)?;
                req.headers_mut().insert(HOST, value);
            }
        }
        *req.uri_mut() = origin_form(req.uri())?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(HyperIo::new(socket)).await?;

        let span = tracing::trace_span!("client connection", %host, port);
        tokio::spawn(
            async move {
                if let Err(error) = conn.await {
                    debug!("connection error: {}", error);
                }
            }
            .instrument(span),
        );

        Ok(sender.send_request(req).await?)
    }

    /// Send a `GET` request with an empty body.
    pub async fn get(&self, uri: Uri) -> Result<Response<Incoming>, Error> {
        let req = Request::get(uri).body(String::new())?;
        self.request(req).await
    }
}

fn origin_form(uri: &Uri) -> Result<Uri, http::Error> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Ok(path.parse::<Uri>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync, Into<BoxError>);

    #[test]
    fn origin_form_keeps_path_and_query() {
        let uri: Uri = "http://example.com/hello?name=world".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/hello?name=world");

        let uri: Uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/");
    }

    #[tokio::test]
    async fn request_without_host_is_a_transport_error() {
        let client = Client::new(crate::push::plain::PlainHandshake::new(&b"client"[..]).unwrap());
        let error = client.get("/hello".parse().unwrap()).await.unwrap_err();
        assert!(matches!(error, Error::Transport(_)), "{error}");
    }
}
