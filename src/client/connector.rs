//! Dialing remote endpoints and wrapping the connection in a secret socket.
//!
//! [`SecretConnector`] is a [`tower::Service`] from a [`Uri`] to a
//! [`SecretSocket`]: it resolves the host, opens a TCP connection with the
//! options in [`ConnectorConfig`], and hands the connection to a
//! [`Handshake`] in the [`Initiator`](Role::Initiator) role.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use tokio::net::TcpSocket;
use tracing::{trace, warn, Instrument};

use crate::adapter::{AdapterOptions, DuplexAdapter};
use crate::error::{ConfigError, ConnectError};
use crate::push::{Handshake, Role};
use crate::socket::SecretSocket;
use crate::stream::tcp::TcpStream;
use crate::BoxFuture;

/// Configuration for outgoing TCP connections.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// The timeout for connecting to a single remote address.
    pub connect_timeout: Option<Duration>,

    /// Idle time before TCP keep-alive probes start. `None` leaves
    /// keep-alive off.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<u32>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<u32>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// Dials remote endpoints and returns connected [`SecretSocket`]s.
///
/// # Example
/// ```no_run
/// # use duplexify::client::SecretConnector;
/// # use duplexify::push::plain::PlainHandshake;
/// # use tower::ServiceExt as _;
/// # async fn run() {
/// let handshake = PlainHandshake::new(&b"client"[..]).unwrap();
/// let connector = SecretConnector::new(handshake);
///
/// let uri = "http://127.0.0.1:8080".parse().unwrap();
/// let socket = connector.oneshot(uri).await.unwrap();
/// # }
/// ```
pub struct SecretConnector<H> {
    handshake: H,
    config: Arc<ConnectorConfig>,
    options: AdapterOptions,
}

impl<H: Clone> Clone for SecretConnector<H> {
    fn clone(&self) -> Self {
        Self {
            handshake: self.handshake.clone(),
            config: self.config.clone(),
            options: self.options.clone(),
        }
    }
}

impl<H> fmt::Debug for SecretConnector<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretConnector")
            .field("config", &self.config)
            .field("options", &self.options)
            .finish()
    }
}

impl<H> SecretConnector<H> {
    /// A connector with the default configuration.
    pub fn new(handshake: H) -> Self {
        Self {
            handshake,
            config: Arc::new(ConnectorConfig::default()),
            options: AdapterOptions::default(),
        }
    }

    /// Set the TCP connection configuration.
    pub fn with_config(mut self, config: ConnectorConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Use `options` for the adapter of every dialed socket.
    pub fn with_options(mut self, options: AdapterOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    /// Get the TCP connection configuration.
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// The handshake applied to dialed connections.
    pub fn handshake(&self) -> &H {
        &self.handshake
    }
}

impl<H> SecretConnector<H>
where
    H: Handshake<TcpStream>,
{
    /// Connect to `host` on `port` and start the handshake.
    ///
    /// Resolved addresses are tried in order; the first to connect wins.
    /// The handshake itself runs once the socket is first read or written.
    pub async fn connect(&self, host: &str, port: u16) -> Result<SecretSocket<H::Stream>, ConnectError> {
        let stream = self.connect_tcp(host, port).await?;
        if let Err(error) = stream.set_nodelay(self.config.nodelay) {
            warn!("tcp set_nodelay error: {}", error);
        }

        let stream = TcpStream::client(stream);
        trace!(remote = %stream.peer_addr().map(|a| a.to_string()).unwrap_or_default(), "tcp connected");

        let push = self.handshake.establish(stream, Role::Initiator);
        Ok(DuplexAdapter::build(push, self.options.clone()).into())
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<tokio::net::TcpStream, ConnectError> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(ConnectError::msg("dns resolution"))?;

        let mut last_error = None;
        for addr in addrs {
            let span = tracing::trace_span!("connect", %addr);
            match connect(addr, &self.config).instrument(span).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    trace!(%addr, "connection attempt failed: {}", error);
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConnectError::new(format!("no addresses found for {host}"))))
    }
}

impl<H> tower::Service<Uri> for SecretConnector<H>
where
    H: Handshake<TcpStream> + Clone + Send + Sync + 'static,
    H::Stream: Send + 'static,
{
    type Response = SecretSocket<H::Stream>;
    type Error = ConnectError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Uri) -> Self::Future {
        let (host, port) = match get_host_and_port(&req) {
            Ok((host, port)) => (host, port),
            Err(e) => return Box::pin(std::future::ready(Err(e))),
        };

        let connector = self.clone();
        let span = tracing::trace_span!("dial", host = %host, port = %port);

        Box::pin(async move { connector.connect(&host, port).await }.instrument(span))
    }
}

pub(crate) fn get_host_and_port(uri: &Uri) -> Result<(Box<str>, u16), ConnectError> {
    let host = uri.host().ok_or_else(|| ConnectError::new("invalid URI: missing host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = match uri.port_u16() {
        Some(port) => port,
        None => match uri.scheme_str() {
            Some("http") => 80,
            Some("https") => 443,
            _ => return Err(ConnectError::new("invalid URI: missing port")),
        },
    };

    Ok((host.into(), port))
}

async fn connect(addr: SocketAddr, config: &ConnectorConfig) -> Result<tokio::net::TcpStream, ConnectError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(ConnectError::msg("tcp open error"))?;

    {
        let _guard = tracing::trace_span!("socket_options").entered();

        if let Some(dur) = config.keep_alive_timeout {
            let conf = socket2::TcpKeepalive::new().with_time(dur);
            if let Err(e) = socket2::SockRef::from(&socket).set_tcp_keepalive(&conf) {
                warn!("tcp set_keepalive error: {}", e);
            }
        }

        if config.reuse_address {
            if let Err(e) = socket.set_reuseaddr(true) {
                warn!("tcp set_reuse_address error: {}", e);
            }
        }

        if let Some(size) = config.send_buffer_size {
            if let Err(e) = socket.set_send_buffer_size(size) {
                warn!("tcp set_buffer_size error: {}", e);
            }
        }

        if let Some(size) = config.recv_buffer_size {
            if let Err(e) = socket.set_recv_buffer_size(size) {
                warn!("tcp set_recv_buffer_size error: {}", e);
            }
        }
    }

    let connect = socket.connect(addr);
    match config.connect_timeout {
        Some(dur) => match tokio::time::timeout(dur, connect).await {
            Ok(result) => result,
            Err(elapsed) => {
                trace!(timeout = ?dur, "connection timed out");
                Err(io::Error::new(io::ErrorKind::TimedOut, elapsed))
            }
        },
        None => connect.await,
    }
    .map_err(ConnectError::msg("tcp connect error"))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tower::ServiceExt as _;

    use super::*;
    use crate::push::plain::PlainHandshake;
    use crate::stream::tcp::TcpListener;

    #[test]
    fn host_and_port_from_uri() {
        let uri: Uri = "http://example.com".parse().unwrap();
        assert_eq!(get_host_and_port(&uri).unwrap(), ("example.com".into(), 80));

        let uri: Uri = "https://example.com".parse().unwrap();
        assert_eq!(get_host_and_port(&uri).unwrap(), ("example.com".into(), 443));

        let uri: Uri = "http://[::1]:8080".parse().unwrap();
        assert_eq!(get_host_and_port(&uri).unwrap(), ("::1".into(), 8080));

        let uri: Uri = "ftp://example.com".parse().unwrap();
        assert!(get_host_and_port(&uri).is_err());

        let uri: Uri = "/hello".parse().unwrap();
        assert!(get_host_and_port(&uri).is_err());
    }

    #[tokio::test]
    async fn dials_and_handshakes() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 7];
            stream.read_exact(&mut hello).await.unwrap();
            assert_eq!(&hello, b"\x06client");
            stream.write_all(b"\x06server").await.unwrap();

            let mut data = [0u8; 4];
            stream.read_exact(&mut data).await.unwrap();
            assert_eq!(&data, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        let connector = SecretConnector::new(PlainHandshake::new(&b"client"[..]).unwrap());
        let uri: Uri = format!("http://{addr}").parse().unwrap();
        let mut socket = connector.oneshot(uri).await.unwrap();

        assert_eq!(socket.public_key(), Some(&b"client"[..]));
        socket.write_all(b"ping").await.unwrap();
        let mut reply = Vec::new();
        socket.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");
        server.await.unwrap();

        assert_eq!(socket.remote_public_key(), Some(&b"server"[..]));
        assert!(socket.bytes_written() >= 11);
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = SecretConnector::new(PlainHandshake::new(&b"client"[..]).unwrap());
        let error = connector.connect("127.0.0.1", addr.port()).await.unwrap_err();
        assert!(error.to_string().starts_with("tcp connect error"), "{error}");
    }
}
