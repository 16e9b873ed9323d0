//! Error types shared across the adapter, sockets and bridges.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error type used where the concrete error is not interesting.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error raised by a push stream or its raw transport.
///
/// The same failure has to reach several waiters (a pending read, a pending
/// write, a half-close and the close notification), so the underlying
/// [`io::Error`] is shared rather than copied.
#[derive(Debug, Clone, Error)]
#[error(transparent)]
pub struct StreamError(Arc<io::Error>);

impl StreamError {
    /// The kind of the underlying I/O error.
    pub fn kind(&self) -> io::ErrorKind {
        self.0.kind()
    }

    /// Borrow the underlying I/O error.
    pub fn get_ref(&self) -> &io::Error {
        &self.0
    }

    pub(crate) fn closed() -> Self {
        io::Error::new(io::ErrorKind::BrokenPipe, "stream closed").into()
    }

    pub(crate) fn write_after_end() -> Self {
        io::Error::new(io::ErrorKind::BrokenPipe, "write after end").into()
    }
}

impl From<io::Error> for StreamError {
    fn from(error: io::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl From<StreamError> for io::Error {
    fn from(error: StreamError) -> Self {
        match Arc::try_unwrap(error.0) {
            Ok(error) => error,
            Err(shared) => io::Error::new(shared.kind(), StreamError(shared)),
        }
    }
}

/// Invalid configuration passed when constructing an adapter or stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {message}")]
pub struct ConfigError {
    message: &'static str,
}

impl ConfigError {
    pub(crate) fn new(message: &'static str) -> Self {
        Self { message }
    }
}

/// Error returned when dialing a remote endpoint fails.
#[derive(Debug, Error)]
pub struct ConnectError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ConnectError {
    pub(crate) fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        move |error| Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}
