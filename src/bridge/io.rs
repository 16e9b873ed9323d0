//! Present tokio streams to hyper.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::rt::{Read, ReadBufCursor, Write};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Bytes staged per read on their way into hyper's cursor.
const STAGING: usize = 8 * 1024;

/// Wraps a tokio `AsyncRead + AsyncWrite` stream (such as a
/// [`SecretSocket`][crate::socket::SecretSocket]) so hyper can drive it.
///
/// Reads are staged through an initialized buffer and copied into hyper's
/// cursor, so no uninitialized memory is ever handed to the stream.
#[derive(Debug)]
#[pin_project::pin_project]
pub struct HyperIo<T> {
    #[pin]
    inner: T,
}

impl<T> HyperIo<T> {
    /// Wrap `inner`.
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T: AsyncRead> Read for HyperIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let mut staging = [0u8; STAGING];
        let len = buf.remaining().min(STAGING);
        let mut staged = ReadBuf::new(&mut staging[..len]);

        futures_core::ready!(AsyncRead::poll_read(self.project().inner, cx, &mut staged))?;
        buf.put_slice(staged.filled());
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite> Write for HyperIo<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().inner, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(self.project().inner, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(self.project().inner, cx)
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::mem::MaybeUninit;

    use super::*;
    use crate::stream::duplex::DuplexStream;

    #[tokio::test]
    async fn reads_and_writes_through_hyper_traits() {
        let (a, b) = DuplexStream::new(64);
        let mut a = HyperIo::new(a);
        let mut b = HyperIo::new(b);

        let n = poll_fn(|cx| Pin::new(&mut a).poll_write(cx, b"ping"))
            .await
            .unwrap();
        assert_eq!(n, 4);
        poll_fn(|cx| Pin::new(&mut a).poll_shutdown(cx))
            .await
            .unwrap();

        let mut storage = [MaybeUninit::uninit(); 16];
        let mut buf = hyper::rt::ReadBuf::uninit(&mut storage);
        poll_fn(|cx| Pin::new(&mut b).poll_read(cx, buf.unfilled()))
            .await
            .unwrap();
        assert_eq!(buf.filled(), b"ping");
        assert_eq!(crate::stream::RawTransport::bytes_read(&b.inner), 4);
    }

    #[tokio::test]
    async fn reads_never_overrun_a_short_cursor() {
        let (a, b) = DuplexStream::new(64);
        let mut a = HyperIo::new(a);
        let mut b = HyperIo::new(b);

        poll_fn(|cx| Pin::new(&mut a).poll_write(cx, b"abcdef"))
            .await
            .unwrap();

        let mut storage = [MaybeUninit::uninit(); 4];
        let mut buf = hyper::rt::ReadBuf::uninit(&mut storage);
        poll_fn(|cx| Pin::new(&mut b).poll_read(cx, buf.unfilled()))
            .await
            .unwrap();
        assert_eq!(buf.filled(), b"abcd");

        let mut storage = [MaybeUninit::uninit(); 4];
        let mut buf = hyper::rt::ReadBuf::uninit(&mut storage);
        poll_fn(|cx| Pin::new(&mut b).poll_read(cx, buf.unfilled()))
            .await
            .unwrap();
        assert_eq!(buf.filled(), b"ef");
    }
}
