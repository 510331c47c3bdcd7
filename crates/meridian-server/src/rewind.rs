//! Protocol sniffing.
//!
//! The first bytes of a connection decide between HTTP/1 and the HTTP/2
//! prior-knowledge preface. [`Rewind`] replays the sniffed bytes before
//! reading on from the socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// The HTTP/2 connection preface.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// An I/O object with bytes pushed back in front of it.
#[derive(Debug)]
pub struct Rewind<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Rewind<T> {
    /// Replays `prefix` before reading from `inner`.
    pub fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> Rewind<T> {
    /// Reads until the bytes seen either diverge from the HTTP/2 preface or
    /// complete it. Returns whether the preface was seen.
    ///
    /// # Errors
    ///
    /// Propagates read errors.
    pub async fn sniff_h2(inner: T) -> io::Result<(bool, Self)> {
        let mut inner = inner;
        let mut seen = BytesMut::with_capacity(H2_PREFACE.len());
        loop {
            let mut chunk = [0u8; 24];
            let want = H2_PREFACE.len() - seen.len();
            let n = inner.read(&mut chunk[..want]).await?;
            seen.extend_from_slice(&chunk[..n]);
            let matches = H2_PREFACE.starts_with(&seen);
            if n == 0 || !matches || seen.len() == H2_PREFACE.len() {
                let is_h2 = matches && seen.len() == H2_PREFACE.len();
                return Ok((is_h2, Self::new(seen.freeze(), inner)));
            }
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_http1_is_replayed() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(client);

        let (is_h2, mut io) = Rewind::sniff_h2(server).await.unwrap();
        assert!(!is_h2);
        let mut all = Vec::new();
        io.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_preface_across_reads() {
        let (mut client, server) = tokio::io::duplex(256);
        let sniff = tokio::spawn(Rewind::sniff_h2(server));
        client.write_all(&H2_PREFACE[..5]).await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(&H2_PREFACE[5..]).await.unwrap();

        let (is_h2, mut io) = sniff.await.unwrap().unwrap();
        assert!(is_h2);
        let mut replay = vec![0u8; H2_PREFACE.len()];
        io.read_exact(&mut replay).await.unwrap();
        assert_eq!(replay, H2_PREFACE);
    }

    #[tokio::test]
    async fn test_short_connection() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"PR").await.unwrap();
        drop(client);
        let (is_h2, _) = Rewind::sniff_h2(server).await.unwrap();
        assert!(!is_h2);
    }
}
