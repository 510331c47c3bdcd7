//! Connection I/O shared between request bodies, response writers and
//! hijackers.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// A byte stream a transport can serve: TCP, Unix sockets, TLS streams or
/// in-memory duplex pipes in tests.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A connection with its read buffer. Writes pass straight through.
pub type ConnStream = BufReader<Box<dyn AsyncIo>>;

/// A connection shared by the body reader and the response writer of the
/// request currently being served.
pub type SharedConn = Arc<Mutex<ConnStream>>;

/// Wraps an I/O object into a [`SharedConn`] with the given read buffer size.
pub fn shared_conn(io: impl AsyncIo, read_buffer: usize) -> SharedConn {
    let boxed: Box<dyn AsyncIo> = Box::new(io);
    Arc::new(Mutex::new(BufReader::with_capacity(read_buffer, boxed)))
}

/// Why a hijack was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HijackError {
    /// The transport cannot surrender its connection (HTTP/2, FastCGI, tests).
    #[error("connection hijacking is not supported by this transport")]
    Unsupported,
    /// The connection was already hijacked.
    #[error("connection already hijacked")]
    AlreadyHijacked,
    /// The connection is busy (a body read is in progress).
    #[error("connection is in use")]
    Busy,
}

/// A connection surrendered by [`ResponseWriter::hijack`](crate::ResponseWriter::hijack).
///
/// Buffered but unread request bytes stay readable. Dropping the handle
/// closes the connection and cancels the request.
pub struct Hijacked {
    conn: OwnedMutexGuard<ConnStream>,
    cancel: CancellationToken,
}

impl Hijacked {
    /// Takes exclusive ownership of a shared connection.
    pub fn new(conn: OwnedMutexGuard<ConnStream>, cancel: CancellationToken) -> Self {
        Self { conn, cancel }
    }

    /// Bytes read from the socket but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        self.conn.buffer()
    }
}

impl std::fmt::Debug for Hijacked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hijacked")
            .field("buffered", &self.conn.buffer().len())
            .finish()
    }
}

impl Drop for Hijacked {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl AsyncRead for Hijacked {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.conn).poll_read(cx, buf)
    }
}

impl AsyncBufRead for Hijacked {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut *self.get_mut().conn).poll_fill_buf(cx)
    }

    fn consume(mut self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut *self.conn).consume(amt);
    }
}

impl AsyncWrite for Hijacked {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.conn).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.conn).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.conn).poll_shutdown(cx)
    }
}
