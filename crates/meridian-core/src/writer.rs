//! The response writer abstraction.
//!
//! Transports implement [`ResponseWriter`] over their wire framing;
//! middleware such as compression and caching wrap the current writer with
//! their own and hand bytes through to the inner one.

use std::io;

use http::{HeaderMap, StatusCode};

use crate::handler::BoxFuture;
use crate::io::{HijackError, Hijacked};

/// Why an HTTP/2 push was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PushError {
    /// The transport or client does not support server push.
    #[error("server push is not supported")]
    Unsupported,
}

/// A streaming response writer.
///
/// Status and headers are mutable until they are emitted; afterwards header
/// changes are ignored (trailers named by a `Trailer` header excepted).
/// [`size`](Self::size) counts bytes handed to the transport, not bytes
/// buffered.
pub trait ResponseWriter: Send {
    /// Response headers.
    fn headers(&self) -> &HeaderMap;

    /// Mutable response headers.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// The response status (200 until set).
    fn status(&self) -> StatusCode;

    /// Commits the status. Calls after the first are ignored.
    fn write_header(&mut self, status: StatusCode);

    /// Returns `true` once the status is committed.
    fn header_written(&self) -> bool;

    /// Body bytes handed to the transport so far.
    fn size(&self) -> u64;

    /// Writes body bytes, committing a 200 status if none was set.
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>>;

    /// Forces buffered bytes out.
    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>>;

    /// Completes this layer of the response.
    ///
    /// Wrapping writers emit their pending output into the inner writer but
    /// leave it open; transport writers terminate the response framing.
    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>>;

    /// Surrenders the underlying connection.
    fn hijack(&mut self) -> Result<Hijacked, HijackError> {
        Err(HijackError::Unsupported)
    }

    /// Returns `true` once the connection was hijacked.
    fn is_hijacked(&self) -> bool {
        false
    }

    /// Initiates an HTTP/2 server push.
    fn push(&mut self, _target: &str, _headers: &HeaderMap) -> Result<(), PushError> {
        Err(PushError::Unsupported)
    }

    /// Detaches and returns the wrapped writer, if this writer wraps one.
    fn take_inner(&mut self) -> Option<Box<dyn ResponseWriter>> {
        None
    }
}

/// Placeholder left behind when a writer is moved out.
///
/// Wrapping writers swap it in from [`ResponseWriter::take_inner`]. Writes
/// fail with `NotConnected`.
#[derive(Debug, Default)]
pub struct Detached {
    headers: HeaderMap,
}

impl ResponseWriter for Detached {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn status(&self) -> StatusCode {
        StatusCode::OK
    }

    fn write_header(&mut self, _status: StatusCode) {}

    fn header_written(&self) -> bool {
        true
    }

    fn size(&self) -> u64 {
        0
    }

    fn write<'a>(&'a mut self, _data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async { Err(io::Error::new(io::ErrorKind::NotConnected, "writer detached")) })
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Writes all of `data`, retrying short writes.
pub async fn write_all(writer: &mut dyn ResponseWriter, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let n = writer.write(data).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "response writer closed"));
        }
        data = &data[n..];
    }
    Ok(())
}
