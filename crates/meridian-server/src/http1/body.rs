//! Request body readers over the shared connection.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use meridian_core::io::SharedConn;
use meridian_core::{BodyReader, BoxFuture};
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

use super::parse::BodyKind;
use crate::error::ProtocolError;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const MAX_CHUNK_LINE: u64 = 4096;

/// Where body decoding stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Done,
}

impl From<BodyKind> for Framing {
    fn from(kind: BodyKind) -> Self {
        match kind {
            BodyKind::Empty => Self::Done,
            BodyKind::Length(n) => Self::Length(n),
            BodyKind::Chunked => Self::ChunkSize,
        }
    }
}

/// State shared by the body reader, the response writer and the
/// connection loop for one exchange.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub framing: Framing,
    /// `Expect: 100-continue` received and not yet answered.
    pub expect_continue: bool,
    /// The response head is on the wire.
    pub response_started: bool,
    /// The response requires the connection to close afterwards.
    pub close: bool,
}

pub(crate) type SharedExchange = Arc<Mutex<Exchange>>;

impl Exchange {
    pub fn shared(kind: BodyKind, expect_continue: bool, keep_alive: bool) -> SharedExchange {
        Arc::new(Mutex::new(Self {
            framing: kind.into(),
            expect_continue: expect_continue && kind != BodyKind::Empty,
            response_started: false,
            close: !keep_alive,
        }))
    }
}

/// Streams the request body from the connection.
pub(crate) struct ConnBody {
    conn: SharedConn,
    exchange: SharedExchange,
}

impl ConnBody {
    pub fn new(conn: SharedConn, exchange: SharedExchange) -> Self {
        Self { conn, exchange }
    }

    async fn read_chunk(&self) -> Result<Option<Bytes>, ProtocolError> {
        let mut conn = self.conn.lock().await;

        let answer_continue = {
            let mut exchange = self.exchange.lock();
            let pending = exchange.expect_continue;
            exchange.expect_continue = false;
            pending && !exchange.response_started
        };
        if answer_continue {
            conn.get_mut().write_all(CONTINUE).await?;
            conn.get_mut().flush().await?;
        }

        loop {
            let framing = self.exchange.lock().framing;
            let (next, chunk) = step(&mut *conn, framing).await?;
            self.exchange.lock().framing = next;
            if chunk.is_some() || next == Framing::Done {
                return Ok(chunk);
            }
        }
    }
}

impl BodyReader for ConnBody {
    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move { self.read_chunk().await.map_err(io::Error::from) })
    }

    fn remaining(&self) -> Option<u64> {
        match self.exchange.lock().framing {
            Framing::Length(n) => Some(n),
            Framing::Done => Some(0),
            _ => None,
        }
    }
}

/// Advances the decoder by one step, returning the next state and any
/// body bytes produced.
async fn step<R>(reader: &mut R, framing: Framing) -> Result<(Framing, Option<Bytes>), ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        Framing::Done => Ok((Framing::Done, None)),
        Framing::Length(remaining) => {
            let data = read_some(reader, remaining).await?;
            let left = remaining - data.len() as u64;
            let next = if left == 0 { Framing::Done } else { Framing::Length(left) };
            Ok((next, Some(data)))
        }
        Framing::ChunkSize => {
            let line = read_crlf_line(reader).await?;
            let size_text = line.split(|b| *b == b';').next().unwrap_or_default();
            let size_text = std::str::from_utf8(size_text)
                .map_err(|_| ProtocolError::InvalidChunk)?
                .trim();
            let size = u64::from_str_radix(size_text, 16).map_err(|_| ProtocolError::InvalidChunk)?;
            if size == 0 {
                skip_trailers(reader).await?;
                Ok((Framing::Done, None))
            } else {
                Ok((Framing::ChunkData(size), None))
            }
        }
        Framing::ChunkData(remaining) => {
            let data = read_some(reader, remaining).await?;
            let left = remaining - data.len() as u64;
            let next = if left == 0 { Framing::ChunkEnd } else { Framing::ChunkData(left) };
            Ok((next, Some(data)))
        }
        Framing::ChunkEnd => {
            if !read_crlf_line(reader).await?.is_empty() {
                return Err(ProtocolError::InvalidChunk);
            }
            Ok((Framing::ChunkSize, None))
        }
    }
}

async fn read_some<R>(reader: &mut R, max: u64) -> Result<Bytes, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let available = reader.fill_buf().await?;
    if available.is_empty() {
        return Err(ProtocolError::UnexpectedEof);
    }
    let n = available.len().min(usize::try_from(max).unwrap_or(usize::MAX));
    let data = Bytes::copy_from_slice(&available[..n]);
    reader.consume(n);
    Ok(data)
}

async fn read_crlf_line<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader.take(MAX_CHUNK_LINE).read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(ProtocolError::UnexpectedEof);
    }
    if line.pop() != Some(b'\n') {
        return Err(ProtocolError::InvalidChunk);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

async fn skip_trailers<R>(reader: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    while !read_crlf_line(reader).await?.is_empty() {}
    Ok(())
}
