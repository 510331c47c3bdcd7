//! Response writer emitting `STDOUT` records.
//!
//! The response head travels as CGI-style header lines at the start of the
//! `STDOUT` stream (`Status: 200 OK` first). Framing on the client side is
//! the web server's job; a response that fits the buffer gets a
//! `Content-Length` all the same.

use std::io;

use bytes::BytesMut;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderValue, StatusCode};
use meridian_core::io::SharedConn;
use meridian_core::{BoxFuture, ResponseWriter};
use tokio::io::AsyncWriteExt;

use super::record::{encode_record, RecordType};

pub(crate) struct FcgiWriter {
    conn: SharedConn,
    request_id: u16,
    headers: HeaderMap,
    status: StatusCode,
    header_written: bool,
    head_sent: bool,
    finished: bool,
    buffer: BytesMut,
    buffer_size: usize,
    size: u64,
}

impl FcgiWriter {
    pub fn new(conn: SharedConn, request_id: u16, buffer_size: usize) -> Self {
        Self {
            conn,
            request_id,
            headers: HeaderMap::new(),
            status: StatusCode::OK,
            header_written: false,
            head_sent: false,
            finished: false,
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size,
            size: 0,
        }
    }

    fn encode_head(&self, out: &mut BytesMut) {
        out.extend_from_slice(
            format!(
                "Status: {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }

    /// Sends the head (once) and the buffered body as `STDOUT` records.
    async fn emit(&mut self, terminate: bool) -> io::Result<()> {
        let mut stdout = BytesMut::new();
        if !self.head_sent {
            self.encode_head(&mut stdout);
            self.head_sent = true;
            self.header_written = true;
        }
        let body_len = self.buffer.len();
        stdout.extend_from_slice(&self.buffer);
        self.buffer.clear();

        let mut out = BytesMut::with_capacity(stdout.len() + 32);
        if !stdout.is_empty() {
            encode_record(&mut out, RecordType::Stdout, self.request_id, &stdout);
        }
        if terminate {
            encode_record(&mut out, RecordType::Stdout, self.request_id, &[]);
        }
        if out.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;
        conn.get_mut().write_all(&out).await?;
        conn.get_mut().flush().await?;
        self.size += body_len as u64;
        Ok(())
    }
}

impl ResponseWriter for FcgiWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn write_header(&mut self, status: StatusCode) {
        if !self.header_written {
            self.status = status;
            self.header_written = true;
        }
    }

    fn header_written(&self) -> bool {
        self.header_written
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            if self.finished {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "response finished"));
            }
            self.header_written = true;
            self.buffer.extend_from_slice(data);
            if self.buffer.len() >= self.buffer_size {
                self.emit(false).await?;
            }
            Ok(data.len())
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if self.finished {
                return Ok(());
            }
            self.emit(false).await
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if self.finished {
                return Ok(());
            }
            self.finished = true;
            let bodiless = self.status.is_informational()
                || self.status == StatusCode::NO_CONTENT
                || self.status == StatusCode::NOT_MODIFIED;
            if !self.head_sent && !bodiless && !self.headers.contains_key(CONTENT_LENGTH) {
                self.headers.insert(CONTENT_LENGTH, HeaderValue::from(self.buffer.len()));
            }
            self.emit(true).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcgi::record::read_record;
    use meridian_core::io::shared_conn;
    use meridian_core::write_all;

    async fn stdout_of(client: &mut tokio::io::DuplexStream) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        loop {
            let record = read_record(client).await.unwrap().unwrap();
            assert_eq!(record.kind, RecordType::Stdout);
            assert_eq!(record.request_id, 3);
            if record.content.is_empty() {
                return records;
            }
            records.push(record.content.to_vec());
        }
    }

    #[tokio::test]
    async fn test_small_response_gets_length() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = FcgiWriter::new(shared_conn(server, 64), 3, 2048);
        writer.headers_mut().insert("content-type", HeaderValue::from_static("text/plain"));
        writer.write_header(StatusCode::CREATED);
        write_all(&mut writer, b"made").await.unwrap();
        writer.finish().await.unwrap();

        let records = stdout_of(&mut client).await;
        assert_eq!(records.len(), 1);
        assert_eq!(
            String::from_utf8(records[0].clone()).unwrap(),
            "Status: 201 Created\r\ncontent-type: text/plain\r\ncontent-length: 4\r\n\r\nmade"
        );
        assert_eq!(writer.size(), 4);
    }

    #[tokio::test]
    async fn test_overflow_streams_without_length() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = FcgiWriter::new(shared_conn(server, 64), 3, 4);
        write_all(&mut writer, b"abcdef").await.unwrap();
        write_all(&mut writer, b"gh").await.unwrap();
        writer.finish().await.unwrap();

        let records = stdout_of(&mut client).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], b"Status: 200 OK\r\n\r\nabcdef");
        assert_eq!(records[1], b"gh");
        assert!(writer.write(b"late").await.is_err());
    }
}
