//! In-memory response writer.
//!
//! [`ResponseRecorder`] is what the in-process test client and middleware
//! tests drive handlers against. Its [`Recording`] handle stays readable
//! after the recorder itself has been moved into a [`Context`](crate::Context).

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;

use crate::handler::BoxFuture;
use crate::writer::ResponseWriter;

#[derive(Debug, Default)]
struct Recorded {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    flushes: usize,
    finished: bool,
}

/// Shared view of what a [`ResponseRecorder`] received.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    inner: Arc<Mutex<Recorded>>,
}

impl Recording {
    /// The committed status, 200 if the handler never set one.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.lock().status.unwrap_or(StatusCode::OK)
    }

    /// Headers as they were when the status was committed.
    #[must_use]
    pub fn headers(&self) -> HeaderMap {
        self.inner.lock().headers.clone()
    }

    /// Returns the first value of header `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    }

    /// The body written so far.
    #[must_use]
    pub fn body(&self) -> Bytes {
        self.inner.lock().body.clone().freeze()
    }

    /// The body as UTF-8 text (lossy).
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().body).into_owned()
    }

    /// Number of explicit flushes.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.inner.lock().flushes
    }

    /// Returns `true` once the response was finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }
}

/// A [`ResponseWriter`] that records into memory.
#[derive(Debug)]
pub struct ResponseRecorder {
    headers: HeaderMap,
    status: StatusCode,
    header_written: bool,
    size: u64,
    recording: Recording,
}

impl ResponseRecorder {
    /// Creates a recorder and the handle to inspect it.
    #[must_use]
    pub fn new() -> (Self, Recording) {
        let recorder = Self {
            headers: HeaderMap::new(),
            status: StatusCode::OK,
            header_written: false,
            size: 0,
            recording: Recording::default(),
        };
        let recording = recorder.recording.clone();
        (recorder, recording)
    }

    fn commit(&mut self) {
        if !self.header_written {
            self.header_written = true;
            let mut recorded = self.recording.inner.lock();
            recorded.status = Some(self.status);
            recorded.headers = self.headers.clone();
        }
    }
}

impl ResponseWriter for ResponseRecorder {
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
            self.commit();
        }
    }

    fn header_written(&self) -> bool {
        self.header_written
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        self.commit();
        self.recording.inner.lock().body.extend_from_slice(data);
        self.size += data.len() as u64;
        let n = data.len();
        Box::pin(async move { Ok(n) })
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.commit();
        self.recording.inner.lock().flushes += 1;
        Box::pin(async { Ok(()) })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.commit();
        self.recording.inner.lock().finished = true;
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::write_all;

    #[tokio::test]
    async fn test_records_status_headers_body() {
        let (mut recorder, recording) = ResponseRecorder::new();
        recorder
            .headers_mut()
            .insert("content-type", "text/plain".parse().unwrap());
        recorder.write_header(StatusCode::CREATED);
        recorder.write_header(StatusCode::BAD_GATEWAY);
        recorder
            .headers_mut()
            .insert("x-late", "ignored".parse().unwrap());
        write_all(&mut recorder, b"hello").await.unwrap();
        recorder.finish().await.unwrap();

        assert_eq!(recording.status(), StatusCode::CREATED);
        assert_eq!(recording.header("content-type").as_deref(), Some("text/plain"));
        assert_eq!(recording.header("x-late"), None);
        assert_eq!(recording.text(), "hello");
        assert!(recording.is_finished());
        assert_eq!(recorder.size(), 5);
    }

    #[tokio::test]
    async fn test_write_commits_200() {
        let (mut recorder, recording) = ResponseRecorder::new();
        write_all(&mut recorder, b"x").await.unwrap();
        assert!(recorder.header_written());
        assert_eq!(recording.status(), StatusCode::OK);
    }
}
