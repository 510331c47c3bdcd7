//! Captured responses and assertions.

use std::fmt;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use meridian_core::Recording;
use serde::de::DeserializeOwned;

use crate::error::TestError;

/// A completed response with assertion helpers.
///
/// The assertion methods return `&Self` so they chain:
///
/// ```ignore
/// client
///     .get("/users/7")
///     .send()
///     .await
///     .assert_status(StatusCode::OK)
///     .assert_header("content-type", "application/json")
///     .assert_json_field("user", &json!("7"));
/// ```
#[derive(Clone)]
pub struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl TestResponse {
    /// Creates a response from its parts.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Snapshots what an in-memory writer recorded.
    pub fn from_recording(recording: &Recording) -> Self {
        Self::new(recording.status(), recording.headers(), recording.body())
    }

    /// The status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The status as a number.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// 4xx.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// 5xx.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// All headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of header `name`.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&HeaderValue> {
        self.headers.get(name.as_ref())
    }

    /// First value of header `name` as text.
    pub fn header_str(&self, name: impl AsRef<str>) -> Option<&str> {
        self.header(name).and_then(|v| v.to_str().ok())
    }

    /// `Content-Type`, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header_str(header::CONTENT_TYPE.as_str())
    }

    /// `Content-Length`, if present and numeric.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header_str(header::CONTENT_LENGTH.as_str())?
            .parse()
            .ok()
    }

    /// Raw body bytes.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::BodyRead`] for invalid UTF-8.
    pub fn text(&self) -> Result<String, TestError> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| TestError::BodyRead(format!("invalid UTF-8: {e}")))
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Json`] when the body does not decode into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TestError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Decodes the body as an untyped JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Json`] for invalid JSON.
    pub fn json_value(&self) -> Result<serde_json::Value, TestError> {
        self.json()
    }

    /// # Panics
    ///
    /// Panics if the status differs.
    pub fn assert_status(&self, expected: StatusCode) -> &Self {
        assert_eq!(
            self.status,
            expected,
            "expected status {expected}, got {} with body {:?}",
            self.status,
            String::from_utf8_lossy(&self.body)
        );
        self
    }

    /// # Panics
    ///
    /// Panics if the status is not 2xx.
    pub fn assert_success(&self) -> &Self {
        assert!(self.is_success(), "expected success, got {}", self.status);
        self
    }

    /// # Panics
    ///
    /// Panics if the header is missing or differs.
    pub fn assert_header(&self, name: impl AsRef<str>, expected: impl AsRef<str>) -> &Self {
        let name = name.as_ref();
        let expected = expected.as_ref();
        let actual = self
            .header_str(name)
            .unwrap_or_else(|| panic!("header '{name}' not found"));
        assert_eq!(actual, expected, "header '{name}'");
        self
    }

    /// # Panics
    ///
    /// Panics if the header is present.
    pub fn assert_no_header(&self, name: impl AsRef<str>) -> &Self {
        let name = name.as_ref();
        assert!(
            self.header(name).is_none(),
            "header '{name}' unexpectedly present: {:?}",
            self.header(name)
        );
        self
    }

    /// # Panics
    ///
    /// Panics unless `Content-Type` starts with `expected`.
    pub fn assert_content_type(&self, expected: impl AsRef<str>) -> &Self {
        let expected = expected.as_ref();
        let actual = self.content_type().unwrap_or_default();
        assert!(
            actual.starts_with(expected),
            "Content-Type: expected '{expected}', got '{actual}'"
        );
        self
    }

    /// # Panics
    ///
    /// Panics unless the body contains `expected`.
    pub fn assert_body_contains(&self, expected: impl AsRef<str>) -> &Self {
        let expected = expected.as_ref();
        let body = String::from_utf8_lossy(&self.body);
        assert!(body.contains(expected), "body should contain '{expected}', got: {body}");
        self
    }

    /// # Panics
    ///
    /// Panics unless the body equals `expected`.
    pub fn assert_body_eq(&self, expected: impl AsRef<str>) -> &Self {
        assert_eq!(String::from_utf8_lossy(&self.body), expected.as_ref(), "body mismatch");
        self
    }

    /// # Panics
    ///
    /// Panics unless the JSON body equals `expected`.
    pub fn assert_json_eq(&self, expected: &serde_json::Value) -> &Self {
        let actual = self.json_value().expect("body should be JSON");
        assert_eq!(&actual, expected, "JSON body mismatch");
        self
    }

    /// Checks one field addressed by a dotted path (`error.code`,
    /// `items.0.name`).
    ///
    /// # Panics
    ///
    /// Panics if the path is missing or the value differs.
    pub fn assert_json_field(&self, path: impl AsRef<str>, expected: &serde_json::Value) -> &Self {
        let path = path.as_ref();
        let json = self.json_value().expect("body should be JSON");
        let actual = json_path(&json, path)
            .unwrap_or_else(|| panic!("JSON path '{path}' not found in {json}"));
        assert_eq!(actual, expected, "JSON field '{path}'");
        self
    }
}

impl fmt::Debug for TestResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &String::from_utf8_lossy(&self.body))
            .finish()
    }
}

fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
