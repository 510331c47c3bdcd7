//! Request construction for the in-process client.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri};
use meridian_core::{Request, TlsInfo};
use serde::Serialize;

use crate::error::TestError;

/// Builds a [`meridian_core::Request`].
///
/// Invalid header names or values are remembered and reported by
/// [`build`](Self::build), so chains never panic halfway.
#[must_use]
#[derive(Debug)]
pub struct TestRequestBuilder {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    tls: Option<TlsInfo>,
    error: Option<TestError>,
}

impl TestRequestBuilder {
    /// Starts a request for `method` and `uri` (path plus optional query).
    pub fn new(method: Method, uri: impl AsRef<str>) -> Self {
        Self {
            method,
            uri: uri.as_ref().to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
            tls: None,
            error: None,
        }
    }

    /// Appends a header.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        match (
            HeaderName::try_from(name.as_ref()),
            HeaderValue::try_from(value.as_ref()),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => {
                self.error.get_or_insert(TestError::RequestBuild(format!(
                    "invalid header {}: {}",
                    name.as_ref(),
                    value.as_ref()
                )));
            }
        }
        self
    }

    /// Sets `Content-Type`.
    pub fn content_type(self, content_type: impl AsRef<str>) -> Self {
        self.header(header::CONTENT_TYPE.as_str(), content_type)
    }

    /// Sets `Authorization: Bearer <token>`.
    pub fn bearer_token(self, token: impl AsRef<str>) -> Self {
        self.header(
            header::AUTHORIZATION.as_str(),
            format!("Bearer {}", token.as_ref()),
        )
    }

    /// Sets the raw body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body and its content type.
    pub fn json<T: Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.body = Bytes::from(bytes),
            Err(err) => {
                self.error.get_or_insert(TestError::Json(err));
            }
        }
        self.content_type("application/json")
    }

    /// Sets an `application/x-www-form-urlencoded` body from a flat object.
    pub fn form<T: Serialize>(mut self, value: &T) -> Self {
        match form_encode(value) {
            Ok(encoded) => self.body = Bytes::from(encoded),
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
        self.content_type("application/x-www-form-urlencoded")
    }

    /// Sets the peer address seen by handlers.
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Marks the request as received over TLS.
    pub fn tls(mut self, server_name: impl Into<String>) -> Self {
        self.tls = Some(TlsInfo {
            server_name: Some(server_name.into()),
            alpn: None,
        });
        self
    }

    /// Assembles the request.
    ///
    /// # Errors
    ///
    /// Returns the first header or body error, or an invalid URI.
    pub fn build(self) -> Result<Request, TestError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let uri: Uri = self
            .uri
            .parse()
            .map_err(|e| TestError::RequestBuild(format!("invalid URI {}: {e}", self.uri)))?;

        let mut request = Request::new(self.method, uri)
            .with_headers(self.headers)
            .with_body(self.body);
        if let Some(addr) = self.remote_addr {
            request = request.with_remote_addr(addr);
        }
        if let Some(tls) = self.tls {
            request = request.with_tls(tls);
        }
        Ok(request)
    }
}

fn form_encode<T: Serialize>(value: &T) -> Result<String, TestError> {
    let serde_json::Value::Object(map) = serde_json::to_value(value)? else {
        return Err(TestError::RequestBuild(
            "form bodies need an object".to_string(),
        ));
    };
    let pairs: Vec<String> = map
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            format!("{}={}", urlencoding::encode(&key), urlencoding::encode(&value))
        })
        .collect();
    Ok(pairs.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_get() {
        let request = TestRequestBuilder::new(Method::GET, "/users/7?full=1")
            .header("X-Trace", "abc")
            .build()
            .unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.path(), "/users/7");
        assert_eq!(request.query(), Some("full=1"));
        assert_eq!(request.header("x-trace"), Some("abc"));
    }

    #[test]
    fn test_repeated_headers_append() {
        let request = TestRequestBuilder::new(Method::GET, "/")
            .header("Accept", "text/html")
            .header("Accept", "application/json")
            .build()
            .unwrap();
        assert_eq!(request.headers().get_all("accept").iter().count(), 2);
    }

    #[test]
    fn test_invalid_header_reported_at_build() {
        let result = TestRequestBuilder::new(Method::GET, "/")
            .header("bad header", "x")
            .build();
        assert!(matches!(result, Err(TestError::RequestBuild(_))));
    }

    #[test]
    fn test_json_body() {
        let mut request = TestRequestBuilder::new(Method::POST, "/members")
            .json(&json!({"user": "alice"}))
            .build()
            .unwrap();
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert!(!request.body_mut().is_empty());
    }

    #[test]
    fn test_form_body() {
        assert_eq!(
            form_encode(&json!({"name": "a b", "n": 3})).unwrap(),
            "name=a%20b&n=3"
        );
        assert!(form_encode(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_remote_addr_and_tls() {
        let addr: SocketAddr = "10.1.2.3:4000".parse().unwrap();
        let request = TestRequestBuilder::new(Method::GET, "/")
            .remote_addr(addr)
            .tls("example.com")
            .build()
            .unwrap();
        assert_eq!(request.remote_addr(), Some(addr));
        assert!(request.is_tls());
    }
}
