//! In-process client.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::Method;
use meridian_core::Context;
use meridian_server::Routes;
use serde::Serialize;

use crate::error::TestError;
use crate::request::TestRequestBuilder;
use crate::response::TestResponse;

/// Drives a [`Routes`] table without a socket.
///
/// Each request runs through the global middleware, the router and the
/// matched chain against an in-memory writer, exactly as a transport would
/// run it, then the response is finished and captured.
///
/// ```ignore
/// let client = TestClient::new(routes);
/// let response = client.get("/users/7").header("Accept", "application/json").send().await;
/// response.assert_status(StatusCode::OK);
/// ```
#[must_use]
#[derive(Clone)]
pub struct TestClient {
    routes: Arc<Routes>,
    default_headers: Vec<(String, String)>,
    remote_addr: SocketAddr,
}

impl TestClient {
    /// Wraps a route table.
    pub fn new(routes: Routes) -> Self {
        Self::from_arc(Arc::new(routes))
    }

    /// Wraps a shared route table.
    pub fn from_arc(routes: Arc<Routes>) -> Self {
        Self {
            routes,
            default_headers: Vec::new(),
            remote_addr: SocketAddr::from(([127, 0, 0, 1], 40000)),
        }
    }

    /// Adds a header sent with every request.
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Sets the peer address handlers see (default `127.0.0.1:40000`).
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = addr;
        self
    }

    /// The table being driven.
    #[must_use]
    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    /// `GET`.
    pub fn get(&self, uri: impl AsRef<str>) -> TestClientRequest<'_> {
        self.request(Method::GET, uri)
    }

    /// `POST`.
    pub fn post(&self, uri: impl AsRef<str>) -> TestClientRequest<'_> {
        self.request(Method::POST, uri)
    }

    /// `PUT`.
    pub fn put(&self, uri: impl AsRef<str>) -> TestClientRequest<'_> {
        self.request(Method::PUT, uri)
    }

    /// `DELETE`.
    pub fn delete(&self, uri: impl AsRef<str>) -> TestClientRequest<'_> {
        self.request(Method::DELETE, uri)
    }

    /// `HEAD`.
    pub fn head(&self, uri: impl AsRef<str>) -> TestClientRequest<'_> {
        self.request(Method::HEAD, uri)
    }

    /// `OPTIONS`.
    pub fn options(&self, uri: impl AsRef<str>) -> TestClientRequest<'_> {
        self.request(Method::OPTIONS, uri)
    }

    /// Any method.
    pub fn request(&self, method: Method, uri: impl AsRef<str>) -> TestClientRequest<'_> {
        let mut builder = TestRequestBuilder::new(method, uri).remote_addr(self.remote_addr);
        for (name, value) in &self.default_headers {
            builder = builder.header(name, value);
        }
        TestClientRequest {
            client: self,
            builder,
        }
    }

    async fn execute(&self, builder: TestRequestBuilder) -> Result<TestResponse, TestError> {
        let request = builder.build()?;
        let (mut ctx, recording) = Context::recorded(request);
        self.routes.dispatch(&mut ctx).await;
        ctx.finish().await?;
        drop(ctx);
        Ok(TestResponse::from_recording(&recording))
    }
}

/// A request bound to a [`TestClient`].
#[must_use]
pub struct TestClientRequest<'a> {
    client: &'a TestClient,
    builder: TestRequestBuilder,
}

impl TestClientRequest<'_> {
    /// Appends a header.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.builder = self.builder.header(name, value);
        self
    }

    /// Sets `Content-Type`.
    pub fn content_type(mut self, content_type: impl AsRef<str>) -> Self {
        self.builder = self.builder.content_type(content_type);
        self
    }

    /// Sets a bearer token.
    pub fn bearer_token(mut self, token: impl AsRef<str>) -> Self {
        self.builder = self.builder.bearer_token(token);
        self
    }

    /// Sets HTTP Basic credentials.
    pub fn basic_auth(self, user: &str, password: &str) -> Self {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        self.header("Authorization", format!("Basic {encoded}"))
    }

    /// Sets the raw body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.builder = self.builder.body(body);
        self
    }

    /// Sets a JSON body.
    pub fn json<T: Serialize>(mut self, value: &T) -> Self {
        self.builder = self.builder.json(value);
        self
    }

    /// Sets a form body.
    pub fn form<T: Serialize>(mut self, value: &T) -> Self {
        self.builder = self.builder.form(value);
        self
    }

    /// Overrides the peer address.
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.builder = self.builder.remote_addr(addr);
        self
    }

    /// Runs the request.
    ///
    /// # Panics
    ///
    /// Panics if the request cannot be built or finished; use
    /// [`try_send`](Self::try_send) to observe the error instead.
    pub async fn send(self) -> TestResponse {
        match self.try_send().await {
            Ok(response) => response,
            Err(err) => panic!("test request failed: {err}"),
        }
    }

    /// Runs the request, returning build and finish errors.
    ///
    /// # Errors
    ///
    /// Fails on an invalid header or URI, or if finishing the response fails.
    pub async fn try_send(self) -> Result<TestResponse, TestError> {
        self.client.execute(self.builder).await
    }
}
