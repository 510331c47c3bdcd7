//! HTTP/2 (prior knowledge) transport.
//!
//! hyper drives the connection; every stream is adapted to a [`Context`]
//! whose writer streams the response back through a channel. The head is
//! released to hyper on the first write, flush or finish.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::header::{CONNECTION, DATE, SERVER, TRAILER, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use meridian_core::io::AsyncIo;
use meridian_core::{Body, BodyReader, BoxFuture, Context, Request, ResponseWriter};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::routes::Routes;

type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;
type BodyFrame = Result<Frame<Bytes>, io::Error>;

const STREAM_CHANNEL: usize = 16;

/// Serves an HTTP/2 connection until the peer closes it or `shutdown`
/// completes a graceful GOAWAY.
///
/// # Errors
///
/// Returns connection-level HTTP/2 errors.
pub async fn serve_connection(
    io: impl AsyncIo,
    remote_addr: Option<SocketAddr>,
    routes: Arc<Routes>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let server_name = HeaderValue::from_str(config.server_name()).ok();
    let stream_shutdown = shutdown.clone();
    let service = service_fn(move |req: http::Request<Incoming>| {
        let routes = Arc::clone(&routes);
        let server_name = server_name.clone();
        let cancel = stream_shutdown.child_token();
        async move {
            Ok::<_, Infallible>(serve_stream(req, remote_addr, routes, server_name, cancel).await)
        }
    });

    let conn = http2::Builder::new(TokioExecutor::new()).serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => result,
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    }
}

async fn serve_stream(
    req: http::Request<Incoming>,
    remote_addr: Option<SocketAddr>,
    routes: Arc<Routes>,
    server_name: Option<HeaderValue>,
    cancel: CancellationToken,
) -> Response<ResponseBody> {
    let (parts, incoming) = req.into_parts();
    let head_request = parts.method == Method::HEAD;

    let mut request = Request::new(parts.method, parts.uri)
        .with_version(Version::HTTP_2)
        .with_headers(parts.headers);
    if let Some(addr) = remote_addr {
        request = request.with_remote_addr(addr);
    }
    if !hyper::body::Body::is_end_stream(&incoming) {
        request = request.with_body(Body::Stream(Box::new(StreamBodyReader(incoming))));
    }

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel::<BodyFrame>(STREAM_CHANNEL);
    let writer = H2Writer {
        head: Some(head_tx),
        body: Some(body_tx),
        headers: HeaderMap::new(),
        status: StatusCode::OK,
        header_written: false,
        head_request,
        server_name,
        size: 0,
    };

    tokio::spawn(async move {
        let mut ctx = Context::new(request, Box::new(writer)).with_cancellation(cancel.clone());
        routes.dispatch(&mut ctx).await;
        if let Err(err) = ctx.finish().await {
            tracing::debug!(error = %err, "http/2 stream write failed");
        }
        cancel.cancel();
    });

    let body = StreamBody::new(futures_util::stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    }))
    .boxed_unsync();

    match head_rx.await {
        Ok(head) => {
            let (parts, ()) = head.into_parts();
            Response::from_parts(parts, body)
        }
        Err(_) => {
            tracing::error!("handler dropped the response without a head");
            let mut response = Response::new(Empty::new().map_err(|never| match never {}).boxed_unsync());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

struct StreamBodyReader(Incoming);

impl BodyReader for StreamBodyReader {
    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move {
            while let Some(frame) = self.0.frame().await {
                let frame = frame.map_err(io::Error::other)?;
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() {
                        return Ok(Some(data));
                    }
                }
            }
            Ok(None)
        })
    }
}

struct H2Writer {
    head: Option<oneshot::Sender<Response<()>>>,
    body: Option<mpsc::Sender<BodyFrame>>,
    headers: HeaderMap,
    status: StatusCode,
    header_written: bool,
    head_request: bool,
    server_name: Option<HeaderValue>,
    size: u64,
}

impl H2Writer {
    fn release_head(&mut self) {
        let Some(tx) = self.head.take() else {
            return;
        };
        self.header_written = true;
        for name in [CONNECTION, TRANSFER_ENCODING] {
            self.headers.remove(name);
        }
        self.headers.remove("keep-alive");
        if !self.headers.contains_key(DATE) {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
                self.headers.insert(DATE, value);
            }
        }
        if let Some(server) = &self.server_name {
            if !self.headers.contains_key(SERVER) {
                self.headers.insert(SERVER, server.clone());
            }
        }

        let mut response = Response::new(());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        let _ = tx.send(response);
    }

    async fn send(&mut self, frame: Frame<Bytes>) -> io::Result<()> {
        let Some(tx) = &self.body else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "response finished"));
        };
        tx.send(Ok(frame))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream reset by peer"))
    }
}

impl ResponseWriter for H2Writer {
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
            self.release_head();
            if self.head_request || data.is_empty() {
                return Ok(data.len());
            }
            self.send(Frame::data(Bytes::copy_from_slice(data))).await?;
            self.size += data.len() as u64;
            Ok(data.len())
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.release_head();
            Ok(())
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.release_head();
            let names: Vec<String> = self
                .headers
                .get_all(TRAILER)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect();
            let mut trailers = HeaderMap::new();
            for name in &names {
                if let Ok(name) = http::header::HeaderName::from_bytes(name.as_bytes()) {
                    for value in self.headers.get_all(&name) {
                        trailers.append(name.clone(), value.clone());
                    }
                }
            }
            let result = if trailers.is_empty() {
                Ok(())
            } else {
                self.send(Frame::trailers(trailers)).await
            };
            self.body = None;
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt as _;
    use meridian_core::named_fn;

    fn routes() -> Arc<Routes> {
        let mut routes = Routes::new();
        routes
            .post("/echo", named_fn("echo", |ctx| {
                Box::pin(async move {
                    let body = ctx.request_mut().body_mut().bytes(1024).await.unwrap_or_default();
                    ctx.writer().headers_mut().insert(TRAILER, HeaderValue::from_static("x-done"));
                    let _ = ctx.text(StatusCode::OK, &String::from_utf8_lossy(&body)).await;
                    ctx.writer().headers_mut().insert("x-done", HeaderValue::from_static("yes"));
                })
            }))
            .unwrap();
        Arc::new(routes)
    }

    #[tokio::test]
    async fn test_h2_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_connection(
            server_io,
            None,
            routes(),
            Arc::new(ServerConfig::default()),
            shutdown.clone(),
        ));

        let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(client_io))
            .await
            .unwrap();
        tokio::spawn(conn);

        let request = http::Request::post("http://localhost/echo")
            .body(http_body_util::Full::new(Bytes::from_static(b"over h2")))
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[SERVER], "meridian");

        let collected = response.into_body().collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-done"], "yes");
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"over h2"));

        let request = http::Request::get("http://localhost/missing")
            .body(http_body_util::Full::new(Bytes::new()))
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        shutdown.cancel();
        drop(sender);
        server.await.unwrap().unwrap();
    }
}
