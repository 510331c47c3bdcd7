//! HTTP/1.x transport.
//!
//! One task per connection; requests on a connection are served strictly
//! one after another. Each exchange shares the connection between the body
//! reader and the response writer through [`SharedConn`].

mod body;
mod parse;
mod writer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderValue, Method};
use meridian_core::io::{shared_conn, AsyncIo, SharedConn};
use meridian_core::{Body, Context, Request};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use self::body::{ConnBody, Exchange};
use self::parse::{read_head, BodyKind};
use self::writer::{Http1Writer, WriterSettings};
use crate::config::ServerConfig;
use crate::error::ProtocolError;
use crate::routes::Routes;

/// Unread request body beyond this is not drained; the connection closes.
pub const MAX_DRAIN_BYTES: u64 = 256 * 1024;

const READ_BUFFER: usize = 8 * 1024;

const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Serves HTTP/1.x requests on `io` until the peer closes, a response
/// requires closing, or `shutdown` is cancelled between requests.
///
/// # Errors
///
/// Returns protocol errors other than a clean disconnect.
pub async fn serve_connection(
    io: impl AsyncIo,
    remote_addr: Option<SocketAddr>,
    routes: Arc<Routes>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> Result<(), ProtocolError> {
    let conn = shared_conn(io, READ_BUFFER);
    let server_name = HeaderValue::from_str(config.server_name()).ok();
    let mut served = 0u64;

    loop {
        let wait = if served == 0 {
            config.read_timeout()
        } else {
            config.keep_alive_timeout()
        };
        let head = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            head = read_with_timeout(&conn, config.max_header_bytes(), wait) => head,
        };
        let head = match head {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) if err.is_disconnect() => break,
            Err(err) => return Err(err),
        };

        let kind = match head.body_kind() {
            Ok(kind) => kind,
            Err(err) => {
                let mut guard = conn.lock().await;
                let _ = guard.get_mut().write_all(BAD_REQUEST).await;
                let _ = guard.get_mut().shutdown().await;
                return Err(err);
            }
        };

        let keep_alive = head.keep_alive();
        let exchange = Exchange::shared(kind, head.expects_continue(), keep_alive);
        let settings = Arc::new(WriterSettings {
            version: head.version,
            head_request: head.method == Method::HEAD,
            buffer_size: config.response_buffer(),
            server_name: server_name.clone(),
        });

        let mut request = Request::new(head.method, head.uri)
            .with_version(head.version)
            .with_headers(head.headers);
        if let Some(addr) = remote_addr {
            request = request.with_remote_addr(addr);
        }
        if kind != BodyKind::Empty {
            request = request.with_body(Body::Stream(Box::new(ConnBody::new(
                Arc::clone(&conn),
                Arc::clone(&exchange),
            ))));
        }

        let cancel = shutdown.child_token();
        let writer = Http1Writer::new(
            Arc::clone(&conn),
            Arc::clone(&exchange),
            cancel.clone(),
            settings,
        );
        let mut ctx = Context::new(request, Box::new(writer)).with_cancellation(cancel.clone());
        routes.dispatch(&mut ctx).await;
        let finished = ctx.finish().await;
        let hijacked = ctx.writer().is_hijacked();
        drop(ctx);
        served += 1;

        if hijacked {
            tracing::debug!(?remote_addr, "connection hijacked");
            return Ok(());
        }
        cancel.cancel();
        if let Err(err) = finished {
            tracing::debug!(?remote_addr, error = %err, "response write failed");
            return Ok(());
        }

        if !reusable(&conn, &exchange).await {
            break;
        }
    }

    let mut guard = conn.lock().await;
    let _ = guard.get_mut().shutdown().await;
    Ok(())
}

async fn read_with_timeout(
    conn: &SharedConn,
    limit: usize,
    wait: Option<Duration>,
) -> Result<Option<parse::RequestHead>, ProtocolError> {
    let mut guard = conn.lock().await;
    let read = read_head(&mut *guard, limit);
    match wait {
        Some(wait) => match tokio::time::timeout(wait, read).await {
            Ok(result) => result,
            Err(_) => {
                tracing::trace!("idle connection timed out");
                Ok(None)
            }
        },
        None => read.await,
    }
}

/// Drains what is left of the request body. Returns `false` when the
/// connection must close.
async fn reusable(conn: &SharedConn, exchange: &body::SharedExchange) -> bool {
    {
        let state = exchange.lock();
        if state.close {
            return false;
        }
        if state.expect_continue {
            // The client is still waiting to send; nothing to drain.
            return false;
        }
    }
    let mut rest = Body::Stream(Box::new(ConnBody::new(
        Arc::clone(conn),
        Arc::clone(exchange),
    )));
    match rest.discard(MAX_DRAIN_BYTES).await {
        Ok(true) => true,
        Ok(false) => {
            tracing::debug!("unread request body too large to drain");
            false
        }
        Err(err) => {
            tracing::debug!(error = %err, "failed to drain request body");
            false
        }
    }
}
