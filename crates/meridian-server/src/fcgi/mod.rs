//! FastCGI responder transport.
//!
//! Requests arrive as `BEGIN_REQUEST`, a `PARAMS` stream and a `STDIN`
//! stream; the response leaves as a `STDOUT` stream and `END_REQUEST`.
//! Connections carry one request at a time: a second `BEGIN_REQUEST` while
//! one is active is refused with `CANT_MPX_CONN`.

mod record;
mod writer;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Method, Uri, Version};
use meridian_core::io::{shared_conn, AsyncIo, ConnStream, SharedConn};
use meridian_core::{Body, BodyReader, BoxFuture, Context, Request, TlsInfo};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use self::record::{
    encode_end_request, encode_pair, encode_record, encode_unknown_type, parse_pairs, read_record,
    BeginRequest, Record, RecordType, CANT_MPX_CONN, REQUEST_COMPLETE, ROLE_RESPONDER,
    UNKNOWN_ROLE,
};
use self::writer::FcgiWriter;
use crate::config::ServerConfig;
use crate::error::ProtocolError;
use crate::http1::MAX_DRAIN_BYTES;
use crate::routes::Routes;

const READ_BUFFER: usize = 16 * 1024;

/// Advertised through `FCGI_MAX_CONNS` / `FCGI_MAX_REQS` when no
/// connection limit is configured.
const DEFAULT_MAX_CONNS: usize = 1024;

/// A request whose parameters have been received in full.
struct Pending {
    request_id: u16,
    keep_conn: bool,
    params: Vec<(Bytes, Bytes)>,
}

/// State of the request currently being served, shared with its body.
struct Active {
    request_id: u16,
    stdin_done: bool,
    aborted: bool,
    cancel: CancellationToken,
}

type SharedActive = Arc<Mutex<Active>>;

/// Serves FastCGI requests on `io` until the web server closes the
/// connection, a request without `FCGI_KEEP_CONN` completes, or `shutdown`
/// is cancelled between requests.
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
    let mut served = 0u64;

    loop {
        let wait = if served == 0 {
            config.read_timeout()
        } else {
            config.keep_alive_timeout()
        };
        let pending = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            pending = read_pending(&conn, &config, wait) => pending,
        };
        let pending = match pending {
            Ok(Some(pending)) => pending,
            Ok(None) => break,
            Err(err) if err.is_disconnect() => break,
            Err(err) => return Err(err),
        };
        let keep_conn = pending.keep_conn;
        let request_id = pending.request_id;
        served += 1;

        let cancel = shutdown.child_token();
        let active = Arc::new(Mutex::new(Active {
            request_id,
            stdin_done: false,
            aborted: false,
            cancel: cancel.clone(),
        }));

        let request = match build_request(&pending.params, remote_addr) {
            Ok(request) => request.with_body(Body::Stream(Box::new(StdinBody {
                conn: Arc::clone(&conn),
                active: Arc::clone(&active),
                config: Arc::clone(&config),
            }))),
            Err(err) => {
                tracing::debug!(request_id, error = %err, "rejecting malformed FastCGI request");
                let mut out = BytesMut::new();
                encode_record(
                    &mut out,
                    RecordType::Stdout,
                    request_id,
                    b"Status: 400 Bad Request\r\ncontent-length: 0\r\n\r\n",
                );
                encode_record(&mut out, RecordType::Stdout, request_id, &[]);
                encode_end_request(&mut out, request_id, 0, REQUEST_COMPLETE);
                send(&mut *conn.lock().await, &out).await?;
                break;
            }
        };

        let writer = FcgiWriter::new(Arc::clone(&conn), request_id, config.response_buffer());
        let mut ctx = Context::new(request, Box::new(writer)).with_cancellation(cancel.clone());
        routes.dispatch(&mut ctx).await;
        let finished = ctx.finish().await;
        drop(ctx);
        cancel.cancel();

        let drained = drain_stdin(&conn, &active, &config).await;
        let mut out = BytesMut::new();
        encode_end_request(&mut out, request_id, 0, REQUEST_COMPLETE);
        send(&mut *conn.lock().await, &out).await?;

        if let Err(err) = finished {
            tracing::debug!(request_id, error = %err, "FastCGI response write failed");
            break;
        }
        if !drained || !keep_conn {
            break;
        }
    }

    let mut guard = conn.lock().await;
    let _ = guard.get_mut().shutdown().await;
    Ok(())
}

async fn send(conn: &mut ConnStream, out: &[u8]) -> io::Result<()> {
    conn.get_mut().write_all(out).await?;
    conn.get_mut().flush().await
}

async fn read_pending(
    conn: &SharedConn,
    config: &ServerConfig,
    wait: Option<Duration>,
) -> Result<Option<Pending>, ProtocolError> {
    let mut guard = conn.lock().await;
    let read = next_request(&mut guard, config);
    match wait {
        Some(wait) => tokio::time::timeout(wait, read).await.unwrap_or_else(|_| {
            tracing::trace!("idle FastCGI connection timed out");
            Ok(None)
        }),
        None => read.await,
    }
}

/// Reads records until a responder request has its full parameter set.
async fn next_request(
    conn: &mut ConnStream,
    config: &ServerConfig,
) -> Result<Option<Pending>, ProtocolError> {
    let mut current: Option<(u16, BeginRequest, BytesMut)> = None;

    loop {
        let Some(record) = read_record(conn).await? else {
            return match current {
                Some(_) => Err(ProtocolError::UnexpectedEof),
                None => Ok(None),
            };
        };
        let busy = current.as_ref().map(|(id, _, _)| *id);
        if answer_connection_record(conn, &record, busy, config).await? {
            continue;
        }

        match record.kind {
            RecordType::BeginRequest => {
                let begin = BeginRequest::parse(&record.content)?;
                if begin.role != ROLE_RESPONDER {
                    tracing::debug!(role = begin.role, "refusing FastCGI role");
                    let mut out = BytesMut::new();
                    encode_end_request(&mut out, record.request_id, 0, UNKNOWN_ROLE);
                    send(conn, &out).await?;
                    continue;
                }
                current = Some((record.request_id, begin, BytesMut::new()));
            }
            RecordType::Params if busy == Some(record.request_id) => {
                let Some((request_id, begin, params)) = current.as_mut() else {
                    continue;
                };
                if record.content.is_empty() {
                    return Ok(Some(Pending {
                        request_id: *request_id,
                        keep_conn: begin.keep_conn(),
                        params: parse_pairs(params)?,
                    }));
                }
                if params.len() + record.content.len() > config.max_header_bytes() {
                    return Err(ProtocolError::HeaderTooLarge {
                        limit: config.max_header_bytes(),
                    });
                }
                params.extend_from_slice(&record.content);
            }
            RecordType::AbortRequest if busy == Some(record.request_id) => {
                let keep_conn = current.take().is_some_and(|(_, begin, _)| begin.keep_conn());
                let mut out = BytesMut::new();
                encode_end_request(&mut out, record.request_id, 0, REQUEST_COMPLETE);
                send(conn, &out).await?;
                if !keep_conn {
                    return Ok(None);
                }
            }
            RecordType::Stdin if busy == Some(record.request_id) => {
                return Err(ProtocolError::InvalidRecord("STDIN before end of PARAMS"));
            }
            _ => {
                tracing::trace!(kind = ?record.kind, request_id = record.request_id, "ignoring stray record");
            }
        }
    }
}

/// Answers records that do not belong to the active request: management
/// queries, unknown types and attempts at multiplexing. Returns `true` when
/// the record was consumed.
async fn answer_connection_record(
    conn: &mut ConnStream,
    record: &Record,
    busy: Option<u16>,
    config: &ServerConfig,
) -> Result<bool, ProtocolError> {
    let mut out = BytesMut::new();
    match record.kind {
        RecordType::GetValues if record.is_management() => {
            let max = config.max_connections().unwrap_or(DEFAULT_MAX_CONNS).to_string();
            let mut values = BytesMut::new();
            for (name, _) in parse_pairs(&record.content)? {
                let value: &[u8] = match &name[..] {
                    b"FCGI_MAX_CONNS" | b"FCGI_MAX_REQS" => max.as_bytes(),
                    b"FCGI_MPXS_CONNS" => b"0",
                    _ => continue,
                };
                encode_pair(&mut values, &name, value);
            }
            encode_record(&mut out, RecordType::GetValuesResult, 0, &values);
        }
        RecordType::BeginRequest if busy.is_some_and(|id| id != record.request_id) => {
            encode_end_request(&mut out, record.request_id, 0, CANT_MPX_CONN);
        }
        RecordType::Other(kind) => encode_unknown_type(&mut out, kind),
        kind if record.is_management() => encode_unknown_type(&mut out, kind.into()),
        _ => return Ok(false),
    }
    send(conn, &out).await?;
    Ok(true)
}

/// Maps CGI parameters onto a request.
fn build_request(
    params: &[(Bytes, Bytes)],
    peer: Option<SocketAddr>,
) -> Result<Request, ProtocolError> {
    let param = |key: &str| {
        params
            .iter()
            .find(|(name, _)| &name[..] == key.as_bytes())
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
    };

    let method = match param("REQUEST_METHOD") {
        Some(method) => {
            Method::from_bytes(method.as_bytes()).map_err(|_| ProtocolError::InvalidMethod)?
        }
        None => Method::GET,
    };

    let target = match param("REQUEST_URI").filter(|uri| !uri.is_empty()) {
        Some(uri) => uri.to_string(),
        None => {
            let mut path = format!(
                "{}{}",
                param("SCRIPT_NAME").unwrap_or_default(),
                param("PATH_INFO").unwrap_or_default()
            );
            if path.is_empty() {
                path.push('/');
            }
            match param("QUERY_STRING").filter(|q| !q.is_empty()) {
                Some(query) => format!("{path}?{query}"),
                None => path,
            }
        }
    };
    let uri: Uri = target.parse()?;

    let version = match param("SERVER_PROTOCOL") {
        Some("HTTP/1.0") => Version::HTTP_10,
        Some("HTTP/2" | "HTTP/2.0") => Version::HTTP_2,
        _ => Version::HTTP_11,
    };

    let mut request = Request::new(method, uri).with_version(version);
    let headers = request.headers_mut();
    for (name, value) in params {
        let header = if let Some(rest) = name.strip_prefix(b"HTTP_") {
            let lowered: Vec<u8> = rest
                .iter()
                .map(|b| if *b == b'_' { b'-' } else { b.to_ascii_lowercase() })
                .collect();
            HeaderName::from_bytes(&lowered).ok()
        } else if &name[..] == b"CONTENT_TYPE" {
            Some(CONTENT_TYPE)
        } else if &name[..] == b"CONTENT_LENGTH" {
            Some(CONTENT_LENGTH)
        } else {
            None
        };
        let Some(header) = header else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let value = HeaderValue::from_bytes(value).map_err(|_| ProtocolError::InvalidHeader)?;
        headers.append(header, value);
    }

    let remote = param("REMOTE_ADDR")
        .and_then(|ip| ip.parse::<IpAddr>().ok())
        .map(|ip| {
            let port = param("REMOTE_PORT").and_then(|p| p.parse().ok()).unwrap_or(0);
            SocketAddr::new(ip, port)
        })
        .or(peer);
    if let Some(addr) = remote {
        request = request.with_remote_addr(addr);
    }
    if param("HTTPS").is_some_and(|v| v.eq_ignore_ascii_case("on")) {
        request = request.with_tls(TlsInfo {
            server_name: param("SERVER_NAME").map(str::to_string),
            alpn: None,
        });
    }
    Ok(request)
}

/// Streams `STDIN` of the active request.
struct StdinBody {
    conn: SharedConn,
    active: SharedActive,
    config: Arc<ServerConfig>,
}

impl StdinBody {
    async fn read_chunk(&self) -> Result<Option<Bytes>, ProtocolError> {
        let mut conn = self.conn.lock().await;
        loop {
            let request_id = {
                let active = self.active.lock();
                if active.stdin_done {
                    return Ok(None);
                }
                if active.aborted {
                    return Err(io::Error::from(io::ErrorKind::ConnectionAborted).into());
                }
                active.request_id
            };

            let record = read_record(&mut *conn)
                .await?
                .ok_or(ProtocolError::UnexpectedEof)?;
            if answer_connection_record(&mut conn, &record, Some(request_id), &self.config).await? {
                continue;
            }
            if record.request_id != request_id {
                continue;
            }
            match record.kind {
                RecordType::Stdin if record.content.is_empty() => {
                    self.active.lock().stdin_done = true;
                    return Ok(None);
                }
                RecordType::Stdin => return Ok(Some(record.content)),
                RecordType::AbortRequest => {
                    let mut active = self.active.lock();
                    tracing::debug!(request_id, "FastCGI request aborted by web server");
                    active.aborted = true;
                    active.cancel.cancel();
                }
                _ => {}
            }
        }
    }
}

impl BodyReader for StdinBody {
    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move { self.read_chunk().await.map_err(io::Error::from) })
    }

    fn remaining(&self) -> Option<u64> {
        if self.active.lock().stdin_done {
            Some(0)
        } else {
            None
        }
    }
}

/// Consumes what is left of `STDIN`. Returns `false` when the connection
/// cannot serve another request.
async fn drain_stdin(conn: &SharedConn, active: &SharedActive, config: &Arc<ServerConfig>) -> bool {
    let mut rest = Body::Stream(Box::new(StdinBody {
        conn: Arc::clone(conn),
        active: Arc::clone(active),
        config: Arc::clone(config),
    }));
    match rest.discard(MAX_DRAIN_BYTES).await {
        Ok(true) => true,
        Ok(false) => {
            tracing::debug!("unread FastCGI body too large to drain");
            false
        }
        Err(_) if active.lock().aborted => true,
        Err(err) => {
            tracing::debug!(error = %err, "failed to drain FastCGI body");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use meridian_core::named_fn;
    use tokio::io::DuplexStream;

    fn begin(out: &mut BytesMut, id: u16, role: u16, keep_conn: bool) {
        let mut body = [0u8; 8];
        body[..2].copy_from_slice(&role.to_be_bytes());
        body[2] = u8::from(keep_conn);
        encode_record(out, RecordType::BeginRequest, id, &body);
    }

    fn params(out: &mut BytesMut, id: u16, pairs: &[(&str, &str)]) {
        let mut content = BytesMut::new();
        for (name, value) in pairs {
            encode_pair(&mut content, name.as_bytes(), value.as_bytes());
        }
        encode_record(out, RecordType::Params, id, &content);
        encode_record(out, RecordType::Params, id, &[]);
    }

    fn spawn_server(io: DuplexStream) -> tokio::task::JoinHandle<Result<(), ProtocolError>> {
        let mut routes = Routes::new();
        routes
            .post("/echo/:name", named_fn("echo", |ctx| {
                Box::pin(async move {
                    let name = ctx.param("name").unwrap_or_default().to_string();
                    let agent = ctx.request().header("user-agent").unwrap_or_default().to_string();
                    let body = ctx.request_mut().body_mut().bytes(1024).await.unwrap_or_default();
                    let text = format!("{name}|{agent}|{}", String::from_utf8_lossy(&body));
                    let _ = ctx.text(StatusCode::OK, &text).await;
                })
            }))
            .unwrap();
        tokio::spawn(serve_connection(
            io,
            None,
            Arc::new(routes),
            Arc::new(ServerConfig::default()),
            CancellationToken::new(),
        ))
    }

    async fn read_response(client: &mut DuplexStream, id: u16) -> (String, [u8; 8]) {
        let mut stdout = Vec::new();
        loop {
            let record = read_record(client).await.unwrap().unwrap();
            assert_eq!(record.request_id, id);
            match record.kind {
                RecordType::Stdout => stdout.extend_from_slice(&record.content),
                RecordType::EndRequest => {
                    let mut end = [0u8; 8];
                    end.copy_from_slice(&record.content);
                    return (String::from_utf8(stdout).unwrap(), end);
                }
                other => panic!("unexpected record {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_responder_round_trip_with_keep_conn() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = spawn_server(server);

        for (id, name) in [(1u16, "first"), (2, "second")] {
            let mut out = BytesMut::new();
            begin(&mut out, id, ROLE_RESPONDER, true);
            params(
                &mut out,
                id,
                &[
                    ("REQUEST_METHOD", "POST"),
                    ("REQUEST_URI", &format!("/echo/{name}")),
                    ("HTTP_USER_AGENT", "fcgi-test"),
                    ("CONTENT_LENGTH", "4"),
                ],
            );
            encode_record(&mut out, RecordType::Stdin, id, b"da");
            encode_record(&mut out, RecordType::Stdin, id, b"ta");
            encode_record(&mut out, RecordType::Stdin, id, &[]);
            client.write_all(&out).await.unwrap();

            let (stdout, end) = read_response(&mut client, id).await;
            assert!(stdout.starts_with("Status: 200 OK\r\n"), "{stdout}");
            assert!(stdout.ends_with(&format!("\r\n\r\n{name}|fcgi-test|data")), "{stdout}");
            assert_eq!(end[4], REQUEST_COMPLETE);
        }

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_role_and_management_records() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let _task = spawn_server(server);

        let mut out = BytesMut::new();
        begin(&mut out, 1, 2, true);
        client.write_all(&out).await.unwrap();
        let record = read_record(&mut client).await.unwrap().unwrap();
        assert_eq!(record.kind, RecordType::EndRequest);
        assert_eq!(record.content[4], UNKNOWN_ROLE);

        let mut query = BytesMut::new();
        encode_pair(&mut query, b"FCGI_MPXS_CONNS", b"");
        encode_pair(&mut query, b"FCGI_MAX_CONNS", b"");
        encode_pair(&mut query, b"OTHER", b"");
        let mut out = BytesMut::new();
        encode_record(&mut out, RecordType::GetValues, 0, &query);
        client.write_all(&out).await.unwrap();
        let record = read_record(&mut client).await.unwrap().unwrap();
        assert_eq!(record.kind, RecordType::GetValuesResult);
        let values = parse_pairs(&record.content).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].1, Bytes::from_static(b"0"));
        assert_eq!(values[1].1, Bytes::from(DEFAULT_MAX_CONNS.to_string()));

        let mut out = BytesMut::new();
        encode_record(&mut out, RecordType::Other(42), 0, &[]);
        client.write_all(&out).await.unwrap();
        let record = read_record(&mut client).await.unwrap().unwrap();
        assert_eq!(record.kind, RecordType::UnknownType);
        assert_eq!(record.content[0], 42);
    }

    #[tokio::test]
    async fn test_second_request_id_refused() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let _task = spawn_server(server);

        let mut out = BytesMut::new();
        begin(&mut out, 1, ROLE_RESPONDER, true);
        begin(&mut out, 2, ROLE_RESPONDER, true);
        client.write_all(&out).await.unwrap();

        let record = read_record(&mut client).await.unwrap().unwrap();
        assert_eq!(record.kind, RecordType::EndRequest);
        assert_eq!(record.request_id, 2);
        assert_eq!(record.content[4], CANT_MPX_CONN);
    }

    #[tokio::test]
    async fn test_abort_before_dispatch() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = spawn_server(server);

        let mut out = BytesMut::new();
        begin(&mut out, 5, ROLE_RESPONDER, false);
        encode_record(&mut out, RecordType::AbortRequest, 5, &[]);
        client.write_all(&out).await.unwrap();

        let record = read_record(&mut client).await.unwrap().unwrap();
        assert_eq!(record.kind, RecordType::EndRequest);
        assert_eq!(record.request_id, 5);
        assert_eq!(record.content[4], REQUEST_COMPLETE);
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_request_from_cgi_params() {
        let params: Vec<(Bytes, Bytes)> = [
            ("SCRIPT_NAME", "/app"),
            ("PATH_INFO", "/users/7"),
            ("QUERY_STRING", "x=1"),
            ("SERVER_PROTOCOL", "HTTP/1.0"),
            ("HTTP_X_FORWARDED_PROTO", "https"),
            ("CONTENT_TYPE", "application/json"),
            ("REMOTE_ADDR", "10.0.0.9"),
            ("REMOTE_PORT", "4242"),
            ("HTTPS", "on"),
        ]
        .iter()
        .map(|(k, v)| (Bytes::from(*k), Bytes::from(*v)))
        .collect();

        let request = build_request(&params, None).unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.path(), "/app/users/7");
        assert_eq!(request.query(), Some("x=1"));
        assert_eq!(request.version(), Version::HTTP_10);
        assert_eq!(request.header("x-forwarded-proto"), Some("https"));
        assert_eq!(request.header(CONTENT_TYPE), Some("application/json"));
        assert_eq!(request.remote_addr(), Some("10.0.0.9:4242".parse().unwrap()));
        assert!(request.is_tls());
    }
}
