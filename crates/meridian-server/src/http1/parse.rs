//! Request head parsing.

use http::header::{HeaderName, CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::ProtocolError;

/// A parsed request line and header block.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
}

impl RequestHead {
    /// Body framing, from `Transfer-Encoding` then `Content-Length`.
    pub fn body_kind(&self) -> Result<BodyKind, ProtocolError> {
        if let Some(coding) = self.last_token(&TRANSFER_ENCODING) {
            if coding.eq_ignore_ascii_case("chunked") {
                return Ok(BodyKind::Chunked);
            }
            return Err(ProtocolError::UnsupportedTransferEncoding(coding));
        }

        let mut length: Option<u64> = None;
        for value in self.headers.get_all(CONTENT_LENGTH) {
            let text = value.to_str().map_err(|_| ProtocolError::InvalidContentLength)?;
            for part in text.split(',') {
                let n: u64 = part
                    .trim()
                    .parse()
                    .map_err(|_| ProtocolError::InvalidContentLength)?;
                if length.is_some_and(|seen| seen != n) {
                    return Err(ProtocolError::InvalidContentLength);
                }
                length = Some(n);
            }
        }
        Ok(match length {
            Some(0) | None => BodyKind::Empty,
            Some(n) => BodyKind::Length(n),
        })
    }

    /// Whether the client asked for `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.version == Version::HTTP_11
            && self
                .headers
                .get(EXPECT)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }

    /// Whether the client allows the connection to be reused.
    pub fn keep_alive(&self) -> bool {
        let has = |token: &str| {
            self.headers.get_all(CONNECTION).iter().any(|v| {
                v.to_str()
                    .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                    .unwrap_or(false)
            })
        };
        match self.version {
            Version::HTTP_10 => has("keep-alive"),
            _ => !has("close"),
        }
    }

    fn last_token(&self, name: &HeaderName) -> Option<String> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .last()
            .map(str::to_string)
    }
}

/// Reads one request head. Returns `None` if the peer closed the
/// connection before sending anything.
pub(crate) async fn read_head<R>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<RequestHead>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = limit;
    let mut line = Vec::with_capacity(128);

    // Tolerate stray CRLFs between pipelined requests.
    loop {
        line.clear();
        if read_line(reader, &mut budget, &mut line, limit).await? == 0 {
            return Ok(None);
        }
        if !trim_eol(&line).is_empty() {
            break;
        }
    }
    let (method, uri, version) = parse_request_line(trim_eol(&line))?;

    let mut headers = HeaderMap::new();
    let mut pending: Option<(HeaderName, Vec<u8>)> = None;
    loop {
        line.clear();
        if read_line(reader, &mut budget, &mut line, limit).await? == 0 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let text = trim_eol(&line);
        if text.is_empty() {
            break;
        }
        if matches!(text[0], b' ' | b'\t') {
            // obs-fold continuation
            let (_, value) = pending.as_mut().ok_or(ProtocolError::InvalidHeader)?;
            value.push(b' ');
            value.extend_from_slice(trim(text));
            continue;
        }
        if let Some((name, value)) = pending.take() {
            append(&mut headers, name, &value)?;
        }
        pending = Some(parse_header_line(text)?);
    }
    if let Some((name, value)) = pending {
        append(&mut headers, name, &value)?;
    }

    Ok(Some(RequestHead {
        method,
        uri,
        version,
        headers,
    }))
}

async fn read_line<R>(
    reader: &mut R,
    budget: &mut usize,
    line: &mut Vec<u8>,
    limit: usize,
) -> Result<usize, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let n = reader
        .take(*budget as u64)
        .read_until(b'\n', line)
        .await?;
    if n > 0 && line.last() != Some(&b'\n') {
        if n == *budget {
            return Err(ProtocolError::HeaderTooLarge { limit });
        }
        return Err(ProtocolError::UnexpectedEof);
    }
    *budget -= n;
    Ok(n)
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t'))
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t'))
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Parses `METHOD SP URI SP PROTO`.
pub(crate) fn parse_request_line(line: &[u8]) -> Result<(Method, Uri, Version), ProtocolError> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::LineInvalid)?;
    let mut parts = text.splitn(3, ' ');
    let (Some(method), Some(target), Some(proto)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::LineInvalid);
    };
    if target.is_empty() || proto.contains(' ') {
        return Err(ProtocolError::LineInvalid);
    }

    let method = Method::from_bytes(method.as_bytes()).map_err(|_| ProtocolError::InvalidMethod)?;
    let version = match proto {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => return Err(ProtocolError::UnsupportedVersion(other.to_string())),
    };
    let uri: Uri = target.parse()?;
    Ok((method, uri, version))
}

fn parse_header_line(line: &[u8]) -> Result<(HeaderName, Vec<u8>), ProtocolError> {
    let colon = line
        .iter()
        .position(|b| *b == b':')
        .ok_or(ProtocolError::InvalidHeader)?;
    let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| ProtocolError::InvalidHeader)?;
    Ok((name, trim(&line[colon + 1..]).to_vec()))
}

fn append(headers: &mut HeaderMap, name: HeaderName, value: &[u8]) -> Result<(), ProtocolError> {
    let value = HeaderValue::from_bytes(value).map_err(|_| ProtocolError::InvalidHeader)?;
    headers.append(name, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn head(raw: &str) -> Result<Option<RequestHead>, ProtocolError> {
        let mut reader = raw.as_bytes();
        read_head(&mut reader, 1024).await
    }

    #[tokio::test]
    async fn test_parses_request() {
        let head = head("GET /a/b?x=1 HTTP/1.1\r\nHost: example.com\r\nX-Multi: 1\r\nx-multi: 2\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.uri.path(), "/a/b");
        assert_eq!(head.uri.query(), Some("x=1"));
        assert_eq!(head.version, Version::HTTP_11);
        let multi: Vec<_> = head.headers.get_all("x-multi").iter().collect();
        assert_eq!(multi, vec!["1", "2"]);
        assert_eq!(head.body_kind().unwrap(), BodyKind::Empty);
        assert!(head.keep_alive());
    }

    #[tokio::test]
    async fn test_continuation_lines() {
        let head = head("GET / HTTP/1.1\r\nX-Long: a\r\n  b\r\n\tc\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.headers["x-long"], "a b c");
    }

    #[tokio::test]
    async fn test_leading_blank_lines_and_eof() {
        assert!(head("").await.unwrap().is_none());
        let parsed = head("\r\n\r\nGET / HTTP/1.0\r\n\r\n").await.unwrap().unwrap();
        assert_eq!(parsed.version, Version::HTTP_10);
        assert!(!parsed.keep_alive());
    }

    #[tokio::test]
    async fn test_invalid_lines() {
        assert!(matches!(head("GET /\r\n\r\n").await, Err(ProtocolError::LineInvalid)));
        assert!(matches!(
            head("GET / HTTP/2.0\r\n\r\n").await,
            Err(ProtocolError::UnsupportedVersion(_))
        ));
        assert!(matches!(
            head("GET / HTTP/1.1\r\nno colon\r\n\r\n").await,
            Err(ProtocolError::InvalidHeader)
        ));
        assert!(matches!(
            head("GET / HTTP/1.1\r\nHost: x\r\n").await,
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_header_limit() {
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(2000));
        assert!(matches!(
            head(&raw).await,
            Err(ProtocolError::HeaderTooLarge { limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_body_kinds() {
        let parsed = head("POST / HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parsed.body_kind().unwrap(), BodyKind::Length(5));
        assert!(parsed.expects_continue());

        let parsed = head("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parsed.body_kind().unwrap(), BodyKind::Chunked);

        let parsed = head("POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(parsed.body_kind(), Err(ProtocolError::InvalidContentLength)));

        let parsed = head("POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            parsed.body_kind(),
            Err(ProtocolError::UnsupportedTransferEncoding(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_tokens() {
        let parsed = head("GET / HTTP/1.1\r\nConnection: Upgrade, close\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(!parsed.keep_alive());

        let parsed = head("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(parsed.keep_alive());
    }
}
