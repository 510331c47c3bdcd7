//! FastCGI record framing.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

pub(crate) const VERSION_1: u8 = 1;
pub(crate) const HEADER_LEN: usize = 8;
pub(crate) const MAX_CONTENT: usize = 0xffff;

/// Role a web server asks the application to play.
pub(crate) const ROLE_RESPONDER: u16 = 1;

/// `BEGIN_REQUEST` flag: keep the connection open after the request.
pub(crate) const FLAG_KEEP_CONN: u8 = 1;

/// `protocolStatus` values of `END_REQUEST`.
pub(crate) const REQUEST_COMPLETE: u8 = 0;
pub(crate) const CANT_MPX_CONN: u8 = 1;
pub(crate) const UNKNOWN_ROLE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            other => Self::Other(other),
        }
    }
}

impl From<RecordType> for u8 {
    fn from(kind: RecordType) -> Self {
        match kind {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(other) => other,
        }
    }
}

/// One record, padding stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub kind: RecordType,
    pub request_id: u16,
    pub content: Bytes,
}

impl Record {
    /// Management records address the connection, not a request.
    pub fn is_management(&self) -> bool {
        self.request_id == 0
    }
}

/// Body of a `BEGIN_REQUEST` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn parse(content: &[u8]) -> Result<Self, ProtocolError> {
        if content.len() < 8 {
            return Err(ProtocolError::InvalidRecord("short BEGIN_REQUEST body"));
        }
        Ok(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }

    pub fn keep_conn(self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }
}

/// Reads the next record. Returns `None` on a clean EOF between records.
pub(crate) async fn read_record<R>(reader: &mut R) -> Result<Option<Record>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    if first < HEADER_LEN {
        reader.read_exact(&mut header[first..]).await?;
    }
    if header[0] != VERSION_1 {
        return Err(ProtocolError::InvalidRecord("unsupported version"));
    }

    let kind = RecordType::from(header[1]);
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = usize::from(u16::from_be_bytes([header[4], header[5]]));
    let padding = usize::from(header[6]);

    let mut content = vec![0u8; content_len + padding];
    reader.read_exact(&mut content).await?;
    content.truncate(content_len);

    Ok(Some(Record {
        kind,
        request_id,
        content: Bytes::from(content),
    }))
}

/// Appends `content` as one or more records. Empty content yields a single
/// empty record, which is how streams are terminated.
pub(crate) fn encode_record(out: &mut BytesMut, kind: RecordType, request_id: u16, content: &[u8]) {
    let mut pieces = content.chunks(MAX_CONTENT).peekable();
    if pieces.peek().is_none() {
        put_record(out, kind, request_id, &[]);
        return;
    }
    for piece in pieces {
        put_record(out, kind, request_id, piece);
    }
}

fn put_record(out: &mut BytesMut, kind: RecordType, request_id: u16, content: &[u8]) {
    let padding = (8 - content.len() % 8) % 8;
    out.reserve(HEADER_LEN + content.len() + padding);
    out.put_u8(VERSION_1);
    out.put_u8(kind.into());
    out.put_u16(request_id);
    out.put_u16(content.len() as u16);
    out.put_u8(padding as u8);
    out.put_u8(0);
    out.put_slice(content);
    out.put_bytes(0, padding);
}

/// Appends an `END_REQUEST` record.
pub(crate) fn encode_end_request(out: &mut BytesMut, request_id: u16, app_status: u32, protocol_status: u8) {
    let mut body = [0u8; 8];
    body[..4].copy_from_slice(&app_status.to_be_bytes());
    body[4] = protocol_status;
    encode_record(out, RecordType::EndRequest, request_id, &body);
}

/// Appends an `UNKNOWN_TYPE` record answering a record of type `kind`.
pub(crate) fn encode_unknown_type(out: &mut BytesMut, kind: u8) {
    let mut body = [0u8; 8];
    body[0] = kind;
    encode_record(out, RecordType::UnknownType, 0, &body);
}

/// Decodes a name-value pair stream.
pub(crate) fn parse_pairs(mut data: &[u8]) -> Result<Vec<(Bytes, Bytes)>, ProtocolError> {
    let mut pairs = Vec::new();
    while !data.is_empty() {
        let name_len = read_length(&mut data)?;
        let value_len = read_length(&mut data)?;
        if data.len() < name_len + value_len {
            return Err(ProtocolError::InvalidRecord("truncated name-value pair"));
        }
        let name = Bytes::copy_from_slice(&data[..name_len]);
        let value = Bytes::copy_from_slice(&data[name_len..name_len + value_len]);
        data = &data[name_len + value_len..];
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn read_length(data: &mut &[u8]) -> Result<usize, ProtocolError> {
    let first = *data
        .first()
        .ok_or(ProtocolError::InvalidRecord("truncated name-value length"))?;
    if first & 0x80 == 0 {
        *data = &data[1..];
        return Ok(usize::from(first));
    }
    if data.len() < 4 {
        return Err(ProtocolError::InvalidRecord("truncated name-value length"));
    }
    let len = u32::from_be_bytes([first & 0x7f, data[1], data[2], data[3]]);
    *data = &data[4..];
    usize::try_from(len).map_err(|_| ProtocolError::InvalidRecord("name-value length overflow"))
}

/// Appends one name-value pair.
pub(crate) fn encode_pair(out: &mut BytesMut, name: &[u8], value: &[u8]) {
    for len in [name.len(), value.len()] {
        if len < 0x80 {
            out.put_u8(len as u8);
        } else {
            out.put_u32(len as u32 | 0x8000_0000);
        }
    }
    out.put_slice(name);
    out.put_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_framing() {
        let mut out = BytesMut::new();
        encode_record(&mut out, RecordType::Stdout, 7, b"hello");
        assert_eq!(out.len(), HEADER_LEN + 8);
        assert_eq!(&out[..HEADER_LEN], &[1, 6, 0, 7, 0, 5, 3, 0]);

        let mut reader = &out[..];
        let record = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(record.kind, RecordType::Stdout);
        assert_eq!(record.request_id, 7);
        assert_eq!(record.content, Bytes::from_static(b"hello"));
        assert!(read_record(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn test_large_content_is_split() {
        let mut out = BytesMut::new();
        let content = vec![b'x'; MAX_CONTENT + 10];
        encode_record(&mut out, RecordType::Stdout, 1, &content);
        // 65535 bytes + 1 padding, then 10 bytes + 6 padding
        assert_eq!(out.len(), HEADER_LEN + MAX_CONTENT + 1 + HEADER_LEN + 16);
    }

    #[test]
    fn test_empty_record_terminates_stream() {
        let mut out = BytesMut::new();
        encode_record(&mut out, RecordType::Stdout, 1, &[]);
        assert_eq!(&out[..], &[1, 6, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_pairs() {
        let long = vec![b'v'; 300];
        let mut out = BytesMut::new();
        encode_pair(&mut out, b"REQUEST_METHOD", b"GET");
        encode_pair(&mut out, b"HTTP_X_LONG", &long);
        let pairs = parse_pairs(&out).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, Bytes::from_static(b"REQUEST_METHOD"));
        assert_eq!(pairs[0].1, Bytes::from_static(b"GET"));
        assert_eq!(pairs[1].1.len(), 300);

        assert!(parse_pairs(&[5, 5, b'a']).is_err());
    }

    #[test]
    fn test_begin_request() {
        let begin = BeginRequest::parse(&[0, 1, 1, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(begin.role, ROLE_RESPONDER);
        assert!(begin.keep_conn());
        assert!(BeginRequest::parse(&[0, 1]).is_err());
    }

    #[tokio::test]
    async fn test_bad_version() {
        let raw = [2u8, 1, 0, 1, 0, 0, 0, 0];
        let mut reader = &raw[..];
        assert!(matches!(
            read_record(&mut reader).await,
            Err(ProtocolError::InvalidRecord(_))
        ));
    }
}
