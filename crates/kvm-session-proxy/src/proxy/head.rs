//! Reading the first request head off a fresh client connection, and the
//! upstream's answer to a raw upgrade.
//!
//! Only the head is consumed. Everything read so far, including any bytes
//! past the head, is handed back so the connection can be replayed into
//! hyper or relayed verbatim.

use super::headers::HeaderList;
use crate::error::ProxyError;
use tokio::io::{AsyncRead, AsyncReadExt};

const INITIAL_HEADER_SLOTS: usize = 64;
const READ_CHUNK: usize = 4096;

/// A parsed HTTP/1.x request line plus headers, kept in wire order and case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version: `1` for HTTP/1.1, `0` for HTTP/1.0.
    pub version: u8,
    pub headers: HeaderList,
    /// Bytes the head occupied in the buffer it was parsed from.
    pub len: usize,
}

impl RequestHead {
    /// `Upgrade: websocket` together with a `Connection` header listing
    /// `upgrade`, both compared case-insensitively.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.contains_token("upgrade", "websocket")
            && self.headers.contains_token("connection", "upgrade")
    }

    /// Serialize back to wire format, terminated by the blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len.max(256));
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Status line and framing of an upstream response, as far as the raw
/// upgrade path needs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
    pub len: usize,
}

impl ResponseHead {
    /// Body bytes that follow the head, `None` when the body runs until the
    /// connection closes.
    pub fn body_len(&self) -> Option<u64> {
        match self.status {
            100..=199 | 204 | 304 => Some(0),
            _ => self.content_length,
        }
    }
}

/// Parse a complete head from the start of `buf`. `Ok(None)` means more
/// bytes are needed.
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, ProxyError> {
    let mut slots = vec![httparse::EMPTY_HEADER; INITIAL_HEADER_SLOTS];
    loop {
        let mut req = httparse::Request::new(&mut slots);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let mut headers = HeaderList::new();
                for header in req.headers.iter() {
                    headers.push(header.name, header.value);
                }
                return Ok(Some(RequestHead {
                    method: req.method.unwrap_or_default().to_string(),
                    target: req.path.unwrap_or_default().to_string(),
                    version: req.version.unwrap_or(1),
                    headers,
                    len,
                }));
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::TooManyHeaders) => {
                let grown = slots.len() * 2;
                slots = vec![httparse::EMPTY_HEADER; grown];
            }
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, ProxyError> {
    let mut slots = vec![httparse::EMPTY_HEADER; INITIAL_HEADER_SLOTS];
    loop {
        let mut res = httparse::Response::new(&mut slots);
        match res.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let content_length = res
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.trim().parse().ok());
                return Ok(Some(ResponseHead {
                    status: res.code.unwrap_or_default(),
                    content_length,
                    len,
                }));
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::TooManyHeaders) => {
                let grown = slots.len() * 2;
                slots = vec![httparse::EMPTY_HEADER; grown];
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read from `io` until one full request head is buffered.
///
/// Returns `Ok(None)` if the client closes before sending anything. The
/// returned buffer holds every byte read, starting with the head.
pub async fn read_request_head<R>(
    io: &mut R,
    max_len: usize,
) -> Result<Option<(RequestHead, Vec<u8>)>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    read_head(io, max_len, parse_head).await
}

/// Same as [`read_request_head`] for the upstream's response.
pub async fn read_response_head<R>(
    io: &mut R,
    max_len: usize,
) -> Result<Option<(ResponseHead, Vec<u8>)>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    read_head(io, max_len, parse_response_head).await
}

async fn read_head<R, T>(
    io: &mut R,
    max_len: usize,
    parse: fn(&[u8]) -> Result<Option<T>, ProxyError>,
) -> Result<Option<(T, Vec<u8>)>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside head",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(head) = parse(&buf)? {
            return Ok(Some((head, buf)));
        }
        if buf.len() > max_len {
            return Err(ProxyError::HeadTooLarge(max_len));
        }
    }
}
