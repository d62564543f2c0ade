//! Authorization gate guarding access to the proxy itself.
//!
//! The gate is independent of the upstream session: it only checks that the
//! client carries a configured cookie. Rejections use a fixed 401 that is
//! written identically through hyper (plain requests) and straight onto the
//! socket (WebSocket upgrades handled before hyper sees the connection).

use super::cookies::CookieJar;
use crate::config::AuthorizationConfig;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const UNAUTHORIZED_BODY: &str = "You are not authorized to use this service.";
pub const UNAUTHORIZED_CONTENT_TYPE: &str = "text/html";

#[derive(Debug, Clone, Default)]
pub struct AuthorizationGate {
    required: Option<AuthorizationConfig>,
}

impl AuthorizationGate {
    pub fn new(required: Option<AuthorizationConfig>) -> Self {
        Self { required }
    }

    pub fn is_enabled(&self) -> bool {
        self.required.is_some()
    }

    /// Check the raw `Cookie` header. Without a configured requirement every
    /// request passes; otherwise the named cookie must match byte for byte.
    pub fn authorize(&self, cookie_header: Option<&[u8]>) -> bool {
        let Some(ref required) = self.required else {
            return true;
        };
        let Some(raw) = cookie_header else {
            return false;
        };
        CookieJar::parse(raw).get(required.key.as_bytes()) == Some(required.value.as_bytes())
    }
}

/// The 401 as a hyper response.
pub fn unauthorized_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(UNAUTHORIZED_BODY.as_bytes())));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(UNAUTHORIZED_CONTENT_TYPE),
    );
    headers.insert(CONTENT_LENGTH, hyper::header::HeaderValue::from(UNAUTHORIZED_BODY.len()));
    response
}

/// The same 401, serialized for a raw socket.
pub fn unauthorized_bytes() -> Vec<u8> {
    format!(
        "HTTP/1.1 401 Unauthorized\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
        UNAUTHORIZED_CONTENT_TYPE,
        UNAUTHORIZED_BODY.len(),
        UNAUTHORIZED_BODY
    )
    .into_bytes()
}

/// Write the 401 onto `io` and shut down the write side.
pub async fn write_unauthorized<W>(io: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(&unauthorized_bytes()).await?;
    io.flush().await?;
    io.shutdown().await
}
