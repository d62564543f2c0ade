//! Plain HTTP forwarding and response body rewriting.

use super::auth::unauthorized_response;
use super::body::{full, ProxyBody, ResponseExt};
use super::context::ProxyContext;
use super::headers::SessionHeaders;
use super::upgrade::{forward_upgrade, is_websocket_upgrade};
use crate::error::ProxyError;
use crate::metrics::{
    record_auth_rejection, record_body_rewrite, record_request, record_upstream_duration,
    record_upstream_error,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
};
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Service entry point for every request hyper parses on a client
/// connection. Returning an error makes hyper drop the connection.
pub async fn handle_request(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<Response<ProxyBody>, ProxyError> {
    debug!(method = %req.method(), path = req.uri().path(), "Request");

    if !ctx.gate.authorize(req.headers().cookie_header().as_deref()) {
        info!(remote = %remote_addr, path = "http", "Rejected unauthorized request");
        record_auth_rejection("http");
        record_request("http", StatusCode::UNAUTHORIZED.as_u16());
        return Ok(unauthorized_response().into_boxed());
    }

    if is_websocket_upgrade(req.headers()) {
        return forward_upgrade(ctx, req).await;
    }

    forward_request(&ctx, req).await
}

/// `Host` header of the client request, for logging.
pub(crate) fn client_host(headers: &HeaderMap) -> String {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

/// Log and count a failure to reach the upstream, then hand it back.
pub(crate) fn upstream_failure(
    ctx: &ProxyContext,
    client_host: &str,
    err: impl Into<ProxyError>,
) -> ProxyError {
    let err = err.into();
    error!(
        target_host = %ctx.upstream.authority(),
        host = client_host,
        "Upstream request failed: {}",
        err
    );
    record_upstream_error(err.kind());
    err
}

/// Send a request to the upstream with session headers applied. The
/// request keeps its extensions, so hyper's record of the client's header
/// casing travels with it.
pub(crate) async fn send_upstream(
    ctx: &ProxyContext,
    req: Request<Incoming>,
) -> Result<Response<Incoming>, ProxyError> {
    let host = client_host(req.headers());
    let (mut parts, body) = req.into_parts();
    ctx.apply_session_headers(&mut parts.headers)?;
    parts.uri = ctx.upstream_uri(&parts.uri)?;
    let method = parts.method.clone();

    let start = Instant::now();
    let response = ctx
        .client
        .request(Request::from_parts(parts, body.boxed()))
        .await
        .map_err(|e| upstream_failure(ctx, &host, e))?;

    record_upstream_duration(
        method.as_str(),
        response.status().as_u16(),
        start.elapsed().as_secs_f64() * 1000.0,
    );
    Ok(response)
}

pub async fn forward_request(
    ctx: &ProxyContext,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let response = send_upstream(ctx, req).await?;
    record_request("http", response.status().as_u16());

    if !ctx.rewriter.applies_to(&path) || !has_rewritable_body(&method, response.status()) {
        return Ok(response.into_boxed());
    }
    rewrite_response(ctx, &path, response).await
}

fn has_rewritable_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// A `Content-Encoding` other than `identity`, if the response has one.
fn encoded_with(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CONTENT_ENCODING)
        .map(|v| v.to_str().unwrap_or("<invalid>"))
        .filter(|v| !v.trim().eq_ignore_ascii_case("identity"))
}

/// Buffer the upstream body, run the matching rules and re-frame the result
/// with a fixed `Content-Length`.
async fn rewrite_response(
    ctx: &ProxyContext,
    path: &str,
    response: Response<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    if let Some(encoding) = encoded_with(response.headers()) {
        warn!(path, encoding, "Response body is encoded, skipping rewrite");
        return Ok(response.into_boxed());
    }

    let (mut parts, body) = response.into_parts();
    let original = body.collect().await?.to_bytes();

    let body = match ctx.rewriter.rewrite(path, &original) {
        Some(rewritten) => {
            for rule in &rewritten.applied {
                record_body_rewrite(*rule);
            }
            info!(path, rules = ?rewritten.applied, "rewrote response");
            Bytes::from(rewritten.body)
        }
        None => original,
    };

    parts.headers.remove(TRANSFER_ENCODING);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Ok(Response::from_parts(parts, full(body)))
}
