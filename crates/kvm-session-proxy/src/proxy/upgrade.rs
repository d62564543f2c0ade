//! WebSocket upgrades.
//!
//! An upgrade that opens a client connection never reaches hyper: its head
//! was already parsed by the listener, so it is rewritten and written to the
//! upstream socket as-is, and the two sockets are spliced once the upstream
//! answers `101`. Any other answer is relayed and the client connection is
//! closed after it, so no later request skips session injection. An upgrade that
//! arrives later on a keep-alive connection goes through the pooled client
//! and both sides are upgraded once the upstream answers `101`. Frames are
//! relayed without inspection on both paths.

use super::auth::write_unauthorized;
use super::body::{empty, ProxyBody, ResponseExt};
use super::context::ProxyContext;
use super::forwarding::{send_upstream, upstream_failure};
use super::head::{read_response_head, RequestHead};
use super::headers::{SessionHeaders, HOST};
use super::network::connect_upstream;
use super::tls::connect_tls;
use crate::error::ProxyError;
use crate::metrics::{record_auth_rejection, record_request, WebSocketSessionGuard};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

fn has_token(headers: &HeaderMap, name: hyper::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Same test as [`RequestHead::is_websocket_upgrade`], on a parsed request.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    has_token(headers, UPGRADE, "websocket") && has_token(headers, CONNECTION, "upgrade")
}

/// Relay until either side closes, logging the byte counts.
async fn relay<A, B>(mut client: A, mut upstream: B, path: &str)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let _active = WebSocketSessionGuard::open();
    info!(path, "WebSocket session opened");
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            info!(path, to_upstream, to_client, "WebSocket session closed");
        }
        Err(e) => {
            debug!(path, "WebSocket session ended: {}", e);
        }
    }
}

/// Upgrade received on a connection hyper is serving.
pub async fn forward_upgrade(
    ctx: Arc<ProxyContext>,
    mut req: Request<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let path = req.uri().path().to_string();
    let client_upgrade = hyper::upgrade::on(&mut req);

    let mut response = send_upstream(&ctx, req).await?;
    record_request("websocket", response.status().as_u16());

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(path, status = %response.status(), "Upstream declined upgrade");
        return Ok(response.into_boxed());
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok((client, upstream)) => {
                relay(TokioIo::new(client), TokioIo::new(upstream), &path).await;
            }
            Err(e) => warn!(path, "WebSocket upgrade failed: {}", e),
        }
    });

    let (parts, _) = response.into_parts();
    Ok(Response::from_parts(parts, empty()))
}

/// Upgrade that opened the client connection. `buffered` holds every byte
/// read so far; whatever follows the head is forwarded after it.
pub async fn relay_raw_upgrade<S>(
    ctx: Arc<ProxyContext>,
    mut client: S,
    mut head: RequestHead,
    buffered: Vec<u8>,
    remote_addr: SocketAddr,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !ctx.gate.authorize(head.headers.cookie_header().as_deref()) {
        info!(remote = %remote_addr, path = "upgrade", "Rejected unauthorized request");
        record_auth_rejection("upgrade");
        record_request("websocket", StatusCode::UNAUTHORIZED.as_u16());
        write_unauthorized(&mut client).await?;
        return Ok(());
    }

    let host = head.headers.get_str(HOST).unwrap_or("-").to_string();
    let path = head.target.clone();
    ctx.apply_session_headers(&mut head.headers)?;
    head.target = ctx.upstream_target_path(&head.target)?.to_string();

    let mut outbound = head.to_bytes();
    outbound.extend_from_slice(&buffered[head.len..]);

    let tcp = connect_upstream(&ctx.upstream, ctx.connect_timeout)
        .await
        .map_err(|e| upstream_failure(&ctx, &host, e))?;

    if ctx.upstream.protocol().is_tls() {
        let upstream = connect_tls(&ctx.tls, &ctx.upstream, tcp)
            .await
            .map_err(|e| upstream_failure(&ctx, &host, e))?;
        handshake(&ctx, client, upstream, &outbound, &host, &path).await
    } else {
        handshake(&ctx, client, tcp, &outbound, &host, &path).await
    }
}

/// Send the rewritten handshake and wait for the upstream's answer. `101`
/// splices the sockets; anything else is relayed once and both sides are
/// closed.
async fn handshake<S, U>(
    ctx: &ProxyContext,
    mut client: S,
    mut upstream: U,
    outbound: &[u8],
    host: &str,
    path: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    upstream
        .write_all(outbound)
        .await
        .map_err(|e| upstream_failure(ctx, host, e))?;

    let (response, buffered) = match read_response_head(&mut upstream, ctx.max_head_bytes).await {
        Ok(Some(answer)) => answer,
        Ok(None) => {
            let eof = std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed before answering the upgrade",
            );
            return Err(upstream_failure(ctx, host, eof));
        }
        Err(e) => return Err(upstream_failure(ctx, host, e)),
    };
    record_request("websocket", response.status);
    client.write_all(&buffered).await?;

    if response.status == StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        relay(client, upstream, path).await;
        return Ok(());
    }

    debug!(path, status = response.status, "Upstream declined upgrade");
    let already_sent = (buffered.len() - response.len) as u64;
    match response.body_len() {
        Some(total) if total > already_sent => {
            let mut body = (&mut upstream).take(total - already_sent);
            tokio::io::copy(&mut body, &mut client).await?;
        }
        Some(_) => {}
        None => {
            // Close-delimited or chunked: stop sending and drain until the
            // upstream hangs up.
            upstream.shutdown().await?;
            tokio::io::copy(&mut upstream, &mut client).await?;
        }
    }
    client.shutdown().await?;
    Ok(())
}
