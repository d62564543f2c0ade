//! State shared by every connection the proxy serves.

use super::auth::AuthorizationGate;
use super::client::{create_http_client, HttpClient};
use super::cookies::merge_cookies;
use super::headers::{SessionHeaders, COOKIE, HOST, REFERER};
use super::origin::rewrite_origin;
use super::rewrite::BodyRewriter;
use super::tls::insecure_client_config;
use crate::config::{Config, UpstreamTarget};
use crate::error::{ConfigError, ProxyError};
use crate::session::SessionDescriptor;
use hyper::http::uri::PathAndQuery;
use hyper::Uri;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;

/// Immutable after startup; one instance is shared by all connections.
pub struct ProxyContext {
    pub upstream: UpstreamTarget,
    pub session: SessionDescriptor,
    pub gate: AuthorizationGate,
    pub rewriter: BodyRewriter,
    pub client: HttpClient,
    pub tls: TlsConnector,
    pub connect_timeout: Duration,
    pub max_head_bytes: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build upstream TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

impl ProxyContext {
    pub fn new(config: &Config, session: SessionDescriptor) -> Result<Self, ContextError> {
        let upstream = config.upstream_target()?;
        let rewriter = BodyRewriter::compile(&config.rewrites)?;
        let client = create_http_client(&config.connection_pool)?;
        let tls = TlsConnector::from(Arc::new(insecure_client_config()?));

        Ok(Self {
            upstream,
            session,
            gate: AuthorizationGate::new(config.authorization.clone()),
            rewriter,
            client,
            tls,
            connect_timeout: Duration::from_secs(config.connection_pool.connect_timeout_secs),
            max_head_bytes: config.max_request_head_bytes,
        })
    }

    /// Inject the session into an outbound header set: merge session cookies
    /// into the client's (all `Cookie` lines, as bytes), move an absolute
    /// `Referer` onto the upstream origin and point `Host` at the upstream.
    pub fn apply_session_headers<H: SessionHeaders>(&self, headers: &mut H) -> Result<(), ProxyError> {
        let inbound = headers.cookie_header().unwrap_or_default();
        let cookies = merge_cookies(&inbound, &self.session.cookies);
        headers.set_raw(COOKIE, &cookies)?;

        let referer = headers
            .get_raw(REFERER)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|raw| rewrite_origin(raw, self.upstream.url()));
        if let Some(referer) = referer {
            headers.set_raw(REFERER, referer.as_bytes())?;
        }

        headers.set_raw(HOST, self.upstream.authority().as_bytes())
    }

    /// Absolute upstream URI for a client request target. Absolute-form
    /// targets keep only their path and query.
    pub fn upstream_uri(&self, target: &Uri) -> Result<Uri, ProxyError> {
        Ok(self.upstream.request_uri(target.path_and_query())?)
    }

    /// Origin-form request target sent upstream on the raw path.
    pub fn upstream_target_path(&self, target: &str) -> Result<PathAndQuery, ProxyError> {
        let client_uri: Uri = target.parse()?;
        let uri = self.upstream_uri(&client_uri)?;
        Ok(uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/")))
    }
}
