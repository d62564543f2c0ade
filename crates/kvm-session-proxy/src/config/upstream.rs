//! Upstream target and connection pool configuration.

use super::protocol::Protocol;
use crate::error::ConfigError;
use hyper::http::uri::PathAndQuery;
use hyper::Uri;
use serde::Deserialize;
use url::{Host, Url};

/// The single console every request is forwarded to, parsed from `kvm_host`.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    url: Url,
    protocol: Protocol,
}

impl UpstreamTarget {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUpstream {
            url: raw.to_string(),
            reason,
        };

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let protocol = Protocol::from_scheme(url.scheme()).map_err(invalid)?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }

        Ok(Self { url, protocol })
    }

    /// The parsed target, including any credentials it carries.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Host as written in the URL (IPv6 literals keep their brackets).
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Host in the form `TcpStream::connect` and TLS server names expect.
    pub fn connect_host(&self) -> String {
        match self.url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => String::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.url
            .port()
            .unwrap_or_else(|| self.protocol.default_port())
    }

    /// Value for the `Host` header of forwarded requests.
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.host(), port),
            None => self.host().to_string(),
        }
    }

    /// `scheme://authority`, without credentials.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.protocol.as_str(), self.authority())
    }

    /// Build the absolute URI for a forwarded request. A path configured on
    /// `kvm_host` is prepended to the client's path.
    pub fn request_uri(
        &self,
        path_and_query: Option<&PathAndQuery>,
    ) -> Result<Uri, hyper::http::uri::InvalidUri> {
        let base_path = self.url.path().trim_end_matches('/');
        let tail = path_and_query.map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}{}", self.origin(), base_path, tail).parse()
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.origin())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_pool_max_idle_per_host() -> usize {
    100
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_keepalive_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}
