//! Error types for the proxy.
//!
//! Startup failures (`ConfigError`, `SessionError`) abort the process before
//! the listener is bound. `ProxyError` is scoped to a single client
//! connection and never touches shared state.

use std::process::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Configuration is invalid: missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid kvm_host '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("Invalid authorization configuration: {0}")]
    InvalidAuthorization(String),

    #[error("Invalid rewrite rule #{index} ({field}): {source}")]
    InvalidRewrite {
        index: usize,
        field: &'static str,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to start session command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Session command I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session command exited with {0}")]
    ExitStatus(ExitStatus),

    #[error("Session payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Session payload has no 'cookies' object")]
    MissingCookies,

    #[error("Session cookie '{name}' is not a string")]
    InvalidCookie { name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("Failed to connect to upstream: {0}")]
    UpstreamConnect(std::io::Error),

    #[error("Timed out connecting to upstream")]
    UpstreamTimeout,

    #[error("TLS handshake with upstream failed: {0}")]
    Tls(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Body error: {0}")]
    Body(#[from] hyper::Error),

    #[error("Header '{0}' has an invalid value")]
    InvalidHeader(&'static str),

    #[error("Invalid upstream URI: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    #[error("Malformed request head: {0}")]
    MalformedHead(#[from] httparse::Error),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),
}

impl ProxyError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Upstream(_) => "upstream",
            ProxyError::UpstreamConnect(_) => "connect",
            ProxyError::UpstreamTimeout => "timeout",
            ProxyError::Tls(_) => "tls",
            ProxyError::Io(_) => "io",
            ProxyError::Body(_) => "body",
            ProxyError::InvalidHeader(_) => "header",
            ProxyError::InvalidUri(_) => "uri",
            ProxyError::MalformedHead(_) => "malformed",
            ProxyError::HeadTooLarge(_) => "head_too_large",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::MissingField("kvm_host");
        assert_eq!(
            err.to_string(),
            "Configuration is invalid: missing required field 'kvm_host'"
        );

        let err = ConfigError::InvalidUpstream {
            url: "ftp://kvm".to_string(),
            reason: "unsupported scheme 'ftp'".to_string(),
        };
        assert!(err.to_string().contains("ftp://kvm"));
    }

    #[test]
    fn test_proxy_error_kind() {
        assert_eq!(ProxyError::UpstreamTimeout.kind(), "timeout");
        assert_eq!(ProxyError::HeadTooLarge(10).kind(), "head_too_large");
        assert_eq!(ProxyError::InvalidHeader("cookie").kind(), "header");
    }
}
