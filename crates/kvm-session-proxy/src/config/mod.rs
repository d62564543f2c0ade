//! Configuration types for the session proxy.
//!
//! The configuration is a single JSON document read once at startup, either
//! from a file or from standard input. It is never reloaded.

mod protocol;
mod rules;
mod upstream;

use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy::BodyRewriter;

pub use protocol::Protocol;
pub use rules::{AuthorizationConfig, RewriteRuleConfig};
pub use upstream::{ConnectionPoolConfig, UpstreamTarget};

pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_MAX_REQUEST_HEAD_BYTES: usize = 64 * 1024;

#[derive(Clone, Deserialize)]
pub struct Config {
    /// Secret handed to the session command. Required.
    #[serde(default)]
    pub kvm_password: Option<String>,

    /// Upstream console URL. Required.
    #[serde(default)]
    pub kvm_host: Option<String>,

    /// When present, clients must carry this cookie.
    #[serde(default)]
    pub authorization: Option<AuthorizationConfig>,

    /// Response body rewrites, applied in declared order.
    #[serde(default)]
    pub rewrites: Vec<RewriteRuleConfig>,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default)]
    pub metrics_port: Option<u16>,

    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,

    #[serde(default = "default_max_request_head_bytes")]
    pub max_request_head_bytes: usize,
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_max_request_head_bytes() -> usize {
    DEFAULT_MAX_REQUEST_HEAD_BYTES
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("kvm_password", &self.kvm_password.as_ref().map(|_| "<redacted>"))
            .field("kvm_host", &self.kvm_host)
            .field("authorization", &self.authorization.as_ref().map(|a| &a.key))
            .field("rewrites", &self.rewrites)
            .field("listen_port", &self.listen_port)
            .field("metrics_port", &self.metrics_port)
            .field("connection_pool", &self.connection_pool)
            .field("max_request_head_bytes", &self.max_request_head_bytes)
            .finish()
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Read the whole document from `reader` (standard input in production).
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.password()?;
        self.upstream_target()?;

        if let Some(ref auth) = self.authorization {
            if auth.key.is_empty() {
                return Err(ConfigError::InvalidAuthorization(
                    "'key' must not be empty".to_string(),
                ));
            }
        }

        // Regex errors surface at load time.
        BodyRewriter::compile(&self.rewrites)?;

        Ok(())
    }

    pub fn password(&self) -> Result<&str, ConfigError> {
        self.kvm_password
            .as_deref()
            .ok_or(ConfigError::MissingField("kvm_password"))
    }

    pub fn upstream_target(&self) -> Result<UpstreamTarget, ConfigError> {
        let host = self
            .kvm_host
            .as_deref()
            .ok_or(ConfigError::MissingField("kvm_host"))?;
        UpstreamTarget::parse(host)
    }
}
