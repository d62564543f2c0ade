//! Access and rewrite rules configuration.

use serde::Deserialize;

/// Cookie that must be present (with this exact value) for a client to use
/// the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorizationConfig {
    pub key: String,
    pub value: String,
}

/// A find/replace applied to response bodies of matching paths.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewriteRuleConfig {
    /// Regex tested against the request path (query excluded).
    pub path_match: String,
    /// Regex applied to the response body text.
    pub search: String,
    /// Replacement text; `$1` / `${name}` expand capture groups.
    pub replace: String,
}
