//! Response body rewriting.
//!
//! Rewriting needs the complete body, so responses to matching paths are
//! buffered in full and re-sent with a fixed `Content-Length`: those routes
//! lose streaming and chunked transfer. Responses to other paths are not
//! touched and stream straight through.

use crate::config::RewriteRuleConfig;
use crate::error::ConfigError;
use regex::Regex;
use std::borrow::Cow;

#[derive(Debug, Clone)]
pub struct CompiledRewrite {
    pub index: usize,
    path_match: Regex,
    search: Regex,
    replace: String,
}

impl CompiledRewrite {
    pub fn compile(index: usize, rule: &RewriteRuleConfig) -> Result<Self, ConfigError> {
        let compile = |field: &'static str, pattern: &str| {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidRewrite {
                index,
                field,
                source,
            })
        };

        Ok(Self {
            index,
            path_match: compile("path_match", &rule.path_match)?,
            search: compile("search", &rule.search)?,
            replace: rule.replace.clone(),
        })
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.path_match.is_match(path)
    }

    /// Replace every match of `search` in `text`.
    pub fn apply<'t>(&self, text: &'t str) -> Cow<'t, str> {
        self.search.replace_all(text, self.replace.as_str())
    }

    pub fn path_pattern(&self) -> &str {
        self.path_match.as_str()
    }

    pub fn search_pattern(&self) -> &str {
        self.search.as_str()
    }

    pub fn replacement(&self) -> &str {
        &self.replace
    }
}

/// Ordered rewrite rules.
#[derive(Debug, Clone, Default)]
pub struct BodyRewriter {
    rules: Vec<CompiledRewrite>,
}

/// Outcome of rewriting one body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub body: Vec<u8>,
    /// Indices of the rules that ran, in order.
    pub applied: Vec<usize>,
}

impl BodyRewriter {
    pub fn compile(rules: &[RewriteRuleConfig]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| CompiledRewrite::compile(index, rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[CompiledRewrite] {
        &self.rules
    }

    /// Whether any rule applies to `path`; if not the response can stream.
    pub fn applies_to(&self, path: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches_path(path))
    }

    /// Run every rule whose path pattern matches `path` over `body`, each on
    /// the previous rule's output. The body is read as UTF-8, invalid
    /// sequences replaced. Returns `None` when no rule applies.
    pub fn rewrite(&self, path: &str, body: &[u8]) -> Option<Rewritten> {
        let mut applied = Vec::new();
        let mut text: Option<String> = None;

        for rule in self.rules.iter().filter(|rule| rule.matches_path(path)) {
            let current = match text.take() {
                Some(current) => current,
                None => String::from_utf8_lossy(body).into_owned(),
            };
            text = Some(match rule.apply(&current) {
                Cow::Borrowed(_) => current,
                Cow::Owned(replaced) => replaced,
            });
            applied.push(rule.index);
        }

        text.map(|text| Rewritten {
            body: text.into_bytes(),
            applied,
        })
    }
}
