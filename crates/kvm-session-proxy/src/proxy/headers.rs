//! Header access shared by the raw and the hyper request paths.
//!
//! The raw path keeps headers exactly as they arrived on the wire (order,
//! duplicates and name casing) in a [`HeaderList`]. The hyper path uses a
//! `HeaderMap` whose original casing hyper tracks on its own. Session
//! injection is written once against [`SessionHeaders`] and applied to both.

use crate::error::ProxyError;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};

pub const COOKIE: &str = "cookie";
pub const REFERER: &str = "referer";
pub const HOST: &str = "host";

/// Canonical casing used when a header has to be created.
fn display_name(name: &'static str) -> &'static str {
    match name {
        "cookie" => "Cookie",
        "referer" => "Referer",
        "host" => "Host",
        other => other,
    }
}

/// Read/replace access to the handful of headers the proxy rewrites.
/// `name` is always a lowercase static name.
pub trait SessionHeaders {
    /// Raw value of the first header called `name`.
    fn get_raw(&self, name: &'static str) -> Option<&[u8]>;

    /// Raw values of every header called `name`, in arrival order.
    fn get_all_raw(&self, name: &'static str) -> Vec<&[u8]>;

    /// Replace every header called `name` with a single one holding `value`,
    /// or append it when absent.
    fn set_raw(&mut self, name: &'static str, value: &[u8]) -> Result<(), ProxyError>;

    /// All `Cookie` headers folded into one value, joined by `"; "`.
    fn cookie_header(&self) -> Option<Vec<u8>> {
        let values = self.get_all_raw(COOKIE);
        if values.is_empty() {
            return None;
        }
        Some(values.join(&b"; "[..]))
    }
}

impl SessionHeaders for HeaderMap {
    fn get_raw(&self, name: &'static str) -> Option<&[u8]> {
        self.get(name).map(HeaderValue::as_bytes)
    }

    fn get_all_raw(&self, name: &'static str) -> Vec<&[u8]> {
        self.get_all(name).iter().map(HeaderValue::as_bytes).collect()
    }

    fn set_raw(&mut self, name: &'static str, value: &[u8]) -> Result<(), ProxyError> {
        let value = HeaderValue::from_bytes(value).map_err(|_| ProxyError::InvalidHeader(name))?;
        self.insert(HeaderName::from_static(name), value);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub name: String,
    pub value: Vec<u8>,
}

/// Ordered, case-preserving header list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<HeaderEntry>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push(HeaderEntry {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.position(name).map(|i| self.entries[i].value.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// True when any `name` header lists `token` (comma separated,
    /// case-insensitive).
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|e| e.name.eq_ignore_ascii_case(name))
            .filter_map(|e| std::str::from_utf8(&e.value).ok())
            .flat_map(|v| v.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append `Name: value\r\n` lines in wire order.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for entry in &self.entries {
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&entry.value);
            out.extend_from_slice(b"\r\n");
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }
}

impl SessionHeaders for HeaderList {
    fn get_raw(&self, name: &'static str) -> Option<&[u8]> {
        self.get(name)
    }

    fn get_all_raw(&self, name: &'static str) -> Vec<&[u8]> {
        self.entries
            .iter()
            .filter(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_slice())
            .collect()
    }

    fn set_raw(&mut self, name: &'static str, value: &[u8]) -> Result<(), ProxyError> {
        if value.iter().any(|b| matches!(b, b'\r' | b'\n' | 0)) {
            return Err(ProxyError::InvalidHeader(name));
        }
        match self.position(name) {
            Some(i) => {
                self.entries[i].value = value.to_vec();
                let mut seen = 0;
                self.entries.retain(|e| {
                    if !e.name.eq_ignore_ascii_case(name) {
                        return true;
                    }
                    seen += 1;
                    seen == 1
                });
            }
            None => self.push(display_name(name), value),
        }
        Ok(())
    }
}
