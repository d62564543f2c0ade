//! Cookie header parsing and session cookie merging.
//!
//! Values are never percent-decoded, unquoted or re-encoded: whatever bytes the
//! client or the session collaborator supplied are what reach the upstream.

/// Ordered cookie jar parsed from a `Cookie` header value.
///
/// Names and values are byte slices of the header; nothing is decoded, so
/// non-UTF-8 bytes survive. A repeated name keeps its first position and
/// takes the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar<'a> {
    pairs: Vec<(&'a [u8], &'a [u8])>,
}

impl<'a> CookieJar<'a> {
    pub fn parse(header: &'a [u8]) -> Self {
        let mut jar = CookieJar::default();
        for pair in header.split(|b| *b == b';') {
            // Pairs without '=' carry no name and are skipped.
            let Some(eq) = pair.iter().position(|b| *b == b'=') else {
                continue;
            };
            let name = pair[..eq].trim_ascii();
            if name.is_empty() {
                continue;
            }
            jar.set(name, pair[eq + 1..].trim_ascii());
        }
        jar
    }

    pub fn get(&self, name: &[u8]) -> Option<&'a [u8]> {
        self.pairs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    pub fn set(&mut self, name: &'a [u8], value: &'a [u8]) {
        match self.pairs.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((name, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + '_ {
        self.pairs.iter().copied()
    }

    /// Serialize as `name=value` pairs joined by `"; "`.
    pub fn to_header_value(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, (name, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(b"; ");
            }
            out.extend_from_slice(name);
            out.push(b'=');
            out.extend_from_slice(value);
        }
        out
    }
}

/// Overlay `session` cookies onto the inbound `Cookie` header.
///
/// Session values replace same-named inbound cookies in place; session cookies
/// the client did not send are appended in session order.
pub fn merge_cookies(inbound: &[u8], session: &[(String, String)]) -> Vec<u8> {
    let mut jar = CookieJar::parse(inbound);
    for (name, value) in session {
        jar.set(name.as_bytes(), value.as_bytes());
    }
    jar.to_header_value()
}
