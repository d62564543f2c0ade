//! Rewrites absolute URLs (the `Referer` header) onto the upstream origin.

use url::Url;

/// Replace scheme, host, port and credentials of `absolute_url` with those of
/// `upstream`, keeping path, query and fragment.
///
/// Returns `None` when `absolute_url` is not an absolute URL this can be
/// applied to; callers then forward the original value untouched.
pub fn rewrite_origin(absolute_url: &str, upstream: &Url) -> Option<String> {
    let mut url = Url::parse(absolute_url).ok()?;
    if url.cannot_be_a_base() {
        return None;
    }

    url.set_scheme(upstream.scheme()).ok()?;
    url.set_host(upstream.host_str()).ok()?;
    url.set_port(upstream.port()).ok()?;
    url.set_username(upstream.username()).ok()?;
    url.set_password(upstream.password()).ok()?;

    Some(url.into())
}
