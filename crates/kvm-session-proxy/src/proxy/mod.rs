//! The interception pipeline between clients and the upstream console.
//!
//! # Module Structure
//!
//! - `server` - ProxyServer accept loop and per-connection dispatch
//! - `head` / `stream` - first request head sniffing and replay into hyper
//! - `forwarding` - plain HTTP forwarding and response rewriting
//! - `upgrade` - WebSocket upgrades on the raw and the hyper path
//! - `auth`, `cookies`, `origin`, `rewrite`, `headers` - request/response transforms
//! - `client`, `tls`, `network` - upstream connections and the listener socket

mod auth;
mod body;
mod client;
mod context;
mod cookies;
mod forwarding;
mod head;
mod headers;
mod network;
mod origin;
mod rewrite;
mod server;
mod stream;
mod tls;
mod upgrade;

pub use auth::{
    unauthorized_bytes, unauthorized_response, write_unauthorized, AuthorizationGate,
    UNAUTHORIZED_BODY, UNAUTHORIZED_CONTENT_TYPE,
};
pub use body::ProxyBody;
pub use context::{ContextError, ProxyContext};
pub use cookies::{merge_cookies, CookieJar};
pub use head::{
    parse_head, parse_response_head, read_request_head, read_response_head, RequestHead,
    ResponseHead,
};
pub use headers::{HeaderEntry, HeaderList, SessionHeaders};
pub use network::create_listener;
pub use origin::rewrite_origin;
pub use rewrite::{BodyRewriter, CompiledRewrite, Rewritten};
pub use server::ProxyServer;
pub use stream::PrefixedStream;
