//! Session-injecting reverse proxy for remote KVM consoles.
//!
//! At startup a session is acquired once from an external command; every
//! request is then forwarded to the console with the session cookies merged
//! in, optionally gated by a client cookie and with response bodies
//! rewritten by configured rules.

pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod session;

pub use config::Config;
pub use error::{ConfigError, ProxyError, SessionError};
pub use proxy::ProxyServer;
pub use session::{CommandSessionProvider, SessionDescriptor, SessionProvider};
