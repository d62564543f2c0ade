//! Listener and upstream socket helpers.

use crate::config::UpstreamTarget;
use crate::error::ProxyError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a TCP listener with `SO_REUSEADDR`, so a restarted proxy can rebind
/// while old connections linger in TIME_WAIT.
pub fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Open a TCP connection to the upstream within `timeout`.
pub async fn connect_upstream(
    upstream: &UpstreamTarget,
    timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    let addr = (upstream.connect_host(), upstream.port());
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(ProxyError::UpstreamConnect)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
