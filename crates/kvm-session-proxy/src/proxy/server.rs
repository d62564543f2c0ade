use super::context::{ContextError, ProxyContext};
use super::forwarding::handle_request;
use super::head::read_request_head;
use super::network::create_listener;
use super::stream::PrefixedStream;
use super::upgrade::relay_raw_upgrade;
use crate::config::Config;
use crate::error::ProxyError;
use crate::session::SessionDescriptor;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

pub struct ProxyServer {
    context: Arc<ProxyContext>,
    listen_port: u16,
}

impl ProxyServer {
    pub fn new(config: &Config, session: SessionDescriptor) -> Result<Self, ContextError> {
        Ok(Self {
            context: Arc::new(ProxyContext::new(config, session)?),
            listen_port: config.listen_port,
        })
    }

    /// Bind `0.0.0.0:<listen_port>` and serve until the listener fails.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let listener = create_listener(addr)?;
        info!("Listening on http://{}", addr);
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), anyhow::Error> {
        let ctx = &self.context;
        info!("Proxying to {}", ctx.upstream);
        info!(
            "Authorization cookie check {}",
            if ctx.gate.is_enabled() { "enabled" } else { "disabled" }
        );
        for rule in ctx.rewriter.rules() {
            info!(
                index = rule.index,
                path_match = rule.path_pattern(),
                search = rule.search_pattern(),
                replace = rule.replacement(),
                "Inserted rewrite rule"
            );
        }

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let ctx = Arc::clone(&self.context);

            tokio::spawn(async move {
                if let Err(err) = serve_connection(ctx, stream, remote_addr).await {
                    debug!("Connection from {} closed: {}", remote_addr, err);
                }
            });
        }
    }
}

/// Sniff the first request head, then either splice a WebSocket upgrade
/// directly or hand the connection to hyper with the head replayed.
async fn serve_connection(
    ctx: Arc<ProxyContext>,
    mut stream: TcpStream,
    remote_addr: SocketAddr,
) -> Result<(), ProxyError> {
    stream.set_nodelay(true)?;
    let Some((head, buffered)) = read_request_head(&mut stream, ctx.max_head_bytes).await? else {
        return Ok(());
    };

    if head.is_websocket_upgrade() {
        return relay_raw_upgrade(ctx, stream, head, buffered, remote_addr).await;
    }

    let io = TokioIo::new(PrefixedStream::new(stream, buffered));
    let service = service_fn(move |req| handle_request(Arc::clone(&ctx), req, remote_addr));

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .auto_date_header(false)
        .serve_connection(io, service)
        .with_upgrades()
        .await?;
    Ok(())
}
