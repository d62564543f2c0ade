use anyhow::Context;
use clap::Parser;
use kvm_session_proxy::config::Config;
use kvm_session_proxy::metrics::MetricsServer;
use kvm_session_proxy::session::{CommandSessionProvider, SessionProvider, DEFAULT_SESSION_COMMAND};
use kvm_session_proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "kvm_session_proxy=info,hyper=warn";

#[derive(Parser, Debug)]
#[command(name = "kvm-session-proxy", version, about = "Session-injecting reverse proxy for KVM consoles")]
struct Args {
    /// Configuration file (JSON). Read from stdin when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `listen_port`.
    #[arg(short, long, env = "KVM_PROXY_PORT")]
    port: Option<u16>,

    /// Overrides `metrics_port`.
    #[arg(long, env = "KVM_PROXY_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Command that logs in to the console and prints the session JSON.
    #[arg(long, env = "KVM_PROXY_SESSION_COMMAND", default_value = DEFAULT_SESSION_COMMAND)]
    session_command: String,

    /// Extra arguments for the session command.
    #[arg(last = true)]
    session_args: Vec<String>,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::from_reader(std::io::stdin().lock())
            .context("Failed to load configuration from stdin")?,
    };

    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = Some(port);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = load_config(&args)?;
    info!(
        upstream = config.kvm_host.as_deref().unwrap_or_default(),
        port = config.listen_port,
        rewrites = config.rewrites.len(),
        authorization = config.authorization.is_some(),
        "Loaded configuration"
    );

    let provider = CommandSessionProvider::new(args.session_command, args.session_args);
    let session = provider
        .acquire(config.password()?)
        .await
        .context("Failed to acquire upstream session")?;

    if let Some(port) = config.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tokio::spawn(async move {
            if let Err(e) = MetricsServer::new(addr).run().await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let server = ProxyServer::new(&config, session)?;
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
