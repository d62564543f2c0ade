//! Prometheus metrics for the session proxy, and the optional endpoint that
//! serves them.
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

lazy_static! {
    /// Requests answered, by path kind (http|websocket) and status.
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "kvm_proxy_requests_total",
        "Total number of client requests handled by the proxy",
        &["kind", "status"]
    )
    .unwrap();

    pub static ref AUTH_REJECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "kvm_proxy_auth_rejections_total",
        "Requests rejected by the authorization cookie check",
        &["path"]  // path: http|upgrade
    )
    .unwrap();

    pub static ref UPSTREAM_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "kvm_proxy_upstream_errors_total",
        "Failures talking to the upstream console",
        &["kind"]
    )
    .unwrap();

    pub static ref BODY_REWRITES_TOTAL: CounterVec = register_counter_vec!(
        "kvm_proxy_body_rewrites_total",
        "Response bodies rewritten, by rule index",
        &["rule"]
    )
    .unwrap();

    pub static ref WEBSOCKET_SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        "kvm_proxy_websocket_sessions_active",
        "WebSocket relays currently open"
    )
    .unwrap();

    pub static ref UPSTREAM_REQUEST_DURATION_MS: HistogramVec = register_histogram_vec!(
        "kvm_proxy_upstream_duration_ms",
        "Time until the upstream returned response headers",
        &["method", "status"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        debug!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request(kind: &str, status: u16) {
    REQUESTS_TOTAL
        .with_label_values(&[kind, &status.to_string()])
        .inc();
}

pub fn record_auth_rejection(path: &str) {
    AUTH_REJECTIONS_TOTAL.with_label_values(&[path]).inc();
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_body_rewrite(rule: usize) {
    BODY_REWRITES_TOTAL
        .with_label_values(&[&rule.to_string()])
        .inc();
}

pub fn record_upstream_duration(method: &str, status: u16, duration_ms: f64) {
    UPSTREAM_REQUEST_DURATION_MS
        .with_label_values(&[method, &status.to_string()])
        .observe(duration_ms);
}

/// Counts an open WebSocket relay until dropped.
pub struct WebSocketSessionGuard(());

impl WebSocketSessionGuard {
    pub fn open() -> Self {
        WEBSOCKET_SESSIONS_ACTIVE.inc();
        Self(())
    }
}

impl Drop for WebSocketSessionGuard {
    fn drop(&mut self) {
        WEBSOCKET_SESSIONS_ACTIVE.dec();
    }
}

/// Plain HTTP endpoint exposing `GET /metrics`.
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics listening on http://{}/metrics", self.addr);
        serve_metrics(listener).await
    }
}

/// Accept loop for an already bound metrics listener.
pub async fn serve_metrics(listener: TcpListener) -> Result<(), anyhow::Error> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                debug!("Metrics connection error: {}", e);
            }
        });
    }
}

async fn handle_metrics(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(collect_metrics()))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"Not Found"))),
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}
