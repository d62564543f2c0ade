//! End-to-end tests: an in-process proxy in front of a mock console.
//!
//! The mock upstream is a hyper server that records every request it sees,
//! answers plain requests with a fixed body per path and echoes bytes back
//! after a WebSocket upgrade (refused with `403` on `/ws-denied`). A second,
//! raw upstream answers everything with a chunked body.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, CONNECTION, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kvm_session_proxy::proxy::unauthorized_bytes;
use kvm_session_proxy::{Config, ProxyServer, SessionDescriptor};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Seen {
    path: String,
    headers: HeaderMap,
}

fn mock_body(path: &str) -> &'static str {
    match path {
        "/console/app.js" => "var a='foo';var b='foo';var c='baz';",
        _ => "foofoobaz",
    }
}

/// Start the mock console; returns its address and a feed of received requests.
async fn spawn_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |mut req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(Seen {
                            path: req.uri().path().to_string(),
                            headers: req.headers().clone(),
                        });

                        if req.headers().contains_key(UPGRADE) && req.uri().path() == "/ws-denied" {
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::FORBIDDEN)
                                    .body(Full::new(Bytes::from_static(b"denied")))
                                    .unwrap(),
                            );
                        }

                        if req.headers().contains_key(UPGRADE) {
                            let on_upgrade = hyper::upgrade::on(&mut req);
                            tokio::spawn(async move {
                                if let Ok(upgraded) = on_upgrade.await {
                                    let (mut r, mut w) = tokio::io::split(TokioIo::new(upgraded));
                                    let _ = tokio::io::copy(&mut r, &mut w).await;
                                }
                            });
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::SWITCHING_PROTOCOLS)
                                    .header(UPGRADE, "websocket")
                                    .header(CONNECTION, "Upgrade")
                                    .body(Full::new(Bytes::new()))
                                    .unwrap(),
                            );
                        }

                        Ok(Response::new(Full::new(Bytes::from_static(
                            mock_body(req.uri().path()).as_bytes(),
                        ))))
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    (addr, rx)
}

const CHUNKED_PARTS: [&str; 3] = ["var a='foo';", "var b='fo", "o';var c='baz';"];

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

async fn write_chunked_response(stream: &mut TcpStream) -> std::io::Result<()> {
    stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/javascript\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await?;
    for part in CHUNKED_PARTS {
        stream
            .write_all(format!("{:x}\r\n{}\r\n", part.len(), part).as_bytes())
            .await?;
        stream.flush().await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stream.write_all(b"0\r\n\r\n").await
}

/// Raw upstream answering every (bodyless) request with `CHUNKED_PARTS`,
/// one chunk per write.
async fn spawn_chunked_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    while let Some(end) = head_end(&buf) {
                        buf.drain(..end);
                        if write_chunked_response(&mut stream).await.is_err() {
                            return;
                        }
                    }
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
            });
        }
    });

    addr
}

/// Start the proxy with `extra` merged into a minimal configuration.
async fn spawn_proxy(upstream: SocketAddr, extra: serde_json::Value) -> SocketAddr {
    let mut doc = serde_json::json!({
        "kvm_password": "pw",
        "kvm_host": format!("http://{upstream}"),
    });
    if let (Some(doc), Some(extra)) = (doc.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            doc.insert(k.clone(), v.clone());
        }
    }
    let config = Config::from_json_str(&doc.to_string()).unwrap();
    let session = SessionDescriptor::from_cookies([("b", "2"), ("SessionCookie", "s3cr3t")]);

    let server = ProxyServer::new(&config, session).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().timeout(TEST_TIMEOUT).build().unwrap()
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("upstream saw no request")
        .expect("upstream stopped")
}

/// Read until the end of a response head; returns everything read.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = tokio::time::timeout(TEST_TIMEOUT, stream.read(&mut chunk))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(buf).unwrap()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).unwrap().to_str().unwrap()
}

const UPGRADE_REQUEST: &str = "GET /ws?console=1 HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n";

#[tokio::test]
async fn test_request_forwarded_with_session_cookies() {
    let (upstream, mut seen) = spawn_upstream().await;
    let proxy = spawn_proxy(upstream, serde_json::json!({})).await;

    let response = client()
        .get(format!("http://{proxy}/index.html?lang=en"))
        .header("Cookie", "a=1; SessionCookie=stale")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "foofoobaz");

    let req = next_seen(&mut seen).await;
    assert_eq!(req.path, "/index.html");
    assert_eq!(header(&req.headers, "cookie"), "a=1; SessionCookie=s3cr3t; b=2");
    assert_eq!(header(&req.headers, "host"), upstream.to_string());
}

#[tokio::test]
async fn test_unauthorized_request_gets_fixed_401() {
    let (upstream, mut seen) = spawn_upstream().await;
    let proxy = spawn_proxy(
        upstream,
        serde_json::json!({"authorization": {"key": "auth", "value": "secret1"}}),
    )
    .await;

    let response = client()
        .get(format!("http://{proxy}/"))
        .header("Cookie", "auth=wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(response.headers()["content-type"], "text/html");
    assert_eq!(response.headers()["content-length"], "43");
    assert_eq!(
        response.text().await.unwrap(),
        "You are not authorized to use this service."
    );
    assert!(seen.try_recv().is_err());

    // Same bytes as the raw path writes for a rejected upgrade.
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nCookie: auth=wrong\r\n\r\n")
        .await
        .unwrap();
    let expected = unauthorized_bytes();
    let mut received = vec![0u8; expected.len()];
    tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&received),
        String::from_utf8_lossy(&expected)
    );

    let response = client()
        .get(format!("http://{proxy}/"))
        .header("Cookie", "lang=en; auth=secret1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    next_seen(&mut seen).await;
}

#[tokio::test]
async fn test_unauthorized_upgrade_gets_raw_401() {
    let (upstream, mut seen) = spawn_upstream().await;
    let proxy = spawn_proxy(
        upstream,
        serde_json::json!({"authorization": {"key": "auth", "value": "secret1"}}),
    )
    .await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("{UPGRADE_REQUEST}\r\n").as_bytes())
        .await
        .unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, unauthorized_bytes());
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_body_rewrite_updates_content_length() {
    let (upstream, _seen) = spawn_upstream().await;
    let proxy = spawn_proxy(
        upstream,
        serde_json::json!({"rewrites": [
            {"path_match": "^/console/", "search": "foo", "replace": "quux"}
        ]}),
    )
    .await;

    let response = client()
        .get(format!("http://{proxy}/console/app.js"))
        .send()
        .await
        .unwrap();
    let expected = "var a='quux';var b='quux';var c='baz';";
    assert_eq!(
        response.headers()["content-length"],
        expected.len().to_string().as_str()
    );
    assert_eq!(response.text().await.unwrap(), expected);

    let untouched = client()
        .get(format!("http://{proxy}/other"))
        .send()
        .await
        .unwrap();
    assert_eq!(untouched.text().await.unwrap(), "foofoobaz");
}

#[tokio::test]
async fn test_chunked_upstream_body_is_reframed_when_rewritten() {
    let upstream = spawn_chunked_upstream().await;
    let proxy = spawn_proxy(
        upstream,
        serde_json::json!({"rewrites": [
            {"path_match": "^/console/", "search": "foo", "replace": "quux"}
        ]}),
    )
    .await;

    let response = client()
        .get(format!("http://{proxy}/console/app.js"))
        .send()
        .await
        .unwrap();
    let expected = "var a='quux';var b='quux';var c='baz';";
    assert_eq!(
        response.headers()["content-length"],
        expected.len().to_string().as_str()
    );
    assert!(response.headers().get("transfer-encoding").is_none());
    assert_eq!(response.text().await.unwrap(), expected);

    let streamed = client()
        .get(format!("http://{proxy}/other.js"))
        .send()
        .await
        .unwrap();
    assert_eq!(streamed.headers()["transfer-encoding"], "chunked");
    assert!(streamed.headers().get("content-length").is_none());
    assert_eq!(streamed.text().await.unwrap(), CHUNKED_PARTS.concat());
}

#[tokio::test]
async fn test_non_utf8_cookie_reaches_upstream_unchanged() {
    let (upstream, mut seen) = spawn_upstream().await;
    let proxy = spawn_proxy(upstream, serde_json::json!({})).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"GET /raw HTTP/1.1\r\nHost: localhost\r\nCookie: a=caf\xe9\r\n\r\n")
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

    let req = next_seen(&mut seen).await;
    assert_eq!(
        req.headers["cookie"].as_bytes(),
        b"a=caf\xe9; b=2; SessionCookie=s3cr3t"
    );
}

#[tokio::test]
async fn test_referer_rewritten_or_left_alone() {
    let (upstream, mut seen) = spawn_upstream().await;
    let proxy = spawn_proxy(upstream, serde_json::json!({})).await;

    client()
        .get(format!("http://{proxy}/a"))
        .header("Referer", format!("http://{proxy}/viewer.html?x=1"))
        .send()
        .await
        .unwrap();
    let req = next_seen(&mut seen).await;
    assert_eq!(
        header(&req.headers, "referer"),
        format!("http://{upstream}/viewer.html?x=1")
    );

    let response = client()
        .get(format!("http://{proxy}/b"))
        .header("Referer", "not a url")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let req = next_seen(&mut seen).await;
    assert_eq!(header(&req.headers, "referer"), "not a url");
}

#[tokio::test]
async fn test_websocket_upgrade_carries_both_cookies_and_relays() {
    let (upstream, mut seen) = spawn_upstream().await;
    let proxy = spawn_proxy(upstream, serde_json::json!({})).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("{UPGRADE_REQUEST}Cookie: a=1\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");

    let req = next_seen(&mut seen).await;
    assert_eq!(req.path, "/ws");
    let cookie = header(&req.headers, "cookie");
    assert!(cookie.contains("a=1"));
    assert!(cookie.contains("b=2"));

    stream.write_all(b"\x81\x05hello").await.unwrap();
    let mut echo = [0u8; 7];
    tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut echo))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echo, b"\x81\x05hello");
}

#[tokio::test]
async fn test_websocket_upgrade_after_keep_alive_request() {
    let (upstream, mut seen) = spawn_upstream().await;
    let proxy = spawn_proxy(upstream, serde_json::json!({})).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"GET /first HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = read_head(&mut stream).await;
    while !response.ends_with("foofoobaz") {
        let mut chunk = [0u8; 64];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        response.push_str(std::str::from_utf8(&chunk[..n]).unwrap());
    }
    assert_eq!(next_seen(&mut seen).await.path, "/first");

    stream
        .write_all(format!("{UPGRADE_REQUEST}Cookie: a=1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");

    let req = next_seen(&mut seen).await;
    assert_eq!(header(&req.headers, "cookie"), "a=1; b=2; SessionCookie=s3cr3t");

    stream.write_all(b"frame").await.unwrap();
    let mut echo = [0u8; 5];
    tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut echo))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echo, b"frame");
}

#[tokio::test]
async fn test_refused_upgrade_is_relayed_then_closed() {
    let (upstream, mut seen) = spawn_upstream().await;
    let proxy = spawn_proxy(upstream, serde_json::json!({})).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = UPGRADE_REQUEST.replacen("/ws?console=1", "/ws-denied", 1);
    stream
        .write_all(format!("{request}Cookie: a=1\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    let received = String::from_utf8(received).unwrap();
    assert!(received.starts_with("HTTP/1.1 403"), "unexpected: {received}");
    assert!(received.ends_with("\r\n\r\ndenied"));

    let req = next_seen(&mut seen).await;
    assert_eq!(req.path, "/ws-denied");
    assert_eq!(header(&req.headers, "cookie"), "a=1; b=2; SessionCookie=s3cr3t");
}

#[tokio::test]
async fn test_upstream_down_closes_client_connection() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = closed.local_addr().unwrap();
    drop(closed);
    let proxy = spawn_proxy(upstream, serde_json::json!({})).await;

    let result = client().get(format!("http://{proxy}/")).send().await;
    assert!(result.is_err());

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("{UPGRADE_REQUEST}\r\n").as_bytes())
        .await
        .unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert!(received.is_empty());
}
