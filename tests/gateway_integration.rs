//! Integration tests for the gateway data plane
//!
//! Each test spins up a real backend HTTP server on an ephemeral port,
//! binds a proxy server (and where needed the API server) on ephemeral
//! ports, and drives them over raw TCP the way a client would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use subgate::api::ApiServer;
use subgate::config::PortMap;
use subgate::control;
use subgate::pool::{ConnectionPool, PoolConfig};
use subgate::proxy::ProxyServer;
use subgate::routes::RoutingTable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Start a backend HTTP server on an ephemeral port that echoes the
/// request's Host and X-Forwarded-Host headers in its body.
async fn spawn_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                    let host = req
                        .headers()
                        .get(hyper::header::HOST)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let forwarded_host = req
                        .headers()
                        .get("x-forwarded-host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let forwarded_for = req
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let body = format!(
                        "echo host={} xfh={} xff={} path={}",
                        host,
                        forwarded_host,
                        forwarded_for,
                        req.uri().path()
                    );
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    port
}

struct Gateway {
    proxy_port: u16,
    table: Arc<RoutingTable>,
    _shutdown_tx: watch::Sender<bool>,
}

/// Bind a proxy on an ephemeral listen port mapped to `target_port`, backed
/// by a routing table with the given lease TTL.
async fn spawn_gateway(target_port: u16, ttl: Duration) -> Gateway {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();

    let table = Arc::new(RoutingTable::with_ttl(
        vec![PortMap {
            listen: proxy_port,
            target: target_port,
        }],
        ttl,
    ));

    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let proxy =
        ProxyServer::from_listener(listener, Arc::clone(&table), pool, shutdown_rx).unwrap();
    tokio::spawn(proxy.run());

    Gateway {
        proxy_port,
        table,
        _shutdown_tx: shutdown_tx,
    }
}

/// Send an HTTP request with a custom Host header and return the raw
/// response.
async fn http_get_with_host(port: u16, path: &str, host: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Send an HTTP request with an optional bearer token and body.
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    let mut request = format!("{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n", method, path, port);
    if let Some(token) = token {
        request.push_str(&format!("Authorization: Bearer {}\r\n", token));
    }
    if let Some(body) = body {
        request.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n",
            body.len()
        ));
    }
    request.push_str("Connection: close\r\n\r\n");
    if let Some(body) = body {
        request.push_str(body);
    }
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_proxy_round_trip() {
    let backend_port = spawn_echo_backend().await;
    let gw = spawn_gateway(backend_port, Duration::from_secs(30)).await;

    gw.table.add("demo", "127.0.0.1", backend_port).unwrap();

    let response = http_get_with_host(gw.proxy_port, "/hello", "demo.example.net").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("path=/hello"));
    // The Host header is substituted with the backend authority; the
    // original travels in X-Forwarded-Host
    assert!(response.contains(&format!("host=127.0.0.1:{}", backend_port)));
    assert!(response.contains("xfh=demo.example.net"));
    assert!(response.contains("xff=127.0.0.1"));
}

#[tokio::test]
async fn test_unknown_host_gets_404() {
    let backend_port = spawn_echo_backend().await;
    let gw = spawn_gateway(backend_port, Duration::from_secs(30)).await;

    gw.table.add("demo", "127.0.0.1", backend_port).unwrap();

    let response = http_get_with_host(gw.proxy_port, "/", "other.example.net").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
    assert!(response.contains("X-Proxy-Error: UNKNOWN_HOST") || response.contains("x-proxy-error: UNKNOWN_HOST"));
}

#[tokio::test]
async fn test_host_matching_is_case_insensitive() {
    let backend_port = spawn_echo_backend().await;
    let gw = spawn_gateway(backend_port, Duration::from_secs(30)).await;

    gw.table.add("Demo", "127.0.0.1", backend_port).unwrap();

    let response = http_get_with_host(gw.proxy_port, "/", "DEMO.example.net").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
}

#[tokio::test]
async fn test_wildcard_subdomain_routing() {
    let backend_port = spawn_echo_backend().await;
    let gw = spawn_gateway(backend_port, Duration::from_secs(30)).await;

    gw.table.add("pr-*", "127.0.0.1", backend_port).unwrap();

    let response = http_get_with_host(gw.proxy_port, "/", "pr-123.example.net").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    let response = http_get_with_host(gw.proxy_port, "/", "staging.example.net").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
}

#[tokio::test]
async fn test_expired_lease_returns_404_until_readd() {
    let backend_port = spawn_echo_backend().await;
    let gw = spawn_gateway(backend_port, Duration::from_millis(100)).await;

    gw.table.add("demo", "127.0.0.1", backend_port).unwrap();
    let response = http_get_with_host(gw.proxy_port, "/", "demo.example.net").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let response = http_get_with_host(gw.proxy_port, "/", "demo.example.net").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
    // The subdomain entry itself survives lease expiry
    assert!(gw.table.exists("demo"));

    gw.table.add("demo", "127.0.0.1", backend_port).unwrap();
    let response = http_get_with_host(gw.proxy_port, "/", "demo.example.net").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
}

#[tokio::test]
async fn test_unreachable_backend_returns_502() {
    // Reserve a port and release it so nothing is listening there
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = unused.local_addr().unwrap().port();
    drop(unused);

    let gw = spawn_gateway(dead_port, Duration::from_secs(30)).await;
    gw.table.add("demo", "127.0.0.1", dead_port).unwrap();

    let response = http_get_with_host(gw.proxy_port, "/", "demo.example.net").await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
}

#[tokio::test]
async fn test_control_actions_through_api() {
    let backend_port = spawn_echo_backend().await;
    let gw = spawn_gateway(backend_port, Duration::from_secs(30)).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (action_tx, action_rx) = mpsc::channel(8);
    tokio::spawn(control::run(
        Arc::clone(&gw.table),
        action_rx,
        shutdown_rx.clone(),
    ));

    let api_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let api = ApiServer::bind(
        api_addr,
        Arc::clone(&gw.table),
        action_tx,
        shutdown_rx,
        "sekrit".to_string(),
    )
    .await
    .unwrap();
    let api_port = api.local_addr().unwrap().port();
    tokio::spawn(api.run());

    // Unauthorized writes are rejected
    let response = http_request(
        api_port,
        "POST",
        "/routes",
        None,
        Some(r#"{"kind":"Add","subdomain":"demo","ip_address":"127.0.0.1","port":1}"#),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 401"), "got: {}", response);

    // Add through the control plane
    let add = format!(
        r#"{{"kind":"Add","subdomain":"demo","ip_address":"127.0.0.1","port":{}}}"#,
        backend_port
    );
    let response = http_request(api_port, "POST", "/routes", Some("sekrit"), Some(&add)).await;
    assert!(response.starts_with("HTTP/1.1 202"), "got: {}", response);

    // The action is applied asynchronously; poll until routable
    let mut routed = false;
    for _ in 0..50 {
        if gw.table.lookup("demo", gw.proxy_port).is_some() {
            routed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(routed, "add action was not applied");

    let response = http_get_with_host(gw.proxy_port, "/", "demo.example.net").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    // Introspection sees it
    let response = http_request(api_port, "GET", "/subdomains", Some("sekrit"), None).await;
    assert!(response.contains("\"demo\""), "got: {}", response);

    let response = http_request(api_port, "GET", "/subdomains/demo", Some("sekrit"), None).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("\"exists\":true"));

    // Remove through the control plane
    let response = http_request(
        api_port,
        "POST",
        "/routes",
        Some("sekrit"),
        Some(r#"{"kind":"Remove","subdomain":"demo"}"#),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 202"), "got: {}", response);

    let mut removed = false;
    for _ in 0..50 {
        if !gw.table.exists("demo") {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(removed, "remove action was not applied");

    let response = http_get_with_host(gw.proxy_port, "/", "demo.example.net").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);

    let response = http_request(api_port, "GET", "/subdomains/demo", Some("sekrit"), None).await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);

    // Malformed action bodies are rejected with 400
    let response = http_request(
        api_port,
        "POST",
        "/routes",
        Some("sekrit"),
        Some("{not json"),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_api_health_and_version() {
    let table = Arc::new(RoutingTable::new(vec![PortMap { listen: 80, target: 5000 }]));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (action_tx, _action_rx) = mpsc::channel(1);

    let api = ApiServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        table,
        action_tx,
        shutdown_rx,
        "sekrit".to_string(),
    )
    .await
    .unwrap();
    let api_port = api.local_addr().unwrap().port();
    tokio::spawn(api.run());

    let response = http_request(api_port, "GET", "/health", None, None).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    let response = http_request(api_port, "GET", "/version", None, None).await;
    assert!(response.contains("subgate"), "got: {}", response);

    // Introspection requires auth
    let response = http_request(api_port, "GET", "/subdomains", None, None).await;
    assert!(response.starts_with("HTTP/1.1 401"), "got: {}", response);
}
