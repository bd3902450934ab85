//! The request-time dispatcher: one proxy server per configured listen port.
//!
//! Each inbound request is routed by the first label of its Host header. The
//! routing table resolves (subdomain, listen port) to a backend target, and
//! the request is forwarded through the shared connection pool.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::routes::RoutingTable;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// A proxy server bound to one listen port
pub struct ProxyServer {
    listener: TcpListener,
    listen_port: u16,
    table: Arc<RoutingTable>,
    pool: Arc<ConnectionPool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind a listener on `addr`. The bound port becomes the listen port
    /// used for routing table lookups.
    pub async fn bind(
        addr: SocketAddr,
        table: Arc<RoutingTable>,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, table, pool, shutdown_rx)?)
    }

    /// Wrap an already-bound listener (useful for tests binding port 0).
    pub fn from_listener(
        listener: TcpListener,
        table: Arc<RoutingTable>,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listen_port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            listen_port,
            table,
            pool,
            shutdown_rx,
        })
    }

    /// The address this server accepts requests on.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            port = self.listen_port,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let listen_port = self.listen_port;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let table = Arc::clone(&self.table);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, listen_port, table, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(port = listen_port, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    listen_port: u16,
    table: Arc<RoutingTable>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let table = Arc::clone(&table);
        let pool = Arc::clone(&pool);
        let client_addr = addr;
        async move { handle_request(req, table, pool, listen_port, client_addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    table: Arc<RoutingTable>,
    pool: Arc<ConnectionPool>,
    listen_port: u16,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // The first label of the Host header is the routing key
    let subdomain = match extract_subdomain(&req) {
        Some(s) => s,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    debug!(
        subdomain,
        port = listen_port,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Incoming request"
    );

    let target = match table.lookup(&subdomain, listen_port) {
        Some(target) => target,
        None => {
            warn!(subdomain, port = listen_port, "No live backend for subdomain");
            return Ok(json_error_response(
                ProxyErrorCode::UnknownHost,
                "Unknown or unconfigured host",
            ));
        }
    };

    // Standard reverse-proxy header adjustments. X-Forwarded-* headers are
    // overwritten rather than appended: this proxy is the first trusted hop.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    // Substitute the Host header with the backend authority; the original
    // stays available in X-Forwarded-Host.
    if let Some(authority) = target.origin().authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(hyper::header::HOST, value);
        }
    }

    match pool.send_request(req, target.origin()).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(
                subdomain,
                address = target.address(),
                error = %e,
                "Failed to forward request to backend"
            );
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
    }
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Extract the first label of the Host header, lowercased.
fn extract_subdomain<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Alphanumeric, hyphen, and dot only; rejects anything that
            // could inject into logs or the backend request line
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            let label = hostname.split('.').next()?;
            if label.is_empty() {
                return None;
            }

            Some(label.to_lowercase())
        })
}
