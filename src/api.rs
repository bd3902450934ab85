//! Internal HTTP API for control actions and routing table introspection.
//!
//! The provisioning layer POSTs control actions here; status and debug
//! tooling reads the registered subdomains. Write operations require the
//! configured bearer token.

use crate::control::RouteAction;
use crate::routes::RoutingTable;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// API server for control actions and introspection
pub struct ApiServer {
    listener: TcpListener,
    table: Arc<RoutingTable>,
    actions: mpsc::Sender<RouteAction>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl ApiServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        table: Arc<RoutingTable>,
        actions: mpsc::Sender<RouteAction>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            table,
            actions,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        })
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// The address this server accepts requests on.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = self.listener;
        info!(addr = %listener.local_addr()?, "API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let auth_token = Arc::clone(&self.auth_token);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let table = Arc::clone(&self.table);
                            let actions = self.actions.clone();
                            let auth_token = Arc::clone(&auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_api_connection(stream, table, actions, auth_token).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_api_connection<S>(
    stream: S,
    table: Arc<RoutingTable>,
    actions: mpsc::Sender<RouteAction>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let table = Arc::clone(&table);
        let actions = actions.clone();
        let token = Arc::clone(&auth_token);
        async move { handle_api_request(req, table, actions, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_api_request(
    req: Request<hyper::body::Incoming>,
    table: Arc<RoutingTable>,
    actions: mpsc::Sender<RouteAction>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "API request");

    let response = match (&method, path.as_str()) {
        // Health check for the API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // List registered subdomains: GET /subdomains (auth required)
        (&Method::GET, "/subdomains") => {
            if !check_auth(&req, &auth_token) {
                warn!(path, "Unauthorized API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let subdomains = table.subdomains();
                let body = serde_json::json!({
                    "count": subdomains.len(),
                    "subdomains": subdomains,
                });
                json_response(StatusCode::OK, body.to_string())
            }
        }

        // Existence check: GET /subdomains/{name} (auth required)
        (&Method::GET, sub_path) if sub_path.starts_with("/subdomains/") => {
            if !check_auth(&req, &auth_token) {
                warn!(path, "Unauthorized API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let name = sub_path.strip_prefix("/subdomains/").unwrap_or("");
                if name.is_empty() {
                    response(StatusCode::BAD_REQUEST, "missing subdomain")
                } else {
                    let exists = table.exists(name);
                    let status = if exists { StatusCode::OK } else { StatusCode::NOT_FOUND };
                    let body = serde_json::json!({
                        "subdomain": name,
                        "exists": exists,
                    });
                    json_response(status, body.to_string())
                }
            }
        }

        // Queue a control action: POST /routes (auth required)
        (&Method::POST, "/routes") => {
            if !check_auth(&req, &auth_token) {
                warn!(path, "Unauthorized API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let body = req.into_body().collect().await?.to_bytes();
                match serde_json::from_slice::<RouteAction>(&body) {
                    Ok(action) => {
                        info!(
                            kind = ?action.kind,
                            subdomain = %action.subdomain,
                            "Control action received"
                        );
                        if actions.send(action).await.is_err() {
                            error!("Control channel closed, dropping action");
                            response(StatusCode::SERVICE_UNAVAILABLE, "control channel closed")
                        } else {
                            response(StatusCode::ACCEPTED, "accepted")
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Malformed control action");
                        response(StatusCode::BAD_REQUEST, format!("invalid action: {}", e))
                    }
                }
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    fn request_with_auth(auth: Option<&str>) -> Request<Empty<Bytes>> {
        let mut builder = Request::builder().uri("http://127.0.0.1/subdomains");
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(Empty::new()).unwrap()
    }

    #[test]
    fn test_check_auth_bearer() {
        let req = request_with_auth(Some("Bearer sekrit"));
        assert!(check_auth(&req, "sekrit"));
        assert!(!check_auth(&req, "other"));
    }

    #[test]
    fn test_check_auth_raw_token() {
        let req = request_with_auth(Some("sekrit"));
        assert!(check_auth(&req, "sekrit"));
    }

    #[test]
    fn test_check_auth_missing_header() {
        let req = request_with_auth(None);
        assert!(!check_auth(&req, "sekrit"));
    }

    #[test]
    fn test_response_helpers() {
        let r = response(StatusCode::OK, "ok");
        assert_eq!(r.status(), StatusCode::OK);

        let r = json_response(StatusCode::ACCEPTED, "{}");
        assert_eq!(r.status(), StatusCode::ACCEPTED);
        assert_eq!(r.headers().get("content-type").unwrap(), "application/json");
    }
}
