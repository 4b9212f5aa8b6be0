//! The gateway's HTTP front door
//!
//! One listener serves three surfaces: `GET /login` establishes the
//! session and provisions the user's workspace, the catch-all proxies
//! plain HTTP to it, and upgrade requests are relayed as raw byte streams
//! for WebSocket traffic. Requests without a resolvable identity are
//! redirected to `/login`, never proxied.

use crate::error::{json_error_response, redirect_response, GatewayError, GatewayErrorCode};
use crate::lifecycle::LifecycleManager;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::Workspace;
use crate::session::Sessions;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
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

/// The gateway server: listener plus everything a request needs.
pub struct GatewayServer {
    bind_addr: SocketAddr,
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<Sessions>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        lifecycle: Arc<LifecycleManager>,
        sessions: Arc<Sessions>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, lifecycle, sessions, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        lifecycle: Arc<LifecycleManager>,
        sessions: Arc<Sessions>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            lifecycle,
            sessions,
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let lifecycle = Arc::clone(&self.lifecycle);
                            let sessions = Arc::clone(&self.sessions);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, lifecycle, sessions, pool).await {
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
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<Sessions>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let lifecycle = Arc::clone(&lifecycle);
        let sessions = Arc::clone(&sessions);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, lifecycle, sessions, pool, addr).await }
    });

    // HTTP/1.1 connections can carry WebSocket upgrades; HTTP/2 is h2c.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<Sessions>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let user = sessions.resolve_user(&req);

    if req.uri().path() == "/login" {
        return Ok(handle_login(user, &lifecycle, &sessions, &request_id).await);
    }

    let Some(user) = user else {
        debug!(request_id, "No identity on request, redirecting to login");
        return Ok(redirect_response("/login"));
    };

    // Resolve the workspace; provision when the user has none (the
    // request waits through creation and readiness).
    let workspace = match resolve_workspace(&user, &lifecycle).await {
        Ok(workspace) => workspace,
        Err(GatewayError::Draining) => {
            return Ok(json_error_response(
                GatewayErrorCode::Draining,
                "gateway is shutting down",
            ));
        }
        Err(e) => {
            error!(user, request_id, error = %e, "Cannot resolve workspace, redirecting to login");
            return Ok(redirect_response("/login"));
        }
    };

    // Overwrite forwarded headers; this gateway is the first trusted hop.
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

    debug!(user, method = %req.method(), uri = %req.uri(), request_id, "Routing request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, lifecycle, user, workspace, request_id).await;
    }

    match pool
        .send_request(req, &workspace.address, workspace.port)
        .await
    {
        Ok(response) => {
            lifecycle.registry().touch(&user);
            Ok(response)
        }
        Err(e) => {
            // The container stopped answering; drop the stale entry so
            // the next login provisions a fresh one.
            error!(user, port = workspace.port, request_id, error = %e, "Workspace unreachable, evicting");
            lifecycle.evict_stale(&user);
            Ok(redirect_response("/login"))
        }
    }
}

/// `GET /login`: establish the session cookie and make sure a workspace
/// is ready, then send the user to it.
async fn handle_login(
    user: Option<String>,
    lifecycle: &Arc<LifecycleManager>,
    sessions: &Arc<Sessions>,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(user) = user else {
        return json_error_response(
            GatewayErrorCode::IdentityRequired,
            "login requires an authenticated identity",
        );
    };

    info!(user, request_id, "Login request");

    match lifecycle.provision(&user).await {
        Ok(workspace) => {
            debug!(user, container_id = %workspace.container_id, port = workspace.port, "Login resolved workspace");
            let cookie = sessions.issue_cookie(&user);
            let mut response = redirect_response("/");
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response
                    .headers_mut()
                    .insert(hyper::header::SET_COOKIE, value);
            }
            response
        }
        Err(e) => {
            // Retryable failures surface as errors here rather than a
            // redirect back to /login, which would loop.
            warn!(user, request_id, error = %e, "Login provisioning failed");
            json_error_response(e.code(), e.to_string())
        }
    }
}

async fn resolve_workspace(
    user: &str,
    lifecycle: &Arc<LifecycleManager>,
) -> Result<Workspace, GatewayError> {
    if let Some(workspace) = lifecycle.registry().get(user) {
        if workspace.is_routable() {
            return Ok(workspace);
        }
    }
    lifecycle.provision(user).await
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Get the value of the Upgrade header
fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Build the raw HTTP upgrade request to replay against the workspace
fn build_upgrade_request<B>(req: &Request<B>, address: &str, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}:{}\r\n", address, port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the workspace's response to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Forward bytes bidirectionally between the client and the workspace
async fn forward_bidirectional(client: Upgraded, workspace: TcpStream, user: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut workspace_io = workspace;

    match tokio::io::copy_bidirectional(&mut client_io, &mut workspace_io).await {
        Ok((client_to_workspace, workspace_to_client)) => {
            debug!(
                user,
                request_id,
                client_to_workspace,
                workspace_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(user, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Handle a WebSocket upgrade request
async fn handle_upgrade(
    req: Request<Incoming>,
    lifecycle: Arc<LifecycleManager>,
    user: String,
    workspace: Workspace,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(user, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &workspace.address, workspace.port);

    let workspace_addr = format!("{}:{}", workspace.address, workspace.port);
    let mut workspace_stream = match TcpStream::connect(&workspace_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(user, port = workspace.port, error = %e, "Failed to connect to workspace for upgrade");
            lifecycle.evict_stale(&user);
            return Ok(json_error_response(
                GatewayErrorCode::UpstreamUnavailable,
                "workspace is unreachable",
            ));
        }
    };

    if let Err(e) = workspace_stream.write_all(&raw_request).await {
        error!(user, error = %e, "Failed to send upgrade request to workspace");
        return Ok(json_error_response(
            GatewayErrorCode::UpstreamUnavailable,
            "failed to relay upgrade request",
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match workspace_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(user, "Workspace closed connection before answering upgrade");
            return Ok(json_error_response(
                GatewayErrorCode::UpstreamUnavailable,
                "workspace closed connection",
            ));
        }
        Err(e) => {
            error!(user, error = %e, "Failed to read upgrade response from workspace");
            return Ok(json_error_response(
                GatewayErrorCode::UpstreamUnavailable,
                "failed to read workspace response",
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(user, "Failed to parse workspace upgrade response");
            return Ok(json_error_response(
                GatewayErrorCode::UpstreamUnavailable,
                "invalid upgrade response from workspace",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(user, status = %status, "Workspace rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(user, request_id, upgrade_type, "WebSocket upgrade successful");

    // Count the socket against the workspace; closing decrements and
    // restarts the idle clock.
    lifecycle.registry().connection_opened(&user);

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Skip hop-by-hop headers that hyper handles
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(user, request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, workspace_stream, &user, &request_id).await;
            }
            Err(e) => {
                error!(user, error = %e, "Failed to upgrade client connection");
            }
        }
        let remaining = lifecycle.registry().connection_closed(&user);
        debug!(user, request_id, remaining, "WebSocket connection closed");
    });

    Ok(response)
}
