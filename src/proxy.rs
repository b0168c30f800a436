//! The traffic forwarder
//!
//! Accepts inbound connections on the platform-injected external port and
//! forwards each request to the backend's internal port. The forwarder is
//! live from the moment the supervisor starts: before the backend is ready
//! (and while draining) it answers with an explicit JSON 503 instead of
//! refusing connections, so platform health checks get a meaningful signal.
//!
//! Every accepted connection runs on its own task; a failed or slow session
//! never affects another.

use crate::client::BackendClient;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::lifecycle::SupervisorState;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
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

/// Hop-by-hop headers that must not be forwarded (RFC 7230 section 6.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared per-request context for the forwarder
struct ProxyContext {
    request_timeout: Duration,
    state_rx: watch::Receiver<SupervisorState>,
    client: Arc<BackendClient>,
    in_flight: Arc<AtomicUsize>,
}

/// The supervisor-facing reverse proxy server
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the external port. Failing here is fatal for the caller: a
    /// supervisor that cannot answer on the platform port must not spawn
    /// anything.
    pub async fn bind(
        bind_addr: SocketAddr,
        request_timeout: Duration,
        state_rx: watch::Receiver<SupervisorState>,
        shutdown_rx: watch::Receiver<bool>,
        client: Arc<BackendClient>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(addr = %bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        Ok(Self {
            listener,
            ctx: Arc::new(ProxyContext {
                request_timeout,
                state_rx,
                client,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
            shutdown_rx,
        })
    }

    /// Number of sessions currently being relayed. The lifecycle controller
    /// polls this while draining.
    pub fn in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.ctx.in_flight)
    }

    /// Accept loop. Stops accepting the instant the shutdown signal fires;
    /// requests on already-accepted connections are answered per the
    /// supervisor state they observe.
    pub async fn run(self) {
        let ProxyServer {
            listener,
            ctx,
            mut shutdown_rx,
        } = self;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
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
                        info!("Proxy server stopped accepting connections");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    // auto::Builder supports both HTTP/1.1 (with upgrades) and h2c
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
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Gate on supervisor state before anything touches the backend
    match *ctx.state_rx.borrow() {
        SupervisorState::Serving => {}
        SupervisorState::Draining | SupervisorState::Terminated => {
            return Ok(json_error_response(
                ProxyErrorCode::Draining,
                "Shutting down, no new requests accepted",
            ));
        }
        SupervisorState::Initializing | SupervisorState::AwaitingBackendReady => {
            return Ok(json_error_response(
                ProxyErrorCode::BackendStarting,
                "Backend is starting, please retry",
            ));
        }
    }

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    // Upgrade requests need the Connection/Upgrade headers intact; detect
    // them before hop-by-hop stripping.
    if is_upgrade_request(&req) {
        return handle_upgrade(req, ctx, request_id).await;
    }

    strip_hop_by_hop_headers(req.headers_mut());

    // Proxy headers are overwritten, not appended: this proxy is the first
    // trusted hop and client-supplied values must not survive it.
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

    let _session = SessionGuard::new(Arc::clone(&ctx.in_flight));

    let result = tokio::time::timeout(ctx.request_timeout, ctx.client.forward(req)).await;

    match result {
        Ok(Ok(mut response)) => {
            strip_hop_by_hop_headers(response.headers_mut());
            Ok(response)
        }
        Ok(Err(e)) => {
            // Detailed error stays in the log; the client gets a generic body
            error!(port = ctx.client.port(), request_id, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                port = ctx.client.port(),
                request_id,
                timeout_secs = ctx.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    ctx.request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Tracks one relay session in the shared in-flight counter.
/// Decrements on drop so every exit path is covered.
struct SessionGuard {
    counter: Arc<AtomicUsize>,
}

impl SessionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Remove hop-by-hop headers, including any named by the Connection header
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    // Connection can nominate additional per-hop headers
    let nominated: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_lowercase())
        .collect();

    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Check if a request is a WebSocket/HTTP upgrade request
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

/// Forward bytes bidirectionally between client and backend connections,
/// after replaying any backend bytes that arrived alongside the 101 headers.
/// `copy_bidirectional` applies flow control on both directions, so a slow
/// peer stalls the relay instead of growing a buffer.
async fn forward_bidirectional(
    client: Upgraded,
    backend: TcpStream,
    surplus: Vec<u8>,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    if !surplus.is_empty() {
        debug!(request_id, bytes = surplus.len(), "Replaying early backend bytes");
        if let Err(e) = client_io.write_all(&surplus).await {
            debug!(request_id, error = %e, "Failed to replay early backend bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                request_id,
                client_to_backend, backend_to_client, "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    // Host points at the backend, not the external address
    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Upper bound on the backend's upgrade response header block
const MAX_UPGRADE_RESPONSE: usize = 16 * 1024;

/// Position just past the `\r\n\r\n` header terminator, if present
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse the HTTP response from the backend to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
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

/// Handle a WebSocket/HTTP upgrade request
async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(request_id, upgrade_type, "Handling upgrade request");

    let backend_port = ctx.client.port();
    let raw_request = build_upgrade_request(&req, backend_port);

    let backend_addr = format!("127.0.0.1:{}", backend_port);
    let mut backend_stream = match TcpStream::connect(&backend_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(port = backend_port, error = %e, "Failed to connect to backend for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to backend: {}", e),
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(error = %e, "Failed to send upgrade request to backend");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    // Read until the header terminator; the backend may split its headers
    // across segments or push early frames right behind them.
    let mut response_buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = match backend_stream.read(&mut chunk).await {
            Ok(0) => {
                error!("Backend closed connection before completing the upgrade response");
                return Ok(json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Backend closed connection",
                ));
            }
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Failed to read upgrade response from backend");
                return Ok(json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    format!("Failed to read backend response: {}", e),
                ));
            }
        };
        response_buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_header_end(&response_buf) {
            break end;
        }
        if response_buf.len() > MAX_UPGRADE_RESPONSE {
            error!("Backend upgrade response headers exceed the size limit");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Oversized upgrade response from backend",
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..header_end]) {
        Some(parsed) => parsed,
        None => {
            error!("Failed to parse backend upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from backend",
            ));
        }
    };

    // Bytes the backend sent behind its header block belong to the tunnel
    let surplus = response_buf.split_off(header_end);

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(status = %status, "Backend rejected upgrade request");
        // Return the backend's non-101 response as-is
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

    info!(request_id, upgrade_type, "Upgrade successful");

    // The relay session counts as in-flight for the whole upgrade lifetime
    let session = SessionGuard::new(Arc::clone(&ctx.in_flight));

    // Build the 101 response to send to the client
    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Skip framing headers that hyper handles
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
        // Hold the guard for as long as the relay lives
        let _session = session;
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, backend_stream, surplus, &request_id).await;
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
            }
        }
        debug!(request_id, "Upgraded connection closed");
    });

    Ok(response)
}
