//! HTTP client side of the forwarder
//!
//! One client per supervisor, bound to the single backend's internal port.
//! Proxied requests go through a pooled connection so they do not pay a
//! fresh TCP handshake each; readiness probes use a separate client so
//! probe traffic never competes with real requests for pooled connections.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Idle connections kept to the backend
const MAX_IDLE_CONNECTIONS: usize = 10;
/// How long an idle backend connection is kept around
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Failure talking to the backend over HTTP
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("backend request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("could not rebuild request for the backend: {0}")]
    Rebuild(#[from] hyper::http::Error),
}

/// HTTP client for the supervised backend's internal port
pub struct BackendClient {
    port: u16,
    forward_client: Client<HttpConnector, Incoming>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl BackendClient {
    pub fn new(port: u16) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let forward_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build(connector.clone());

        // Probes are serial, one idle connection is enough
        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build(connector);

        Self {
            port,
            forward_client,
            probe_client,
        }
    }

    /// The backend's internal port this client targets
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Forward a proxied request, retargeting it at the backend port with
    /// the original path and query intact.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ClientError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", self.port, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let backend_req = builder.body(body)?;

        let response = self.forward_client.request(backend_req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// One readiness probe: GET `path` on the backend, true on a 2xx answer
    pub async fn probe(&self, path: &str) -> bool {
        let uri = format!("http://127.0.0.1:{}{}", self.port, path);

        let req = match Request::builder()
            .method("GET")
            .uri(uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(_) => return false,
        };

        match self.probe_client.request(req).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
