//! HTTP server for Prometheus metrics and health checks
//!
//! # Available Endpoints
//!
//! - `GET /metrics` - Prometheus-formatted metrics
//! - `GET /health` - JSON health report (200 healthy/warning, 503 otherwise)

use crate::monitoring::health::HealthReport;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{body::Incoming, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Configuration for the metrics HTTP server
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub port: u16,
    pub bind_address: [u8; 4],
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: [0, 0, 0, 0],
        }
    }
}

/// Shared handle the supervisor writes the latest health report into
pub type SharedHealth = Arc<RwLock<HealthReport>>;

/// HTTP server exposing `/metrics` and `/health`
pub struct MetricsServer {
    config: MetricsServerConfig,
    health: SharedHealth,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig, health: SharedHealth) -> Self {
        Self { config, health }
    }

    /// Serve until the cancellation token fires.
    ///
    /// Binding failures surface as an error; per-connection failures are
    /// logged and do not stop the server.
    pub async fn start(&self, token: CancellationToken) -> Result<(), String> {
        let addr = SocketAddr::from((self.config.bind_address, self.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| format!("Failed to bind metrics listener on {addr}: {e}"))?;

        info!("Metrics server listening on http://{}", addr);

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => {
                    accepted.map_err(|e| format!("Failed to accept connection: {e}"))?
                }
                _ = token.cancelled() => {
                    info!("Metrics server shutting down");
                    return Ok(());
                }
            };

            let io = TokioIo::new(stream);
            let health = Arc::clone(&self.health);
            tokio::task::spawn(async move {
                let service = service_fn(move |req| handle_request(req, Arc::clone(&health)));
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    if !err.is_incomplete_message() {
                        error!("Error serving connection: {:?}", err);
                    }
                }
            });
        }
    }

    pub fn config(&self) -> &MetricsServerConfig {
        &self.config
    }
}

async fn handle_request(
    req: Request<Incoming>,
    health: SharedHealth,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/metrics") => match crate::monitoring::metrics::gather_metrics() {
            Ok(metrics) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(metrics)))
                .unwrap()),
            Err(err) => {
                error!("Failed to collect metrics: {}", err);
                Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from("Failed to collect metrics")))
                    .unwrap())
            }
        },
        (&hyper::Method::GET, "/health") => {
            let report = health.read().expect("health report poisoned").clone();
            let status =
                StatusCode::from_u16(report.http_status()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
            let body = serde_json::to_string(&report)
                .unwrap_or_else(|_| r#"{"status":"unhealthy"}"#.to_string());
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap()),
    }
}

/// Create a metrics server on the given port with default binding
pub fn create_metrics_server(port: u16, health: SharedHealth) -> MetricsServer {
    let config = MetricsServerConfig {
        port,
        ..Default::default()
    };
    MetricsServer::new(config, health)
}
