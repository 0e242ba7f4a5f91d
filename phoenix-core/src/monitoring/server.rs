//! HTTP status surface
//!
//! - `/metrics`: Prometheus text, refreshed from a fresh status snapshot
//! - `/status`: JSON [`RuntimeStatus`]
//! - `/health`: 200 while the supervisor thread runs, 503 otherwise

use super::metrics::MetricsRegistry;
use crate::engine::runtime::{PhoenixRuntime, RuntimeStatus};
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Source of status snapshots served over HTTP
pub trait StatusSource: Send + Sync {
    fn status(&self) -> RuntimeStatus;

    fn is_live(&self) -> bool;
}

impl StatusSource for PhoenixRuntime {
    fn status(&self) -> RuntimeStatus {
        PhoenixRuntime::status(self)
    }

    fn is_live(&self) -> bool {
        self.is_running()
    }
}

#[derive(Debug, Clone)]
pub struct StatusServerConfig {
    pub listen_addr: SocketAddr,
}

/// HTTP server for metrics and status
pub struct StatusServer {
    config: StatusServerConfig,
    registry: Arc<MetricsRegistry>,
    source: Arc<dyn StatusSource>,
}

impl StatusServer {
    pub fn new(
        config: StatusServerConfig,
        registry: Arc<MetricsRegistry>,
        source: Arc<dyn StatusSource>,
    ) -> Self {
        Self {
            config,
            registry,
            source,
        }
    }

    /// Serve until the task is dropped
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .context("Failed to bind status server")?;

        info!("Status server listening on http://{}", self.config.listen_addr);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let registry = self.registry.clone();
            let source = self.source.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let registry = registry.clone();
                    let source = source.clone();
                    async move { Ok::<_, hyper::Error>(route(req.uri().path(), &registry, source.as_ref())) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

/// Build the response for `path`
pub fn route(path: &str, registry: &MetricsRegistry, source: &dyn StatusSource) -> Response<Full<Bytes>> {
    debug!("Status request: {}", path);

    match path {
        "/health" | "/healthz" => {
            if source.is_live() {
                respond(StatusCode::OK, "text/plain", "OK".to_string())
            } else {
                respond(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "text/plain",
                    "supervisor not running".to_string(),
                )
            }
        }
        "/metrics" => {
            registry.observe(&source.status());
            match encode_metrics(registry) {
                Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        format!("Error: {}", e),
                    )
                }
            }
        }
        "/status" => match serde_json::to_string_pretty(&source.status()) {
            Ok(json) => respond(StatusCode::OK, "application/json", json),
            Err(e) => {
                error!("Failed to encode status: {}", e);
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    format!("Error: {}", e),
                )
            }
        },
        "/" => respond(
            StatusCode::OK,
            "text/plain",
            "Phoenix governance\n\nEndpoints:\n  /metrics - Prometheus metrics\n  /status  - JSON status\n  /health  - Supervisor liveness\n".to_string(),
        ),
        _ => {
            warn!("Unknown status endpoint requested: {}", path);
            respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string())
        }
    }
}

fn respond(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Encode metrics to Prometheus text format
pub fn encode_metrics(registry: &MetricsRegistry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.registry().gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;

    String::from_utf8(buffer).context("Invalid UTF-8 in metrics")
}
