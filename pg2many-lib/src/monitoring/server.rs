//! HTTP server exposing Prometheus metrics and a health check
//!
//! Endpoints:
//! - `GET /metrics` - metrics in Prometheus text format
//! - `GET /health` - liveness check

use crate::error::{CdcError, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{body::Incoming, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{error, info};

/// HTTP server for the telemetry endpoint
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Serve until the task is dropped. Binding failures are returned;
    /// per-connection errors are logged and do not stop the server.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| CdcError::generic(format!("failed to bind {}: {}", self.addr, e)))?;

        info!("Telemetry server listening on http://{}", self.addr);

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| CdcError::generic(format!("accept failed: {}", e)))?;
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service_fn(handle_request))
                    .await
                {
                    if !err.is_incomplete_message() {
                        error!("Error serving telemetry connection: {:?}", err);
                    }
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/metrics") => match super::metrics::gather_metrics() {
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
        (&hyper::Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(r#"{"status":"healthy"}"#)))
            .unwrap()),

        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap()),
    }
}

/// Parse a listen address of the form `host:port` or `:port` (all
/// interfaces)
pub fn parse_metrics_addr(address: &str) -> Result<SocketAddr> {
    let full = if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        address.to_string()
    };

    full.parse::<SocketAddr>().or_else(|_| {
        // host:port where host is a name; only "localhost" is meaningful
        // for a bind address
        let (host, port) = full
            .rsplit_once(':')
            .ok_or_else(|| CdcError::config(format!("invalid telemetry address '{}'", address)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| CdcError::config(format!("invalid telemetry address '{}'", address)))?;
        let ip = match host {
            "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            _ => {
                return Err(CdcError::config(format!(
                    "invalid telemetry address '{}'",
                    address
                )))
            }
        };
        Ok(SocketAddr::new(ip, port))
    })
}
