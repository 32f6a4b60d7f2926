// Health, readiness and leadership introspection over HTTP

use std::fmt::Write as _;
use std::net::SocketAddr;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gate::{LeadershipInfo, LeadershipStatus};
use crate::Result;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Routes for liveness and readiness probes plus leadership introspection.
///
/// - `GET /healthz` - always `ok`
/// - `GET /ready`   - `ready` only while this instance admits requests
/// - `GET /leader`  - [`LeadershipInfo`] as JSON
/// - `GET /metrics` - Prometheus text format
pub fn health_router(status: LeadershipStatus) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ready", get(ready))
        .route("/leader", get(leader))
        .route("/metrics", get(metrics))
        .with_state(status)
}

async fn healthz() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], "ok")
}

async fn ready(State(status): State<LeadershipStatus>) -> Response {
    if status.admit() {
        return (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_PLAIN)], "ready".to_string()).into_response();
    }

    let body = match status.current_leader() {
        Some(leader) => format!("not leader (current leader: {leader})"),
        None => "not leader (no leader elected)".to_string(),
    };
    (StatusCode::SERVICE_UNAVAILABLE, [(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

async fn leader(State(status): State<LeadershipStatus>) -> Json<LeadershipInfo> {
    Json(status.info())
}

async fn metrics(State(status): State<LeadershipStatus>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], render_metrics(&status.info()))
}

fn render_metrics(info: &LeadershipInfo) -> String {
    let series = [
        ("kms_is_leader", "gauge", "Whether this instance is the leader", u64::from(info.is_leader)),
        (
            "kms_leadership_changes_total",
            "counter",
            "Total number of leadership changes",
            info.leadership_changes,
        ),
        (
            "kms_lease_acquisition_errors_total",
            "counter",
            "Failed lease rounds while leading",
            info.acquisition_errors,
        ),
        (
            "kms_lease_renewal_errors_total",
            "counter",
            "Failed lease rounds while following",
            info.renewal_errors,
        ),
    ];

    let mut out = String::new();
    for (name, kind, help, value) in series {
        // Writing to a String cannot fail.
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
        let _ = writeln!(out, "{name} {value}");
    }
    out
}

/// HTTP server for the probe endpoints
#[derive(Debug)]
pub struct HealthServer {
    listener: TcpListener,
    router: Router,
}

impl HealthServer {
    pub async fn bind(addr: SocketAddr, status: LeadershipStatus) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: health_router(status),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled, then drain in-flight requests
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(address = %self.local_addr()?, "Starting health server");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Health server stopped");
        Ok(())
    }
}
