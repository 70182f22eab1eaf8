mod bootstrap;
mod browser;
mod dom;
mod http;
mod metrics;
mod models;
mod photos;
mod pipeline;
mod processor;
mod queue;
mod supabase;
mod worker;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use browser::{Browser, BrowserHost};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use photos::PhotoIngestion;
use pipeline::Pipeline;
use queue::JobQueue;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use supabase::SupabaseClient;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use worker::Worker;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target: "talos.worker", "worker crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let supabase = SupabaseClient::from_env()
        .ok_or("SUPABASE_URL and a Supabase service key must be set")?;
    let queue = JobQueue::new(supabase.clone());

    let chrome_endpoint = std::env::var("CHROME_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:9222".to_string());
    let host: Arc<dyn BrowserHost> = Arc::new(Browser::connect(&chrome_endpoint).await?);

    let photos = PhotoIngestion::new(http::build_download_client(), Some(supabase));
    let worker = Worker::new(queue.clone(), Pipeline::new(queue, host, photos));

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker_task = tokio::spawn(worker.run(shutdown_rx));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(OpsState { prometheus_handle })
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target: "talos.worker", "ops server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(target: "talos.worker", "shutdown signal received, finishing current job");
    let _ = shutdown_tx.send(true);
    worker_task.await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[derive(Clone)]
struct OpsState {
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "talos-worker-rs",
    }))
}

/// Prometheus exposition endpoint. Locked behind `METRICS_KEY` when that
/// variable is set; open otherwise.
async fn metrics_endpoint(
    State(state): State<OpsState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
