// =============================================================================
// MonitorService — liveness and readiness HTTP surface
// =============================================================================

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::config::Settings;
use crate::services::Shutdown;

pub struct MonitorService {
    settings: Settings,
    shutdown: Shutdown,
}

impl MonitorService {
    pub fn new(settings: Settings, shutdown: Shutdown) -> Self {
        Self { settings, shutdown }
    }

    pub fn router() -> Router {
        Router::new()
            .route("/live", get(live))
            .route("/ready", get(ready))
    }

    pub async fn run(&self) -> Result<()> {
        let prometheus = &self.settings.monitoring.prometheus;
        let addr = format!("{}:{}", prometheus.host, prometheus.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind monitor endpoint on {addr}"))?;
        info!(addr = %addr, "monitor service listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, Self::router())
            .with_graceful_shutdown(async move { shutdown.stopped().await })
            .await
            .context("monitor server failed")?;
        info!("monitor service stopped");
        Ok(())
    }
}

async fn live() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "timestamp": Utc::now().to_rfc3339()}))
}

async fn ready() -> Json<serde_json::Value> {
    Json(json!({"status": "ready"}))
}
