//! `GET /-/health` endpoint handler.
//!
//! Returns a [`HealthResponse`] JSON payload containing the server
//! version, uptime, config metadata and cumulative request statistics.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::server::AppState;

/// Lives under `/-/` so it cannot shadow an upstream path.
pub const HEALTH_PATH: &str = "/-/health";

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub config: ConfigHealth,
    pub stats: StatsResponse,
}

#[derive(Serialize, Deserialize)]
pub struct ConfigHealth {
    pub source: String,
    pub version: String,
    pub loaded_ago_seconds: u64,
    pub upstream: String,
    pub routes: usize,
    pub upload_routes: usize,
}

#[derive(Serialize, Deserialize)]
pub struct StatsResponse {
    pub requests_forwarded: u64,
    pub requests_failed: u64,
    pub client_aborts: u64,
    pub uploads_forwarded: u64,
    pub uploads_rejected: u64,
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let loaded = &state.config;
    let gateway = state.gateway.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: loaded.config.version_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        config: ConfigHealth {
            source: loaded.source_name.clone(),
            version: loaded.version.short().to_string(),
            loaded_ago_seconds: loaded.loaded_at.elapsed().as_secs(),
            upstream: state.gateway.upstream().to_string(),
            routes: loaded.config.routes.len(),
            upload_routes: loaded.config.upload_routes(),
        },
        stats: StatsResponse {
            requests_forwarded: gateway.forwarded.load(Ordering::Relaxed),
            requests_failed: gateway.failed.load(Ordering::Relaxed),
            client_aborts: gateway.client_aborted.load(Ordering::Relaxed),
            uploads_forwarded: state.stats.uploads_forwarded.load(Ordering::Relaxed),
            uploads_rejected: state.stats.uploads_rejected.load(Ordering::Relaxed),
        },
    })
}
