//! Axum server setup, shared application state, and graceful shutdown.
//!
//! Contains [`AppState`] (the `Arc`-shared state holding the gateway,
//! the upload services, the loaded config, stats and uptime),
//! [`AppState::from_config`] which wires the built-in collaborators,
//! [`build_router`] for constructing the Axum router with middleware
//! layers, and [`shutdown_signal`] for SIGTERM / Ctrl+C handling.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use axum::http::Uri;
use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::model::Config;
use crate::config::ConfigVersion;
use crate::error::GatehouseError;
use crate::health::{health_handler, HEALTH_PATH};
use crate::proxy::{self, Gateway, ProxyConfig, RoundTripper};
use crate::upload::authorizer::{StaticAuthorizer, StoragePreparer};
use crate::upload::destination::LocalStorage;
use crate::upload::processor::ProcessorFactory;
use crate::upload::{FileAuthorizer, MultipartRewriter, Preparer, Storage, TrustClaimEncoder};

#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Arc<Config>,
    pub version: ConfigVersion,
    pub source_name: String,
    pub loaded_at: Instant,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub uploads_forwarded: AtomicU64,
    pub uploads_rejected: AtomicU64,
}

/// Everything the upload routes need per request.
pub struct UploadServices {
    pub rewriter: MultipartRewriter,
    pub authorizer: Arc<dyn FileAuthorizer>,
    pub preparer: Arc<dyn Preparer>,
    pub processors: ProcessorFactory,
}

impl UploadServices {
    /// Built-in collaborators: every file is approved up to the configured
    /// size and stored under `uploads.storage_dir`.
    #[must_use]
    pub fn from_config(config: &Config, secret: &[u8]) -> Self {
        let uploads = &config.uploads;
        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(uploads.storage_dir.clone()).with_timeout(uploads.timeout()),
        );
        Self {
            rewriter: MultipartRewriter::new(
                TrustClaimEncoder::new(secret, uploads.claim_ttl()),
                uploads.limits(),
                uploads.timeout(),
            ),
            authorizer: Arc::new(StaticAuthorizer::new(Some(uploads.max_file_size))),
            preparer: Arc::new(StoragePreparer::new(storage, uploads.max_file_size)),
            processors: ProcessorFactory::default(),
        }
    }
}

pub struct AppState {
    pub gateway: Gateway,
    pub uploads: UploadServices,
    pub config: LoadedConfig,
    pub start_time: Instant,
    pub stats: Stats,
}

impl AppState {
    pub fn from_config(
        loaded: LoadedConfig,
        secret: &[u8],
        transport: Arc<dyn RoundTripper>,
    ) -> Result<Self, GatehouseError> {
        let config = &loaded.config;
        let mut proxy_config = ProxyConfig::new(config.version_string(), transport)
            .custom_headers(config.headers.clone())
            .force_target_host_header(config.force_target_host_header)
            .allow_response_buffering(config.allow_response_buffering);
        if let Some(upstream) = &config.upstream {
            let uri: Uri = upstream.parse().map_err(|e| GatehouseError::UriParse {
                source: Box::new(e),
            })?;
            proxy_config = proxy_config.upstream(uri);
        }

        Ok(Self {
            gateway: Gateway::new(proxy_config),
            uploads: UploadServices::from_config(config, secret),
            config: loaded,
            start_time: Instant::now(),
            stats: Stats::default(),
        })
    }
}

pub fn build_router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_handler))
        .fallback(proxy::forward_handler)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body)),
        )
        .with_state(state)
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
