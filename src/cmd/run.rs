//! `gatehouse run`: start the proxy server.
//!
//! Loads the configuration and the signing secret, wires the gateway and
//! upload services, and serves until SIGTERM / Ctrl+C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::cli::RunArgs;
use crate::config;
use crate::error::GatehouseError;
use crate::logging;
use crate::proxy::HyperTransport;
use crate::server::{self, AppState, LoadedConfig};

pub async fn execute(args: RunArgs) -> Result<(), GatehouseError> {
    let log_format = logging::resolve_format(args.pretty, args.json);
    logging::init(&args.log_level, log_format);

    let path = config::resolve_config_path(args.config.as_deref()).await?;
    let (config, version) = config::load_file(&path).await?;

    let secret_path = args.secret_file.clone().or_else(|| config.secret_file.clone());
    let secret = config::load_secret(secret_path.as_deref()).await?;

    let loaded = LoadedConfig {
        config: Arc::new(config),
        version,
        source_name: path.display().to_string(),
        loaded_at: Instant::now(),
    };
    let routes = loaded.config.routes.len();
    let upload_routes = loaded.config.upload_routes();
    let storage_dir = loaded.config.uploads.storage_dir.clone();

    let state = Arc::new(AppState::from_config(
        loaded,
        &secret,
        Arc::new(HyperTransport::new()),
    )?);
    let upstream = state.gateway.upstream().to_string();

    let router = server::build_router(state, args.max_body);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(
        addr = %addr,
        upstream = %upstream,
        routes,
        upload_routes,
        storage_dir = %storage_dir.display(),
        "gatehouse started"
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(server::shutdown_signal())
    .await?;

    tracing::info!("gatehouse stopped");
    Ok(())
}
