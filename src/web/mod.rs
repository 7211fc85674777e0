//! # Web things
//!
//! axum carries the DoH endpoint and the health snapshot; everything else
//! the admin surface needs lives outside this process.

use crate::config::ConfigFile;
use crate::error::HoldfastError;
use crate::pipeline::QueryPipeline;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use concread::cowcell::asynch::CowCellReadTxn;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod doh;

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<QueryPipeline>,
}

/// `/health`: uptime, query volume, error rate, QPS.
async fn health(State(state): State<ApiState>) -> Json<crate::metrics::HealthSnapshot> {
    Json(state.pipeline.metrics.snapshot(Utc::now().timestamp() as u64))
}

pub async fn build(
    pipeline: Arc<QueryPipeline>,
    config: CowCellReadTxn<ConfigFile>,
) -> Result<JoinHandle<Result<(), std::io::Error>>, HoldfastError> {
    let state = ApiState { pipeline };

    let router = Router::new()
        .nest("/dns-query", doh::new())
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let tls_config = RustlsConfig::from_pem_file(&config.tls_cert, &config.tls_key)
        .await
        .map_err(|e| {
            HoldfastError::StartupError(format!("failed to load API TLS identity: {e}"))
        })?;

    let addr = config.api_listener_address()?;
    let res: JoinHandle<Result<(), std::io::Error>> = tokio::spawn(
        axum_server::bind_rustls(addr, tls_config)
            .serve(router.into_make_service_with_connect_info::<SocketAddr>()),
    );
    info!(
        "Started web server on https://{} (DoH at /dns-query)",
        addr
    );
    Ok(res)
}
