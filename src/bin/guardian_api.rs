//! Wallet Guardian API Server
//!
//! Usage:
//!   cargo run --bin guardian_api
//!
//! Environment:
//!   PORT / GUARDIAN_PORT - Server port (default: 8080)
//!   GUARDIAN_HOST        - Server host (default: 0.0.0.0)
//!   REDIS_URL            - Shared KV store (in-memory when unset)
//!   SIM_BACKEND          - rpc | revm
//!   LOG_FORMAT           - json for JSON lines
//!   GUARDIAN_TELEMETRY_DIR - Where shutdown stats are written (default: telemetry)
//!   RUST_LOG             - Log level (default: info)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use wallet_guardian::api::{create_router, start_maintenance_task, AppState};
use wallet_guardian::models::GuardianConfig;
use wallet_guardian::utils::ScanTelemetry;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    wallet_guardian::init_tracing();

    let mut config = GuardianConfig::from_env()?;
    // Platform-assigned PORT wins over GUARDIAN_PORT
    if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
        config.port = port;
    }

    let telemetry = Arc::new(ScanTelemetry::new());
    let state = Arc::new(AppState::from_config(&config, telemetry.clone()).await?);

    let maintenance = start_maintenance_task(
        state.cache.clone(),
        state.memory_kv.clone(),
        MAINTENANCE_INTERVAL,
    );
    info!("🧹 Background maintenance task started");

    let app = create_router(state.clone());
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    info!("🛡️ Wallet Guardian API starting on http://{}", addr);
    info!("   KV store: {}", state.kv.backend());
    info!("   Simulation backend: {}", state.simulation_backend);
    info!(
        "   Probe timeout: {:?}, session deadline: {:?}",
        config.probe_timeout,
        config.session_deadline()
    );
    info!("");
    info!("Endpoints:");
    info!("  POST /v1/scan                               - Streamed wallet scan (SSE)");
    info!("  GET  /v1/scan/:chain_id/:address/latest     - Last persisted scan");
    info!("  POST /v1/remediation/simulate               - Idempotent revoke pre-simulation");
    info!("  GET  /v1/stats                              - Telemetry and cache statistics");
    info!("  GET  /v1/health                             - Health check");
    info!("");
    info!("Press Ctrl+C for graceful shutdown");

    let listener = TcpListener::bind(addr).await?;

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("⚠️ Failed to listen for Ctrl+C: {}", e);
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("");
    info!("🛑 Shutdown signal received, cleaning up...");
    maintenance.abort();

    info!("📊 Exporting final telemetry...");
    let stats = telemetry.snapshot();
    info!("   Scans started: {}", stats.scans_started);
    info!("   Scans completed: {}", stats.scans_completed);
    info!("   Rate limited: {}", stats.rate_limited);
    let export_dir = std::env::var("GUARDIAN_TELEMETRY_DIR").unwrap_or_else(|_| "telemetry".to_string());
    match telemetry.export_stats_json(std::path::Path::new(&export_dir)) {
        Ok(path) => info!("   ✅ Stats exported to: {}", path.display()),
        Err(e) => warn!("   ⚠️ Failed to export stats: {}", e),
    }

    info!("👋 Wallet Guardian API shutdown complete");
    Ok(())
}
