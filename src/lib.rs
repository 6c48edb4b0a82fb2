//! Wallet Guardian Library
//!
//! Wallet risk-scanning engine:
//! - Parallel evidence probes (approvals, counterparty reputation, mixer exposure)
//!   with per-probe timeouts and a TTL evidence cache with stale fallback
//! - Aggregate risk score with an explicit confidence value
//! - Streamed scan events, one terminal event per session
//! - Token-bucket admission control and claim-once remediation requests
//! - Simulate-before-propose approval revocation (RPC or local REVM)

pub mod api;
pub mod core;
pub mod models;
pub mod providers;
pub mod utils;

pub use crate::core::{
    IdempotencyManager, PreSimulator, RateLimiter, RemediationService, ScanHandle,
    ScanOrchestrator, ScanTimeouts,
};
pub use models::{
    AppError, AppResult, ErrorCode, GuardianConfig, RemediationCandidate, RiskContribution,
    ScanEvent, ScanRecord, SimulationResult,
};
pub use providers::{KvStore, MemoryKvStore, RedisKvStore, ScanStore};
pub use utils::{EvidenceCache, ScanTelemetry, TelemetryStats};

/// JSON or compact log output, selected by `LOG_FORMAT`; `RUST_LOG` filters
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .try_init()
    } else {
        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {}", e);
    }
}
