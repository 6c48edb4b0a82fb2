//! API Request Handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use super::middleware::RequestId;
use super::types::*;
use crate::core::idempotency::IdempotencyManager;
use crate::core::orchestrator::{ScanOrchestrator, ScanTimeouts};
use crate::core::probes::{EvidenceResolver, LabelRegistry, ProbeSet};
use crate::core::rate_limiter::RateLimiter;
use crate::core::remediation::RemediationService;
use crate::core::simulator::{
    PreSimulator, RevmSimulationBackend, RpcSimulationBackend, SimulationBackend,
};
use crate::models::{
    AppError, AppResult, ErrorCode, GuardianConfig, RemediationOutcome, SimBackendKind,
};
use crate::providers::{
    AlchemyDataSource, ChainDataSource, KvScanStore, KvStore, MemoryKvStore, RedisKvStore,
    RpcManager, ScanStore,
};
use crate::utils::cache::EvidenceCache;
use crate::utils::constants::{is_chain_supported, APP_VERSION, SUPPORTED_CHAIN_IDS};
use crate::utils::decoder::parse_address;
use crate::utils::telemetry::ScanTelemetry;

/// Shared application state
pub struct AppState {
    pub orchestrator: ScanOrchestrator,
    pub remediation: RemediationService,
    pub rate_limiter: RateLimiter,
    pub store: Arc<dyn ScanStore>,
    pub cache: EvidenceCache,
    pub telemetry: Arc<ScanTelemetry>,
    pub kv: Arc<dyn KvStore>,
    /// Set when running on the in-process store, so maintenance can purge it
    pub memory_kv: Option<MemoryKvStore>,
    pub simulation_backend: &'static str,
    /// Peers allowed to assert the client IP and user id
    pub trusted_proxies: Vec<IpAddr>,
    pub start_time: Instant,
}

impl AppState {
    /// Wire every service over one KV store and one evidence source
    pub fn new(
        config: &GuardianConfig,
        kv: Arc<dyn KvStore>,
        source: Arc<dyn ChainDataSource>,
        labels: Arc<LabelRegistry>,
        backend: Arc<dyn SimulationBackend>,
        telemetry: Arc<ScanTelemetry>,
    ) -> Self {
        let cache = EvidenceCache::new(
            config.evidence_cache_capacity,
            config.evidence_stale_retention,
        );
        let probes = ProbeSet::standard(
            source,
            EvidenceResolver::new(cache.clone(), config.evidence_ttl_secs),
            labels,
        );
        let store: Arc<dyn ScanStore> =
            Arc::new(KvScanStore::new(kv.clone()).with_retention(config.scan_retention));

        let orchestrator = ScanOrchestrator::new(
            probes.clone(),
            store.clone(),
            telemetry.clone(),
            ScanTimeouts::from(config),
        );
        let simulator = Arc::new(PreSimulator::new(
            backend,
            probes,
            cache.clone(),
            telemetry.clone(),
        ));
        let simulation_backend = simulator.backend_name();
        let remediation = RemediationService::new(
            IdempotencyManager::from_config(kv.clone(), config),
            simulator,
            telemetry.clone(),
        );

        Self {
            orchestrator,
            remediation,
            rate_limiter: RateLimiter::from_config(kv.clone(), config),
            store,
            cache,
            telemetry,
            kv,
            memory_kv: None,
            simulation_backend,
            trusted_proxies: config.trusted_proxies.clone(),
            start_time: Instant::now(),
        }
    }

    /// Build live providers from configuration: Redis when `REDIS_URL` is set,
    /// Alchemy/JSON-RPC evidence, and the configured simulation backend
    pub async fn from_config(
        config: &GuardianConfig,
        telemetry: Arc<ScanTelemetry>,
    ) -> AppResult<Self> {
        let mut memory_kv = None;
        let kv: Arc<dyn KvStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisKvStore::connect(url).await?),
            None => {
                warn!("⚠️ REDIS_URL not set; rate limits and idempotency are per-process");
                let memory = MemoryKvStore::new();
                memory_kv = Some(memory.clone());
                Arc::new(memory)
            }
        };

        let rpc = RpcManager::new(&SUPPORTED_CHAIN_IDS, config.retry, Some(telemetry.clone()));
        let source: Arc<dyn ChainDataSource> = Arc::new(AlchemyDataSource::new(
            rpc.clone(),
            config.approval_lookback_blocks,
        ));

        let labels = match &config.labels_path {
            Some(path) => LabelRegistry::load(path)?,
            None => LabelRegistry::default(),
        };

        let backend: Arc<dyn SimulationBackend> = match config.sim_backend {
            SimBackendKind::Rpc => Arc::new(RpcSimulationBackend::new(rpc)),
            SimBackendKind::Revm => Arc::new(RevmSimulationBackend::new(Arc::new(rpc))),
        };

        let mut state = Self::new(config, kv, source, Arc::new(labels), backend, telemetry);
        state.memory_kv = memory_kv;
        Ok(state)
    }
}

fn latency_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Error body with the status mapped from the error code
pub fn failure(
    err: &AppError,
    request_id: &str,
    start: Instant,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let status =
        StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(request_id = %request_id, code = err.code_str(), "❌ {}", err.message);
    }
    (
        status,
        Json(ApiResponse::error(
            ApiError::from(err),
            request_id,
            latency_ms(start),
        )),
    )
}

type HandlerResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<()>>)>;

// ============================================
// Health & Stats
// ============================================

/// Health check endpoint
pub async fn health_check(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
) -> Json<ApiResponse<HealthResponse>> {
    let start = Instant::now();
    let store_reachable = match state.kv.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("⚠️ KV store unreachable: {}", e);
            false
        }
    };

    let response = HealthResponse {
        status: if store_reachable { "healthy" } else { "degraded" }.to_string(),
        version: APP_VERSION.to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        store_backend: state.kv.backend().to_string(),
        store_reachable,
        probes: state
            .orchestrator
            .probes()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        simulation_backend: state.simulation_backend.to_string(),
    };

    Json(ApiResponse::success(response, request_id.0, latency_ms(start)))
}

/// Telemetry counters and evidence cache statistics
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
) -> Json<ApiResponse<StatsResponse>> {
    let start = Instant::now();
    let stats = StatsResponse {
        telemetry: state.telemetry.snapshot(),
        evidence_cache: state.cache.stats(),
    };
    Json(ApiResponse::success(stats, request_id.0, latency_ms(start)))
}

// ============================================
// Scan
// ============================================

/// Start a scan and stream its events as SSE
pub async fn start_scan(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ScanRequest>,
) -> Response {
    let start = Instant::now();

    let subject = match parse_address(&req.subject_address) {
        Ok(subject) => subject,
        Err(e) => return failure(&e, request_id.as_str(), start).into_response(),
    };
    if !is_chain_supported(req.chain_id) {
        let err = AppError::unsupported_chain(req.chain_id);
        return failure(&err, request_id.as_str(), start).into_response();
    }

    let handle = state
        .orchestrator
        .start_scan(subject, req.chain_id, request_id.0.clone());
    info!(
        request_id = %request_id.0,
        session_id = %handle.session_id,
        "🔍 Scan stream opened"
    );

    let events = handle
        .into_stream()
        .map(|event| Event::default().event(event.kind()).json_data(&event));

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Last persisted scan of an address
pub async fn latest_scan(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path((chain_id, address)): Path<(u64, String)>,
) -> HandlerResult<LatestScanResponse> {
    let start = Instant::now();
    let subject =
        parse_address(&address).map_err(|e| failure(&e, request_id.as_str(), start))?;

    match state.store.latest(subject, chain_id).await {
        Ok(Some(record)) => Ok(Json(ApiResponse::success(
            LatestScanResponse { record },
            request_id.0,
            latency_ms(start),
        ))),
        Ok(None) => {
            let err = AppError::not_found(format!(
                "No completed scan for {} on chain {}",
                address, chain_id
            ));
            Err(failure(&err, request_id.as_str(), start))
        }
        Err(e) => Err(failure(&e, request_id.as_str(), start)),
    }
}

// ============================================
// Remediation
// ============================================

/// Claim the idempotency key and pre-simulate the candidate.
/// A duplicate within the key's TTL returns 200 with `fromCache: true`.
pub async fn simulate_remediation(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<RemediationRequest>,
) -> HandlerResult<RemediationOutcome> {
    let start = Instant::now();
    let candidate = req
        .into_candidate()
        .map_err(|e| failure(&e, request_id.as_str(), start))?;

    match state.remediation.submit(candidate).await {
        Ok(outcome) => {
            info!(
                request_id = %request_id.0,
                will_succeed = outcome.result.will_succeed,
                from_cache = outcome.from_cache,
                "🩹 Remediation simulated"
            );
            Ok(Json(ApiResponse::success(
                outcome,
                request_id.0,
                latency_ms(start),
            )))
        }
        Err(e) => {
            if e.code == ErrorCode::SimulationBackendUnavailable {
                warn!(request_id = %request_id.0, "⚠️ Simulation backend unavailable; key left unclaimed");
            }
            Err(failure(&e, request_id.as_str(), start))
        }
    }
}
