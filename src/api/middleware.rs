//! API Middleware (Request ID, Admission, Logging)

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handlers::{failure, AppState};
use crate::core::rate_limiter::{retry_after_secs, Admission};
use crate::models::AppError;
use crate::providers::MemoryKvStore;
use crate::utils::cache::EvidenceCache;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Caller-supplied id, echoed back and logged but never used as the request id
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Request id generated once per request, threaded into logs and scan records
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Caller-sent `X-Request-Id` (or `X-Correlation-Id`), if sane
fn correlation_id_from(headers: &HeaderMap) -> Option<String> {
    [REQUEST_ID_HEADER, CORRELATION_ID_HEADER]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|id| !id.is_empty() && id.len() <= 128)
        .map(str::to_string)
}

/// Mint a fresh request id, echo it on the response.
/// A caller-sent id only travels along as the correlation id.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let correlation_id = correlation_id_from(request.headers());
    if let Some(correlation_id) = &correlation_id {
        debug!(request_id = %request_id, correlation_id = %correlation_id, "🔗 Caller correlation id");
    }
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    if let Some(value) = correlation_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

// ============================================
// Caller identity
// ============================================
//
// Forwarding headers and `X-User-Id` are only believed when the socket peer is a
// configured trusted proxy (`TRUSTED_PROXIES`). That gateway is expected to
// authenticate the user and overwrite `X-User-Id`.

fn is_trusted(peer: Option<SocketAddr>, trusted: &[IpAddr]) -> bool {
    peer.is_some_and(|addr| trusted.contains(&addr.ip()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// User bucket key: gateway-set `X-User-Id` from a trusted peer, else API key
pub fn caller_user(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted: &[IpAddr],
) -> Option<String> {
    is_trusted(peer, trusted)
        .then(|| header_str(headers, "x-user-id"))
        .flatten()
        .or_else(|| header_str(headers, "x-api-key"))
        .map(str::to_string)
}

/// IP bucket key. The socket address, unless the peer is a trusted proxy: then the
/// nearest untrusted `X-Forwarded-For` hop, else `X-Real-IP`.
pub fn caller_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted: &[IpAddr]) -> String {
    let peer_ip = peer.map(|addr| addr.ip().to_string());
    if !is_trusted(peer, trusted) {
        return peer_ip.unwrap_or_else(|| "unknown".to_string());
    }

    let hops: Vec<&str> = header_str(headers, "x-forwarded-for")
        .map(|v| v.split(',').map(str::trim).filter(|h| !h.is_empty()).collect())
        .unwrap_or_default();
    let forwarded = hops
        .iter()
        .rev()
        .find(|hop| {
            hop.parse::<IpAddr>()
                .map_or(true, |ip| !trusted.contains(&ip))
        })
        .or_else(|| hops.first())
        .copied();

    forwarded
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
        .or(peer_ip)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Token-bucket admission for scan and remediation routes.
/// Rejected requests never reach the handler.
pub async fn admission_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ip = caller_ip(request.headers(), peer, &state.trusted_proxies);
    let user = caller_user(request.headers(), peer, &state.trusted_proxies);

    match state.rate_limiter.admit(&ip, user.as_deref()).await {
        Ok(Admission::Allowed) => next.run(request).await,
        Ok(rejected @ Admission::Rejected { retry_after, .. }) => {
            state.telemetry.record_rate_limited();
            let secs = retry_after_secs(retry_after);
            let err = match rejected.into_result() {
                Err(e) => e,
                Ok(()) => AppError::internal("admission state mismatch"),
            };
            warn!(request_id = %request_id, ip = %ip, "🚦 Request rejected: {}", err.message);

            let (status, mut body) = failure(&err, &request_id, start);
            if let Some(error) = body.0.error.as_mut() {
                error.retry_after_secs = Some(secs);
            }
            let mut response = (status, body).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            response
        }
        Err(e) => {
            warn!(request_id = %request_id, "⚠️ Admission check failed: {}", e);
            failure(&e, &request_id, start).into_response()
        }
    }
}

/// Request logging middleware
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %status.as_u16(),
        latency_ms = %latency.as_millis(),
        "Request completed"
    );

    response
}

/// Periodic evidence cache sweep and expiry purge of the in-process store
pub fn start_maintenance_task(
    cache: EvidenceCache,
    memory_kv: Option<MemoryKvStore>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let swept = cache.sweep();
            let purged = memory_kv.as_ref().map(|kv| kv.purge_expired()).unwrap_or(0);
            if swept > 0 || purged > 0 {
                info!(swept, purged, "🧹 Maintenance pass");
            } else {
                debug!("🧹 Maintenance pass, nothing to drop");
            }
        }
    })
}
