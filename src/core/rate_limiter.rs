//! Admission control: one token bucket per caller IP and one per user
//!
//! Buckets live in the shared KV store so limits hold across instances.
//! The IP bucket is checked first; a request rejected by the user bucket has
//! still spent an IP token.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{AppError, AppResult, ErrorCode, GuardianConfig};
use crate::providers::KvStore;

/// Idle buckets expire after this long; a full refill takes one minute
const BUCKET_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Ip,
    User,
}

impl BucketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Ip => "ip",
            BucketKind::User => "user",
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed,
    Rejected {
        bucket: BucketKind,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Rejection as an error carrying the bucket and retry hint
    pub fn into_result(self) -> AppResult<()> {
        match self {
            Admission::Allowed => Ok(()),
            Admission::Rejected {
                bucket,
                retry_after,
            } => Err(AppError::rate_limited(
                bucket.as_str(),
                retry_after_secs(retry_after),
            )),
        }
    }
}

/// Whole seconds for a Retry-After header, at least 1
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_millis().div_ceil(1000).max(1) as u64
}

/// Bucket parameters: capacity per minute, refilled continuously
#[derive(Debug, Clone, Copy)]
pub struct BucketLimit {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl BucketLimit {
    pub fn per_minute(requests: u32) -> Self {
        let capacity = requests as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    ip: BucketLimit,
    user: BucketLimit,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, ip: BucketLimit, user: BucketLimit) -> Self {
        Self { kv, ip, user }
    }

    pub fn from_config(kv: Arc<dyn KvStore>, config: &GuardianConfig) -> Self {
        Self::new(
            kv,
            BucketLimit::per_minute(config.rate_limit_ip_per_min),
            BucketLimit::per_minute(config.rate_limit_user_per_min),
        )
    }

    fn key(kind: BucketKind, id: &str) -> String {
        format!("guardian:rl:{}:{}", kind.as_str(), id.to_lowercase())
    }

    /// Single-bucket check
    pub async fn allow(&self, kind: BucketKind, id: &str) -> AppResult<Admission> {
        let limit = match kind {
            BucketKind::Ip => self.ip,
            BucketKind::User => self.user,
        };
        let decision = self
            .kv
            .take_token(&Self::key(kind, id), limit.capacity, limit.refill_per_sec, BUCKET_TTL)
            .await
            .map_err(|e| {
                AppError::with_source(
                    ErrorCode::StoreUnavailable,
                    "Rate limit store unreachable",
                    e,
                )
            })?;

        if decision.allowed {
            debug!(
                bucket = kind.as_str(),
                remaining = decision.remaining,
                "🎟️ Token taken"
            );
            Ok(Admission::Allowed)
        } else {
            warn!(
                bucket = kind.as_str(),
                retry_after_ms = decision.retry_after_ms,
                "🚦 Rate limited"
            );
            Ok(Admission::Rejected {
                bucket: kind,
                retry_after: Duration::from_millis(decision.retry_after_ms),
            })
        }
    }

    /// Check the IP bucket, then the user bucket when the caller is identified
    pub async fn admit(&self, ip: &str, user: Option<&str>) -> AppResult<Admission> {
        let by_ip = self.allow(BucketKind::Ip, ip).await?;
        if !by_ip.is_allowed() {
            return Ok(by_ip);
        }
        match user {
            Some(user) => self.allow(BucketKind::User, user).await,
            None => Ok(Admission::Allowed),
        }
    }
}
