//! Claim-once manager for remediation requests
//!
//! The first caller to present a key wins it with SET NX + TTL and simulates.
//! Everyone else polls the claim until the winner stores its result, then
//! returns that result unchanged. A released claim (backend outage) can be
//! claimed again straight away.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::{AppError, AppResult, ErrorCode, GuardianConfig, SimulationResult};
use crate::providers::KvStore;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ClaimRecord {
    Pending {
        fingerprint: String,
        owner: String,
        claimed_at: DateTime<Utc>,
    },
    Done {
        fingerprint: String,
        result: SimulationResult,
    },
}

impl ClaimRecord {
    fn fingerprint(&self) -> &str {
        match self {
            ClaimRecord::Pending { fingerprint, .. } | ClaimRecord::Done { fingerprint, .. } => {
                fingerprint
            }
        }
    }
}

/// Proof of a won claim; needed to complete or release it
#[derive(Debug, Clone)]
pub struct ClaimToken {
    pub idempotency_key: String,
    storage_key: String,
    fingerprint: String,
    /// Serialized pending record, compared on release
    pending: String,
}

#[derive(Debug, Clone)]
pub enum Claim {
    /// Caller owns the key and must simulate
    First(ClaimToken),
    /// Result stored by the first claimant
    Existing(SimulationResult),
}

#[derive(Clone)]
pub struct IdempotencyManager {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    wait: Duration,
}

impl IdempotencyManager {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration, wait: Duration) -> Self {
        Self { kv, ttl, wait }
    }

    pub fn from_config(kv: Arc<dyn KvStore>, config: &GuardianConfig) -> Self {
        Self::new(kv, config.idempotency_ttl, config.idempotency_wait)
    }

    fn storage_key(key: &str) -> String {
        format!("guardian:idem:{}", key)
    }

    /// Claim `key` for an action identified by `fingerprint`
    pub async fn claim(&self, key: &str, fingerprint: &str) -> AppResult<Claim> {
        let storage_key = Self::storage_key(key);
        let started = Instant::now();

        loop {
            let pending = serde_json::to_string(&ClaimRecord::Pending {
                fingerprint: fingerprint.to_string(),
                owner: uuid::Uuid::new_v4().to_string(),
                claimed_at: Utc::now(),
            })?;

            if self
                .kv
                .set_nx(&storage_key, &pending, self.ttl)
                .await
                .map_err(store_error)?
            {
                info!(idempotency_key = key, "🔒 Claimed");
                return Ok(Claim::First(ClaimToken {
                    idempotency_key: key.to_string(),
                    storage_key,
                    fingerprint: fingerprint.to_string(),
                    pending,
                }));
            }

            // lost the race; wait for the owner's result
            loop {
                let Some(raw) = self.kv.get(&storage_key).await.map_err(store_error)? else {
                    debug!(idempotency_key = key, "Claim released, retrying");
                    break;
                };
                let record: ClaimRecord = serde_json::from_str(&raw)?;
                if record.fingerprint() != fingerprint {
                    return Err(AppError::new(
                        ErrorCode::IdempotencyConflict,
                        format!(
                            "Idempotency key {} was already used for a different action",
                            key
                        ),
                    ));
                }
                if let ClaimRecord::Done { result, .. } = record {
                    debug!(idempotency_key = key, "♻️ Returning stored result");
                    return Ok(Claim::Existing(result));
                }
                if started.elapsed() >= self.wait {
                    warn!(idempotency_key = key, "⏳ Claim still in progress");
                    return Err(AppError::new(
                        ErrorCode::ClaimInProgress,
                        format!("Idempotency key {} is still being processed", key),
                    ));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    /// Store the result for the rest of the key's validity window
    pub async fn complete(&self, token: &ClaimToken, result: &SimulationResult) -> AppResult<()> {
        let done = serde_json::to_string(&ClaimRecord::Done {
            fingerprint: token.fingerprint.clone(),
            result: result.clone(),
        })?;
        self.kv
            .set(&token.storage_key, &done, Some(self.ttl))
            .await
            .map_err(store_error)
    }

    /// Give the key back, only if it still holds our pending record
    pub async fn release(&self, token: &ClaimToken) -> AppResult<()> {
        let released = self
            .kv
            .delete_if_eq(&token.storage_key, &token.pending)
            .await
            .map_err(store_error)?;
        if released {
            info!(idempotency_key = %token.idempotency_key, "🔓 Claim released");
        }
        Ok(())
    }
}

fn store_error(e: AppError) -> AppError {
    AppError::with_source(ErrorCode::StoreUnavailable, "Idempotency store unreachable", e)
}
