//! Remediation Service
//!
//! claim idempotency key -> pre-simulate -> store result.
//! A simulation that predicts failure is stored like any other result.
//! A backend outage releases the claim so the same key can be retried.

use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

use crate::core::idempotency::{Claim, IdempotencyManager};
use crate::core::simulator::PreSimulator;
use crate::models::{AppError, AppResult, RemediationCandidate, RemediationOutcome};
use crate::utils::constants::is_chain_supported;
use crate::utils::telemetry::ScanTelemetry;

#[derive(Clone)]
pub struct RemediationService {
    idempotency: IdempotencyManager,
    simulator: Arc<PreSimulator>,
    telemetry: Arc<ScanTelemetry>,
}

impl RemediationService {
    pub fn new(
        idempotency: IdempotencyManager,
        simulator: Arc<PreSimulator>,
        telemetry: Arc<ScanTelemetry>,
    ) -> Self {
        Self {
            idempotency,
            simulator,
            telemetry,
        }
    }

    pub async fn submit(&self, candidate: RemediationCandidate) -> AppResult<RemediationOutcome> {
        let span = info_span!(
            "remediation",
            idempotency_key = %candidate.idempotency_key,
            subject = %candidate.subject_address,
            chain_id = candidate.chain_id
        );
        self.submit_inner(candidate).instrument(span).await
    }

    async fn submit_inner(&self, candidate: RemediationCandidate) -> AppResult<RemediationOutcome> {
        if candidate.idempotency_key.trim().is_empty() {
            return Err(AppError::bad_request("idempotencyKey must not be empty"));
        }
        if !is_chain_supported(candidate.chain_id) {
            return Err(AppError::unsupported_chain(candidate.chain_id));
        }

        let token = match self
            .idempotency
            .claim(&candidate.idempotency_key, &candidate.fingerprint())
            .await?
        {
            Claim::Existing(result) => {
                self.telemetry.record_idempotent_replay();
                info!("♻️ Duplicate submission, returning stored result");
                return Ok(RemediationOutcome {
                    result,
                    idempotency_key: candidate.idempotency_key,
                    from_cache: true,
                });
            }
            Claim::First(token) => token,
        };

        let result = match self.simulator.simulate(&candidate).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(release_err) = self.idempotency.release(&token).await {
                    error!("Failed to release claim after simulation error: {}", release_err);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.idempotency.complete(&token, &result).await {
            // without a stored result a retry would simulate again
            if let Err(release_err) = self.idempotency.release(&token).await {
                error!("Failed to release claim: {}", release_err);
            }
            return Err(e);
        }

        Ok(RemediationOutcome {
            result,
            idempotency_key: candidate.idempotency_key,
            from_cache: false,
        })
    }
}
