//! Type definitions for the Guardian scan engine
//! All core data structures shared by probes, orchestrator, remediation and API

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================
// EVIDENCE
// ============================================

/// Where a piece of evidence came from (provider, RPC method, request id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub provider: String,
    pub method: String,
    pub request_id: String,
}

/// One observation backing a risk contribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    /// Data provider identifier
    pub source: String,
    pub observed_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    /// Opaque payload the contribution is computed from
    pub raw: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl Evidence {
    pub fn new(source: impl Into<String>, ttl_seconds: u64, raw: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            observed_at: Utc::now(),
            ttl_seconds,
            raw,
            provenance: None,
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Age in seconds at `now` (never negative)
    pub fn age_secs_at(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.observed_at).num_milliseconds().max(0);
        millis as f64 / 1000.0
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.age_secs_at(now) > self.ttl_seconds as f64
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}

// ============================================
// RISK CONTRIBUTION
// ============================================

/// A probe's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskContribution {
    pub probe: String,
    /// 0-100
    pub score: f64,
    pub weight: f64,
    pub reasons: Vec<String>,
    /// Evidence the score was derived from
    pub evidence: Evidence,
    /// Live fetch failed and the probe fell back to expired evidence
    pub from_stale_evidence: bool,
}

// ============================================
// SCAN SESSION
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Partial,
    Complete,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Complete | ScanStatus::Failed)
    }
}

/// Why a probe lowered confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedKind {
    Timeout,
    Error,
    StaleEvidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedProbe {
    pub probe: String,
    pub kind: DegradedKind,
    pub reason: String,
}

/// One in-flight or completed scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSession {
    pub session_id: String,
    pub request_id: String,
    pub subject_address: Address,
    pub chain_id: u64,
    pub requested_at: DateTime<Utc>,
    pub status: ScanStatus,
    pub contributions: BTreeMap<String, RiskContribution>,
    pub degraded: BTreeMap<String, DegradedProbe>,
    pub aggregate_score: Option<f64>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ScanSession {
    pub fn new(subject_address: Address, chain_id: u64, request_id: impl Into<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            subject_address,
            chain_id,
            requested_at: Utc::now(),
            status: ScanStatus::Pending,
            contributions: BTreeMap::new(),
            degraded: BTreeMap::new(),
            aggregate_score: None,
            confidence: 0.0,
            completed_at: None,
            failure_reason: None,
        }
    }

    /// Record a reported contribution. Returns false once the session is terminal.
    pub fn record_contribution(&mut self, contribution: RiskContribution) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if contribution.from_stale_evidence {
            self.degraded.insert(
                contribution.probe.clone(),
                DegradedProbe {
                    probe: contribution.probe.clone(),
                    kind: DegradedKind::StaleEvidence,
                    reason: format!(
                        "{} served from expired evidence observed at {}",
                        contribution.probe, contribution.evidence.observed_at
                    ),
                },
            );
        }
        self.contributions
            .insert(contribution.probe.clone(), contribution);
        self.status = ScanStatus::Partial;
        true
    }

    /// Record a probe that produced no contribution. Returns false once terminal.
    pub fn record_degraded(&mut self, degraded: DegradedProbe) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.degraded.insert(degraded.probe.clone(), degraded);
        self.status = ScanStatus::Partial;
        true
    }

    pub fn complete(&mut self, aggregate_score: f64, confidence: f64) {
        if self.status.is_terminal() {
            return;
        }
        self.aggregate_score = Some(aggregate_score);
        self.confidence = confidence;
        self.status = ScanStatus::Complete;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.aggregate_score = None;
        self.confidence = 0.0;
        self.status = ScanStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn degraded_probes(&self) -> Vec<DegradedProbe> {
        self.degraded.values().cloned().collect()
    }
}

/// Running aggregate carried by every probe event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningAggregate {
    /// None until at least one probe reported
    pub score: Option<f64>,
    pub confidence: f64,
    pub resolved: usize,
    pub total: usize,
}

/// Streamed scan event; exactly one terminal (`complete` or `failed`) per session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ScanEvent {
    ProbeResult {
        probe: String,
        contribution: Option<RiskContribution>,
        degraded: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_reason: Option<String>,
        running_aggregate: RunningAggregate,
        request_id: String,
    },
    Complete {
        session_id: String,
        aggregate_score: f64,
        confidence: f64,
        level: String,
        contributions: Vec<RiskContribution>,
        degraded_probes: Vec<DegradedProbe>,
        request_id: String,
    },
    Failed {
        session_id: String,
        reason: String,
        degraded_probes: Vec<DegradedProbe>,
        request_id: String,
    },
}

impl ScanEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanEvent::ProbeResult { .. })
    }

    /// SSE event name
    pub fn kind(&self) -> &'static str {
        match self {
            ScanEvent::ProbeResult { .. } => "probe_result",
            ScanEvent::Complete { .. } => "complete",
            ScanEvent::Failed { .. } => "failed",
        }
    }
}

/// Persisted result read by downstream consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub subject_address: Address,
    pub chain_id: u64,
    pub aggregate_score: f64,
    pub confidence: f64,
    pub request_id: String,
    pub session_id: String,
    pub scanned_at: DateTime<Utc>,
}

impl ScanRecord {
    /// Only completed sessions produce a record
    pub fn from_session(session: &ScanSession) -> Option<Self> {
        if session.status != ScanStatus::Complete {
            return None;
        }
        Some(Self {
            subject_address: session.subject_address,
            chain_id: session.chain_id,
            aggregate_score: session.aggregate_score?,
            confidence: session.confidence,
            request_id: session.request_id.clone(),
            session_id: session.session_id.clone(),
            scanned_at: session.completed_at.unwrap_or_else(Utc::now),
        })
    }
}

// ============================================
// PROBE PAYLOADS
// ============================================

/// Outstanding ERC-20 allowance granted by the subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub token: Address,
    pub spender: Address,
    /// Decimal string of the current allowance
    pub allowance: String,
    pub unlimited: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalExposure {
    pub approvals: Vec<ApprovalRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedCounterparty {
    pub address: Address,
    pub label: String,
    pub interactions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterpartyExposure {
    pub counterparties: usize,
    pub flagged: Vec<FlaggedCounterparty>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerInteraction {
    pub mixer: Address,
    pub label: String,
    pub direction: FlowDirection,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerExposure {
    pub interactions: Vec<MixerInteraction>,
}

// ============================================
// REMEDIATION
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    RevokeApproval,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::RevokeApproval => "revoke_approval",
        }
    }
}

/// A proposed risk-reducing action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationCandidate {
    pub idempotency_key: String,
    pub subject_address: Address,
    pub action_type: ActionType,
    pub target_contract: Address,
    pub chain_id: u64,
    /// Spender to revoke; resolved from approval evidence when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spender: Option<Address>,
}

impl RemediationCandidate {
    /// Identity of the intended action, independent of the idempotency key
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.chain_id,
            self.action_type.as_str(),
            self.subject_address.to_string().to_lowercase(),
            self.target_contract.to_string().to_lowercase(),
            self.spender
                .map(|s| s.to_string().to_lowercase())
                .unwrap_or_else(|| "*".to_string()),
        )
    }
}

/// Outcome of pre-simulating a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub will_succeed: bool,
    pub estimated_gas: u64,
    /// Predicted reduction of the aggregate score (positive = safer)
    pub score_delta: f64,
    pub simulated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
    /// Number of calls in the simulated batch
    pub calls: usize,
}

/// Remediation response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationOutcome {
    #[serde(flatten)]
    pub result: SimulationResult,
    pub idempotency_key: String,
    pub from_cache: bool,
}

// ============================================
// RATE LIMITING
// ============================================

/// Token bucket for one key
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub tokens: f64,
    pub last_refill_ms: u64,
    pub capacity: f64,
    pub refill_rate_per_second: f64,
}

/// Result of one refill-then-consume step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDecision {
    pub allowed: bool,
    pub remaining: f64,
    pub retry_after_ms: u64,
}

impl RateLimitState {
    pub fn full(capacity: f64, refill_rate_per_second: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
            capacity,
            refill_rate_per_second,
        }
    }

    /// Refill for elapsed time, then consume one token if available.
    /// Must run as one atomic step per key; the Lua script in the Redis store mirrors it.
    pub fn refill_and_take(&mut self, now_ms: u64) -> BucketDecision {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let refilled = self.tokens + elapsed_ms as f64 / 1000.0 * self.refill_rate_per_second;
        self.tokens = refilled.clamp(0.0, self.capacity);
        self.last_refill_ms = now_ms.max(self.last_refill_ms);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            BucketDecision {
                allowed: true,
                remaining: self.tokens,
                retry_after_ms: 0,
            }
        } else {
            let missing = 1.0 - self.tokens;
            let retry_after_ms = if self.refill_rate_per_second > 0.0 {
                (missing / self.refill_rate_per_second * 1000.0).ceil() as u64
            } else {
                u64::MAX
            };
            BucketDecision {
                allowed: false,
                remaining: self.tokens,
                retry_after_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn evidence_aged(secs: i64, ttl: u64) -> Evidence {
        let mut ev = Evidence::new("test", ttl, serde_json::json!({}));
        ev.observed_at = Utc::now() - Duration::seconds(secs);
        ev
    }

    #[test]
    fn test_evidence_staleness() {
        assert!(!evidence_aged(10, 300).is_stale());
        assert!(evidence_aged(301, 300).is_stale());
    }

    #[test]
    fn test_session_immutable_after_complete() {
        let mut session = ScanSession::new(Address::ZERO, 1, "req-1");
        session.complete(12.0, 1.0);
        let accepted = session.record_degraded(DegradedProbe {
            probe: "mixer_exposure".to_string(),
            kind: DegradedKind::Timeout,
            reason: "late".to_string(),
        });
        assert!(!accepted);
        assert!(session.degraded.is_empty());
        session.fail("too late");
        assert_eq!(session.status, ScanStatus::Complete);
    }

    #[test]
    fn test_bucket_refill_and_take() {
        let mut bucket = RateLimitState::full(2.0, 1.0, 0);
        assert!(bucket.refill_and_take(0).allowed);
        assert!(bucket.refill_and_take(0).allowed);
        let rejected = bucket.refill_and_take(0);
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after_ms, 1000);
        // one second later a token is back, but never above capacity
        assert!(bucket.refill_and_take(1_000).allowed);
        let later = bucket.refill_and_take(60_000);
        assert!(later.allowed);
        assert!(later.remaining <= 1.0 + f64::EPSILON);
    }

    #[test]
    fn test_scan_event_wire_shape() {
        let event = ScanEvent::Failed {
            session_id: "s".to_string(),
            reason: "no probe reported".to_string(),
            degraded_probes: vec![],
            request_id: "r".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["requestId"], "r");
        assert!(event.is_terminal());
    }

    #[test]
    fn test_candidate_fingerprint_ignores_key() {
        let a = RemediationCandidate {
            idempotency_key: "k1".to_string(),
            subject_address: Address::repeat_byte(0x11),
            action_type: ActionType::RevokeApproval,
            target_contract: Address::repeat_byte(0x22),
            chain_id: 1,
            spender: None,
        };
        let mut b = a.clone();
        b.idempotency_key = "k2".to_string();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.chain_id = 10;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
