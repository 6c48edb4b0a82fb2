//! Approval exposure probe
//!
//! Scores outstanding ERC-20 allowances granted by the subject.
//! Unlimited allowances weigh more than bounded ones.

use alloy_primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;

use super::{contribution_from, decode_payload, EvidenceResolver, Probe};
use crate::models::{AppResult, ApprovalExposure, RiskContribution};
use crate::providers::ChainDataSource;
use crate::utils::constants::{
    PROBE_APPROVAL_EXPOSURE, SCORE_PER_LIMITED_APPROVAL, SCORE_PER_UNLIMITED_APPROVAL,
    WEIGHT_APPROVAL_EXPOSURE,
};

pub struct ApprovalExposureProbe {
    source: Arc<dyn ChainDataSource>,
    resolver: EvidenceResolver,
}

impl ApprovalExposureProbe {
    pub fn new(source: Arc<dyn ChainDataSource>, resolver: EvidenceResolver) -> Self {
        Self { source, resolver }
    }
}

/// Score and reasons for an approval payload
pub fn score_approvals(exposure: &ApprovalExposure) -> (f64, Vec<String>) {
    let unlimited = exposure.approvals.iter().filter(|a| a.unlimited).count();
    let limited = exposure.approvals.len() - unlimited;

    let mut reasons = Vec::new();
    if unlimited > 0 {
        reasons.push(format!("{} unlimited token approval(s)", unlimited));
    }
    if limited > 0 {
        reasons.push(format!("{} bounded token approval(s)", limited));
    }

    let score = unlimited as f64 * SCORE_PER_UNLIMITED_APPROVAL
        + limited as f64 * SCORE_PER_LIMITED_APPROVAL;
    (score.min(100.0), reasons)
}

#[async_trait]
impl Probe for ApprovalExposureProbe {
    fn name(&self) -> &'static str {
        PROBE_APPROVAL_EXPOSURE
    }

    fn weight(&self) -> f64 {
        WEIGHT_APPROVAL_EXPOSURE
    }

    fn score(&self, raw: &serde_json::Value) -> AppResult<(f64, Vec<String>)> {
        Ok(score_approvals(&decode_payload::<ApprovalExposure>(raw)?))
    }

    async fn evaluate(&self, subject: Address, chain_id: u64) -> AppResult<RiskContribution> {
        let source = self.source.clone();
        let resolved = self
            .resolver
            .resolve(self.name(), subject, chain_id, || async move {
                let sourced = source.approvals(subject, chain_id).await?;
                let raw = serde_json::to_value(ApprovalExposure {
                    approvals: sourced.data,
                })?;
                Ok((source.name().to_string(), raw, sourced.provenance))
            })
            .await?;

        contribution_from(self, resolved.evidence, resolved.stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::probes::testing::FakeDataSource;
    use crate::models::{ApprovalRecord, Evidence};
    use crate::utils::cache::EvidenceCache;
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn approval(unlimited: bool) -> ApprovalRecord {
        ApprovalRecord {
            token: Address::repeat_byte(0x10),
            spender: Address::repeat_byte(0x20),
            allowance: if unlimited { "max".into() } else { "1000".into() },
            unlimited,
        }
    }

    fn probe(source: Arc<FakeDataSource>) -> (ApprovalExposureProbe, EvidenceCache) {
        let cache = EvidenceCache::new(100, Duration::from_secs(3600));
        let resolver = EvidenceResolver::new(cache.clone(), 300);
        (ApprovalExposureProbe::new(source, resolver), cache)
    }

    #[test]
    fn test_scoring() {
        let exposure = ApprovalExposure {
            approvals: vec![approval(true), approval(true), approval(false)],
        };
        let (score, reasons) = score_approvals(&exposure);
        assert_eq!(score, 60.0);
        assert_eq!(reasons.len(), 2);

        let many = ApprovalExposure {
            approvals: (0..10).map(|_| approval(true)).collect(),
        };
        assert_eq!(score_approvals(&many).0, 100.0);
        assert_eq!(score_approvals(&ApprovalExposure::default()).0, 0.0);
    }

    #[tokio::test]
    async fn test_second_evaluation_uses_cache() {
        let source = Arc::new(FakeDataSource::default());
        source.approvals.lock().unwrap().push(approval(true));
        let (probe, _) = probe(source.clone());

        let first = probe.evaluate(Address::repeat_byte(1), 1).await.unwrap();
        let second = probe.evaluate(Address::repeat_byte(1), 1).await.unwrap();

        assert_eq!(first.score, 25.0);
        assert_eq!(second.score, 25.0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.evidence.source, "fake");
        assert!(first.evidence.provenance.is_some());
    }

    #[tokio::test]
    async fn test_outage_falls_back_to_stale_evidence() {
        let source = Arc::new(FakeDataSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let (probe, cache) = probe(source);

        let subject = Address::repeat_byte(2);
        let raw = serde_json::to_value(ApprovalExposure {
            approvals: vec![approval(false)],
        })
        .unwrap();
        let mut old = Evidence::new("fake", 300, raw);
        old.observed_at = Utc::now() - chrono::Duration::seconds(900);
        cache.insert(PROBE_APPROVAL_EXPOSURE, &subject, 1, old);

        let c = probe.evaluate(subject, 1).await.unwrap();
        assert!(c.from_stale_evidence);
        assert_eq!(c.score, 10.0);
    }

    #[tokio::test]
    async fn test_outage_without_cache_is_error() {
        let source = Arc::new(FakeDataSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let (probe, _) = probe(source);
        assert!(probe.evaluate(Address::repeat_byte(3), 1).await.is_err());
    }
}
