//! Probe Set
//!
//! Each probe is an independent check producing one `RiskContribution`.
//! Probes never enforce their own timeout; the orchestrator does.
//!
//! Evidence resolution order, shared by all probes:
//! 1. fresh cache entry
//! 2. live fetch, written back to the cache
//! 3. on fetch failure, expired cache entry marked as stale

pub mod approvals;
pub mod mixer;
pub mod reputation;

pub use approvals::*;
pub use mixer::*;
pub use reputation::*;

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{AppError, AppResult, ErrorCode, Evidence, Provenance, RiskContribution};
use crate::providers::ChainDataSource;
use crate::utils::cache::EvidenceCache;

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fixed aggregate weight
    fn weight(&self) -> f64;

    /// Score and reasons computed only from an evidence payload
    fn score(&self, raw: &serde_json::Value) -> AppResult<(f64, Vec<String>)>;

    async fn evaluate(&self, subject: Address, chain_id: u64) -> AppResult<RiskContribution>;
}

/// Evidence picked for one evaluation
#[derive(Debug, Clone)]
pub struct ResolvedEvidence {
    pub evidence: Evidence,
    /// Served from an expired entry after the live fetch failed
    pub stale: bool,
}

/// Typed view of a raw evidence payload
pub fn decode_payload<T: DeserializeOwned>(raw: &serde_json::Value) -> AppResult<T> {
    T::deserialize(raw)
        .map_err(|e| AppError::new(ErrorCode::ProbeError, format!("Malformed evidence: {}", e)))
}

/// Cache-first evidence lookup shared by all probes
#[derive(Clone)]
pub struct EvidenceResolver {
    cache: EvidenceCache,
    ttl_secs: u64,
}

impl EvidenceResolver {
    pub fn new(cache: EvidenceCache, ttl_secs: u64) -> Self {
        Self { cache, ttl_secs }
    }

    pub fn cache(&self) -> &EvidenceCache {
        &self.cache
    }

    pub async fn resolve<F, Fut>(
        &self,
        probe: &str,
        subject: Address,
        chain_id: u64,
        fetch: F,
    ) -> AppResult<ResolvedEvidence>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = AppResult<(String, serde_json::Value, Provenance)>> + Send,
    {
        if let Some(evidence) = self.cache.get_fresh(probe, &subject, chain_id) {
            return Ok(ResolvedEvidence {
                evidence,
                stale: false,
            });
        }

        match fetch().await {
            Ok((source, raw, provenance)) => {
                let evidence =
                    Evidence::new(source, self.ttl_secs, raw).with_provenance(provenance);
                self.cache.insert(probe, &subject, chain_id, evidence.clone());
                debug!("🔎 {} fetched fresh evidence for {}", probe, subject);
                Ok(ResolvedEvidence {
                    evidence,
                    stale: false,
                })
            }
            Err(err) => match self.cache.get_any(probe, &subject, chain_id) {
                Some(evidence) => {
                    warn!(
                        "⚠️ {} live fetch failed ({}), falling back to evidence from {}",
                        probe, err, evidence.observed_at
                    );
                    // a cached entry that has not expired yet is still fresh
                    let stale = evidence.is_stale();
                    Ok(ResolvedEvidence { evidence, stale })
                }
                None => Err(AppError::with_source(
                    ErrorCode::ProbeError,
                    format!("{} could not gather evidence", probe),
                    err,
                )),
            },
        }
    }
}

/// Registered probes for every scan session
#[derive(Clone)]
pub struct ProbeSet {
    probes: Vec<Arc<dyn Probe>>,
}

impl ProbeSet {
    pub fn new(probes: Vec<Arc<dyn Probe>>) -> Self {
        Self { probes }
    }

    /// The three standard probes over one data source
    pub fn standard(
        source: Arc<dyn ChainDataSource>,
        resolver: EvidenceResolver,
        labels: Arc<LabelRegistry>,
    ) -> Self {
        Self::new(vec![
            Arc::new(ApprovalExposureProbe::new(source.clone(), resolver.clone())),
            Arc::new(CounterpartyReputationProbe::new(
                source.clone(),
                resolver.clone(),
                labels,
            )),
            Arc::new(MixerExposureProbe::new(source, resolver)),
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Probe>> {
        self.probes.iter()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Denominator for coverage
    pub fn total_weight(&self) -> f64 {
        self.probes.iter().map(|p| p.weight()).sum()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Probe>> {
        self.probes.iter().find(|p| p.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name()).collect()
    }
}

/// Score evidence with `probe` and wrap it as a contribution
pub fn contribution_from(
    probe: &dyn Probe,
    evidence: Evidence,
    stale: bool,
) -> AppResult<RiskContribution> {
    let (score, reasons) = probe.score(&evidence.raw)?;
    Ok(RiskContribution {
        probe: probe.name().to_string(),
        score: score.clamp(0.0, 100.0),
        weight: probe.weight(),
        reasons,
        evidence,
        from_stale_evidence: stale,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory data source for probe and orchestrator tests

    use super::*;
    use crate::models::ApprovalRecord;
    use crate::providers::{Sourced, TransferRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeDataSource {
        pub approvals: Mutex<Vec<ApprovalRecord>>,
        pub transfers: Mutex<Vec<TransferRecord>>,
        pub fail: std::sync::atomic::AtomicBool,
        pub calls: AtomicUsize,
    }

    impl FakeDataSource {
        fn provenance(method: &str) -> Provenance {
            Provenance {
                provider: "fake".to_string(),
                method: method.to_string(),
                request_id: "test".to_string(),
            }
        }

        fn check(&self) -> AppResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(AppError::rpc_connection_failed("fake outage"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ChainDataSource for FakeDataSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn approvals(
            &self,
            _owner: Address,
            _chain_id: u64,
        ) -> AppResult<Sourced<Vec<ApprovalRecord>>> {
            self.check()?;
            Ok(Sourced {
                data: self.approvals.lock().map(|a| a.clone()).unwrap_or_default(),
                provenance: Self::provenance("approvals"),
            })
        }

        async fn transfers(
            &self,
            _address: Address,
            _chain_id: u64,
        ) -> AppResult<Sourced<Vec<TransferRecord>>> {
            self.check()?;
            Ok(Sourced {
                data: self.transfers.lock().map(|t| t.clone()).unwrap_or_default(),
                provenance: Self::provenance("transfers"),
            })
        }
    }
}
