//! Counterparty reputation probe
//!
//! Flags transfers to or from addresses in the label registry.
//! The registry is seeded with built-in entries and can be extended from a JSON file:
//!
//! ```json
//! [{ "address": "0x...", "label": "Some Exploiter" }]
//! ```

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{contribution_from, decode_payload, EvidenceResolver, Probe};
use crate::models::{
    AppError, AppResult, CounterpartyExposure, ErrorCode, FlaggedCounterparty, RiskContribution,
};
use crate::providers::{ChainDataSource, TransferRecord};
use crate::utils::constants::{
    DEFAULT_FLAGGED_COUNTERPARTIES, PROBE_COUNTERPARTY_REPUTATION, SCORE_PER_FLAGGED_COUNTERPARTY,
    WEIGHT_COUNTERPARTY_REPUTATION,
};

#[derive(Debug, Deserialize)]
struct LabelEntry {
    address: Address,
    label: String,
}

/// Known-bad addresses and their labels
#[derive(Debug, Clone)]
pub struct LabelRegistry {
    labels: HashMap<Address, String>,
}

impl Default for LabelRegistry {
    fn default() -> Self {
        Self {
            labels: DEFAULT_FLAGGED_COUNTERPARTIES
                .iter()
                .map(|(addr, label)| (*addr, label.to_string()))
                .collect(),
        }
    }
}

impl LabelRegistry {
    /// Built-in entries plus those in `path`
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<LabelEntry> = serde_json::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCode::ConfigInvalidValue,
                format!("Invalid label file {}: {}", path.display(), e),
            )
        })?;

        let mut registry = Self::default();
        let count = entries.len();
        registry.extend(entries.into_iter().map(|e| (e.address, e.label)));
        info!("🏷️ Loaded {} counterparty labels from {}", count, path.display());
        Ok(registry)
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = (Address, String)>) {
        self.labels.extend(entries);
    }

    pub fn label(&self, address: &Address) -> Option<&str> {
        self.labels.get(address).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Group transfers by counterparty and keep the labelled ones
    pub fn classify(&self, transfers: &[TransferRecord]) -> CounterpartyExposure {
        let distinct: BTreeSet<Address> = transfers.iter().map(|t| t.counterparty).collect();

        let mut hits: BTreeMap<Address, usize> = BTreeMap::new();
        for transfer in transfers {
            if self.labels.contains_key(&transfer.counterparty) {
                *hits.entry(transfer.counterparty).or_default() += 1;
            }
        }

        CounterpartyExposure {
            counterparties: distinct.len(),
            flagged: hits
                .into_iter()
                .map(|(address, interactions)| FlaggedCounterparty {
                    label: self.label(&address).unwrap_or_default().to_string(),
                    address,
                    interactions,
                })
                .collect(),
        }
    }
}

/// Score and reasons for a counterparty payload
pub fn score_counterparties(exposure: &CounterpartyExposure) -> (f64, Vec<String>) {
    let reasons = exposure
        .flagged
        .iter()
        .map(|f| {
            format!(
                "{} interaction(s) with flagged address {} ({})",
                f.interactions, f.address, f.label
            )
        })
        .collect();
    let score = exposure.flagged.len() as f64 * SCORE_PER_FLAGGED_COUNTERPARTY;
    (score.min(100.0), reasons)
}

pub struct CounterpartyReputationProbe {
    source: Arc<dyn ChainDataSource>,
    resolver: EvidenceResolver,
    labels: Arc<LabelRegistry>,
}

impl CounterpartyReputationProbe {
    pub fn new(
        source: Arc<dyn ChainDataSource>,
        resolver: EvidenceResolver,
        labels: Arc<LabelRegistry>,
    ) -> Self {
        Self {
            source,
            resolver,
            labels,
        }
    }
}

#[async_trait]
impl Probe for CounterpartyReputationProbe {
    fn name(&self) -> &'static str {
        PROBE_COUNTERPARTY_REPUTATION
    }

    fn weight(&self) -> f64 {
        WEIGHT_COUNTERPARTY_REPUTATION
    }

    fn score(&self, raw: &serde_json::Value) -> AppResult<(f64, Vec<String>)> {
        Ok(score_counterparties(&decode_payload::<CounterpartyExposure>(raw)?))
    }

    async fn evaluate(&self, subject: Address, chain_id: u64) -> AppResult<RiskContribution> {
        let source = self.source.clone();
        let labels = self.labels.clone();
        let resolved = self
            .resolver
            .resolve(self.name(), subject, chain_id, || async move {
                let sourced = source.transfers(subject, chain_id).await?;
                let raw = serde_json::to_value(labels.classify(&sourced.data))?;
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
    use crate::models::FlowDirection;
    use crate::utils::cache::EvidenceCache;
    use std::time::Duration;

    fn transfer(counterparty: Address) -> TransferRecord {
        TransferRecord {
            counterparty,
            direction: FlowDirection::Outbound,
            tx_hash: "0x01".to_string(),
        }
    }

    #[test]
    fn test_classify_groups_interactions() {
        let exploiter = DEFAULT_FLAGGED_COUNTERPARTIES[0].0;
        let friend = Address::repeat_byte(0x42);
        let registry = LabelRegistry::default();

        let exposure = registry.classify(&[transfer(exploiter), transfer(friend), transfer(exploiter)]);
        assert_eq!(exposure.counterparties, 2);
        assert_eq!(exposure.flagged.len(), 1);
        assert_eq!(exposure.flagged[0].interactions, 2);

        let (score, reasons) = score_counterparties(&exposure);
        assert_eq!(score, 40.0);
        assert!(reasons[0].contains("Ronin"));
    }

    #[test]
    fn test_load_label_file() {
        let path = std::env::temp_dir().join(format!("labels-{}.json", uuid::Uuid::new_v4()));
        let extra = Address::repeat_byte(0x66);
        std::fs::write(
            &path,
            format!(r#"[{{"address":"{}","label":"Phisher"}}]"#, extra),
        )
        .unwrap();

        let registry = LabelRegistry::load(&path).unwrap();
        assert_eq!(registry.label(&extra), Some("Phisher"));
        assert_eq!(registry.len(), DEFAULT_FLAGGED_COUNTERPARTIES.len() + 1);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_clean_history_scores_zero() {
        let source = Arc::new(FakeDataSource::default());
        source
            .transfers
            .lock()
            .unwrap()
            .push(transfer(Address::repeat_byte(0x42)));
        let resolver = EvidenceResolver::new(EvidenceCache::new(10, Duration::from_secs(60)), 300);
        let probe =
            CounterpartyReputationProbe::new(source, resolver, Arc::new(LabelRegistry::default()));

        let c = probe.evaluate(Address::repeat_byte(1), 1).await.unwrap();
        assert_eq!(c.score, 0.0);
        assert!(c.reasons.is_empty());
        assert_eq!(c.weight, WEIGHT_COUNTERPARTY_REPUTATION);
    }
}
