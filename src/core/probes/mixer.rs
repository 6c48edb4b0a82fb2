//! Mixer exposure probe: direct transfers to or from known mixer pools

use alloy_primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;

use super::{contribution_from, decode_payload, EvidenceResolver, Probe};
use crate::models::{AppResult, FlowDirection, MixerExposure, MixerInteraction, RiskContribution};
use crate::providers::{ChainDataSource, TransferRecord};
use crate::utils::constants::{
    mixer_label, PROBE_MIXER_EXPOSURE, SCORE_EXTRA_MIXER_INTERACTION,
    SCORE_FIRST_MIXER_INTERACTION, WEIGHT_MIXER_EXPOSURE,
};

pub struct MixerExposureProbe {
    source: Arc<dyn ChainDataSource>,
    resolver: EvidenceResolver,
}

impl MixerExposureProbe {
    pub fn new(source: Arc<dyn ChainDataSource>, resolver: EvidenceResolver) -> Self {
        Self { source, resolver }
    }
}

pub fn mixer_interactions(transfers: &[TransferRecord]) -> MixerExposure {
    MixerExposure {
        interactions: transfers
            .iter()
            .filter_map(|t| {
                mixer_label(&t.counterparty).map(|label| MixerInteraction {
                    mixer: t.counterparty,
                    label: label.to_string(),
                    direction: t.direction,
                    tx_hash: t.tx_hash.clone(),
                })
            })
            .collect(),
    }
}

/// First interaction dominates; later ones add a smaller increment
pub fn score_mixer(exposure: &MixerExposure) -> (f64, Vec<String>) {
    let n = exposure.interactions.len();
    if n == 0 {
        return (0.0, Vec::new());
    }

    let inbound = exposure
        .interactions
        .iter()
        .filter(|i| i.direction == FlowDirection::Inbound)
        .count();
    let mut reasons = Vec::new();
    if inbound > 0 {
        reasons.push(format!("{} transfer(s) received from mixer pools", inbound));
    }
    if n > inbound {
        reasons.push(format!("{} transfer(s) sent to mixer pools", n - inbound));
    }

    let score =
        SCORE_FIRST_MIXER_INTERACTION + (n - 1) as f64 * SCORE_EXTRA_MIXER_INTERACTION;
    (score.min(100.0), reasons)
}

#[async_trait]
impl Probe for MixerExposureProbe {
    fn name(&self) -> &'static str {
        PROBE_MIXER_EXPOSURE
    }

    fn weight(&self) -> f64 {
        WEIGHT_MIXER_EXPOSURE
    }

    fn score(&self, raw: &serde_json::Value) -> AppResult<(f64, Vec<String>)> {
        Ok(score_mixer(&decode_payload::<MixerExposure>(raw)?))
    }

    async fn evaluate(&self, subject: Address, chain_id: u64) -> AppResult<RiskContribution> {
        let source = self.source.clone();
        let resolved = self
            .resolver
            .resolve(self.name(), subject, chain_id, || async move {
                let sourced = source.transfers(subject, chain_id).await?;
                let raw = serde_json::to_value(mixer_interactions(&sourced.data))?;
                Ok((source.name().to_string(), raw, sourced.provenance))
            })
            .await?;

        contribution_from(self, resolved.evidence, resolved.stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::constants::KNOWN_MIXERS;

    fn transfer(counterparty: Address, direction: FlowDirection) -> TransferRecord {
        TransferRecord {
            counterparty,
            direction,
            tx_hash: "0xabc".to_string(),
        }
    }

    #[test]
    fn test_only_mixers_are_kept() {
        let exposure = mixer_interactions(&[
            transfer(KNOWN_MIXERS[1].0, FlowDirection::Inbound),
            transfer(Address::repeat_byte(9), FlowDirection::Outbound),
        ]);
        assert_eq!(exposure.interactions.len(), 1);
        assert_eq!(exposure.interactions[0].label, "Tornado Cash: 0.1 ETH");
    }

    #[test]
    fn test_scoring() {
        assert_eq!(score_mixer(&MixerExposure::default()).0, 0.0);

        let one = mixer_interactions(&[transfer(KNOWN_MIXERS[0].0, FlowDirection::Outbound)]);
        assert_eq!(score_mixer(&one).0, 70.0);

        let three = mixer_interactions(&[
            transfer(KNOWN_MIXERS[0].0, FlowDirection::Outbound),
            transfer(KNOWN_MIXERS[2].0, FlowDirection::Inbound),
            transfer(KNOWN_MIXERS[3].0, FlowDirection::Inbound),
        ]);
        let (score, reasons) = score_mixer(&three);
        assert_eq!(score, 100.0);
        assert_eq!(reasons.len(), 2);
    }
}
