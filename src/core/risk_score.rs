//! Risk Scoring Module
//! Combines probe contributions into a 0-100 aggregate score plus a confidence value
//!
//! Score is the weighted average over probes that actually reported.
//! Confidence is coverage (reported weight / total weight) times the freshness
//! of the oldest contributing evidence, clamped to [0.5, 1.0].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::RiskContribution;
use crate::utils::constants::{
    FRESHNESS_AT_TTL, FRESHNESS_FULL_FRACTION, FRESHNESS_STALE, MIN_CONFIDENCE,
};

/// Score bands
/// - 0-20: Safe
/// - 21-40: Low
/// - 41-60: Medium
/// - 61-80: High
/// - 81-100: Critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        match score.round().clamp(0.0, 100.0) as u8 {
            0..=20 => RiskLevel::Safe,
            21..=40 => RiskLevel::Low,
            41..=60 => RiskLevel::Medium,
            61..=80 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "✅",
            RiskLevel::Low => "🟡",
            RiskLevel::Medium => "🟠",
            RiskLevel::High => "🔴",
            RiskLevel::Critical => "💀",
        }
    }

    /// Human-readable recommendation
    pub fn recommendation(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "No significant exposure found.",
            RiskLevel::Low => "Minor exposure. Review outstanding approvals periodically.",
            RiskLevel::Medium => "Review flagged approvals and counterparties.",
            RiskLevel::High => "Revoke risky approvals and avoid flagged counterparties.",
            RiskLevel::Critical => "Wallet is heavily exposed. Move funds after revoking approvals.",
        }
    }
}

/// Result of combining contributions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    /// None when nothing reported
    pub score: Option<f64>,
    pub confidence: f64,
    /// Reported weight / total weight
    pub coverage: f64,
    /// Freshness of the oldest contributing evidence
    pub freshness: f64,
}

impl Aggregate {
    pub fn empty() -> Self {
        Self {
            score: None,
            confidence: 0.0,
            coverage: 0.0,
            freshness: 0.0,
        }
    }

    pub fn level(&self) -> Option<RiskLevel> {
        self.score.map(RiskLevel::from_score)
    }
}

/// Freshness in [0.5, 1.0]: full until half the TTL, then linear down to 0.75 at the TTL.
/// Expired or stale-fallback evidence counts as 0.5.
pub fn freshness_factor(contribution: &RiskContribution, now: DateTime<Utc>) -> f64 {
    let evidence = &contribution.evidence;
    if contribution.from_stale_evidence || evidence.ttl_seconds == 0 {
        return FRESHNESS_STALE;
    }
    let ratio = evidence.age_secs_at(now) / evidence.ttl_seconds as f64;
    if ratio <= FRESHNESS_FULL_FRACTION {
        1.0
    } else if ratio <= 1.0 {
        let progress = (ratio - FRESHNESS_FULL_FRACTION) / (1.0 - FRESHNESS_FULL_FRACTION);
        1.0 - progress * (1.0 - FRESHNESS_AT_TTL)
    } else {
        FRESHNESS_STALE
    }
}

/// Weighted average over reporting probes; missing probes leave the denominator.
/// Iterates in key order so the result does not depend on arrival order.
pub fn weighted_score(contributions: &BTreeMap<String, RiskContribution>) -> Option<f64> {
    let (weighted, weight) = contributions
        .values()
        .fold((0.0_f64, 0.0_f64), |(sum, w), c| {
            (sum + c.score.clamp(0.0, 100.0) * c.weight, w + c.weight)
        });
    if weight <= 0.0 {
        None
    } else {
        Some(weighted / weight)
    }
}

/// Combine contributions. `total_weight` is the sum of all registered probe weights.
pub fn aggregate(
    contributions: &BTreeMap<String, RiskContribution>,
    total_weight: f64,
    now: DateTime<Utc>,
) -> Aggregate {
    let Some(score) = weighted_score(contributions) else {
        return Aggregate::empty();
    };

    let reported: f64 = contributions.values().map(|c| c.weight).sum();
    // snap float noise so a full report is exactly 1.0
    let coverage = if total_weight <= 0.0 {
        0.0
    } else if reported >= total_weight - 1e-9 {
        1.0
    } else {
        reported / total_weight
    };
    let freshness = contributions
        .values()
        .map(|c| freshness_factor(c, now))
        .fold(1.0_f64, f64::min);

    Aggregate {
        score: Some(score),
        confidence: (coverage * freshness).clamp(MIN_CONFIDENCE, 1.0),
        coverage,
        freshness,
    }
}

/// One-line summary for logs and the CLI
pub fn summarize(aggregate: &Aggregate) -> String {
    match aggregate.level() {
        Some(level) => format!(
            "{} {} ({:.1}/100, confidence {:.0}%) - {}",
            level.emoji(),
            level.as_str(),
            aggregate.score.unwrap_or_default(),
            aggregate.confidence * 100.0,
            level.recommendation()
        ),
        None => "❓ UNKNOWN - no probe reported".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Evidence;

    fn contribution(probe: &str, score: f64, weight: f64, age_secs: i64) -> RiskContribution {
        let mut evidence = Evidence::new("test", 300, serde_json::json!({}));
        evidence.observed_at = Utc::now() - chrono::Duration::seconds(age_secs);
        RiskContribution {
            probe: probe.to_string(),
            score,
            weight,
            reasons: vec![],
            evidence,
            from_stale_evidence: false,
        }
    }

    fn map(items: Vec<RiskContribution>) -> BTreeMap<String, RiskContribution> {
        items.into_iter().map(|c| (c.probe.clone(), c)).collect()
    }

    #[test]
    fn test_all_clean_is_fully_confident() {
        let contributions = map(vec![
            contribution("approval_exposure", 0.0, 0.45, 0),
            contribution("counterparty_reputation", 0.0, 0.35, 0),
            contribution("mixer_exposure", 0.0, 0.20, 0),
        ]);
        let agg = aggregate(&contributions, 1.0, Utc::now());
        assert_eq!(agg.score, Some(0.0));
        assert!((agg.confidence - 1.0).abs() < 1e-9);
        assert_eq!(agg.level(), Some(RiskLevel::Safe));
    }

    #[test]
    fn test_missing_probe_leaves_denominator() {
        let contributions = map(vec![
            contribution("approval_exposure", 50.0, 0.45, 0),
            contribution("mixer_exposure", 100.0, 0.20, 0),
        ]);
        let agg = aggregate(&contributions, 1.0, Utc::now());
        let expected = (50.0 * 0.45 + 100.0 * 0.20) / 0.65;
        assert!((agg.score.unwrap() - expected).abs() < 1e-9);
        assert!((agg.confidence - 0.65).abs() < 1e-9);
        assert!(agg.confidence < 1.0);
    }

    #[test]
    fn test_confidence_floor() {
        let contributions = map(vec![contribution("mixer_exposure", 10.0, 0.20, 0)]);
        let agg = aggregate(&contributions, 1.0, Utc::now());
        assert!((agg.confidence - MIN_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn test_nothing_reported() {
        let agg = aggregate(&BTreeMap::new(), 1.0, Utc::now());
        assert_eq!(agg.score, None);
        assert_eq!(agg.confidence, 0.0);
    }

    #[test]
    fn test_freshness_decay() {
        let now = Utc::now();
        assert_eq!(freshness_factor(&contribution("p", 0.0, 1.0, 100), now), 1.0);
        let at_ttl = freshness_factor(&contribution("p", 0.0, 1.0, 299), now);
        assert!((at_ttl - 0.75).abs() < 0.01);
        let expired = freshness_factor(&contribution("p", 0.0, 1.0, 600), now);
        assert_eq!(expired, FRESHNESS_STALE);

        let mut stale = contribution("p", 0.0, 1.0, 0);
        stale.from_stale_evidence = true;
        assert_eq!(freshness_factor(&stale, now), FRESHNESS_STALE);
    }

    #[test]
    fn test_stale_evidence_lowers_confidence() {
        let mut stale = contribution("approval_exposure", 20.0, 0.45, 400);
        stale.from_stale_evidence = true;
        let contributions = map(vec![
            stale,
            contribution("counterparty_reputation", 0.0, 0.35, 0),
            contribution("mixer_exposure", 0.0, 0.20, 0),
        ]);
        let agg = aggregate(&contributions, 1.0, Utc::now());
        assert!((agg.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_risk_levels() {
        assert_eq!(RiskLevel::from_score(20.4), RiskLevel::Safe);
        assert_eq!(RiskLevel::from_score(40.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(60.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(75.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(99.0), RiskLevel::Critical);
    }
}
