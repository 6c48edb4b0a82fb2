//! Telemetry Module for Wallet Guardian
//!
//! Process-wide counters for scans, probes, admission and remediation.
//! Privacy-first: no wallet addresses are recorded, only counts and latencies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Probe outcome kinds tracked per probe name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeOutcome {
    Reported,
    StaleFallback,
    Timeout,
    Error,
}

impl ProbeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeOutcome::Reported => "reported",
            ProbeOutcome::StaleFallback => "stale_fallback",
            ProbeOutcome::Timeout => "timeout",
            ProbeOutcome::Error => "error",
        }
    }
}

/// Snapshot served by /v1/stats
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStats {
    pub scans_started: u64,
    pub scans_completed: u64,
    pub scans_failed: u64,
    pub scans_cancelled: u64,
    /// "probe.outcome" -> count
    pub probe_outcomes: BTreeMap<String, u64>,
    pub rate_limited: u64,
    pub idempotent_replays: u64,
    pub simulations: u64,
    pub simulations_reverted: u64,
    pub rpc_retries: u64,
    pub rpc_failovers: u64,
    pub avg_scan_latency_ms: f64,
    pub uptime_secs: u64,
}

impl TelemetryStats {
    /// Export as JSON for API
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Shared telemetry collector
pub struct ScanTelemetry {
    scans_started: AtomicU64,
    scans_completed: AtomicU64,
    scans_failed: AtomicU64,
    scans_cancelled: AtomicU64,
    rate_limited: AtomicU64,
    idempotent_replays: AtomicU64,
    simulations: AtomicU64,
    simulations_reverted: AtomicU64,
    rpc_retries: AtomicU64,
    rpc_failovers: AtomicU64,
    total_scan_latency_ms: AtomicU64,
    probe_outcomes: Arc<RwLock<BTreeMap<String, u64>>>,
    started_at: u64,
}

impl Default for ScanTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanTelemetry {
    pub fn new() -> Self {
        Self {
            scans_started: AtomicU64::new(0),
            scans_completed: AtomicU64::new(0),
            scans_failed: AtomicU64::new(0),
            scans_cancelled: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            idempotent_replays: AtomicU64::new(0),
            simulations: AtomicU64::new(0),
            simulations_reverted: AtomicU64::new(0),
            rpc_retries: AtomicU64::new(0),
            rpc_failovers: AtomicU64::new(0),
            total_scan_latency_ms: AtomicU64::new(0),
            probe_outcomes: Arc::new(RwLock::new(BTreeMap::new())),
            started_at: current_timestamp(),
        }
    }

    pub fn record_scan_started(&self) {
        self.scans_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_completed(&self, latency_ms: u64) {
        self.scans_completed.fetch_add(1, Ordering::Relaxed);
        self.total_scan_latency_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_scan_failed(&self) {
        self.scans_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_cancelled(&self) {
        self.scans_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self, probe: &str, outcome: ProbeOutcome) {
        if let Ok(mut counts) = self.probe_outcomes.write() {
            *counts
                .entry(format!("{}.{}", probe, outcome.as_str()))
                .or_insert(0) += 1;
        }
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idempotent_replay(&self) {
        self.idempotent_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_simulation(&self, will_succeed: bool) {
        self.simulations.fetch_add(1, Ordering::Relaxed);
        if !will_succeed {
            self.simulations_reverted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rpc_retry(&self) {
        self.rpc_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_failover(&self) {
        self.rpc_failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetryStats {
        let completed = self.scans_completed.load(Ordering::Relaxed);
        let total_latency = self.total_scan_latency_ms.load(Ordering::Relaxed);

        TelemetryStats {
            scans_started: self.scans_started.load(Ordering::Relaxed),
            scans_completed: completed,
            scans_failed: self.scans_failed.load(Ordering::Relaxed),
            scans_cancelled: self.scans_cancelled.load(Ordering::Relaxed),
            probe_outcomes: self
                .probe_outcomes
                .read()
                .map(|c| c.clone())
                .unwrap_or_default(),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            idempotent_replays: self.idempotent_replays.load(Ordering::Relaxed),
            simulations: self.simulations.load(Ordering::Relaxed),
            simulations_reverted: self.simulations_reverted.load(Ordering::Relaxed),
            rpc_retries: self.rpc_retries.load(Ordering::Relaxed),
            rpc_failovers: self.rpc_failovers.load(Ordering::Relaxed),
            avg_scan_latency_ms: if completed > 0 {
                total_latency as f64 / completed as f64
            } else {
                0.0
            },
            uptime_secs: current_timestamp().saturating_sub(self.started_at),
        }
    }
}

impl ScanTelemetry {
    /// Write a snapshot to `dir/stats_<unix>.json`
    pub fn export_stats_json(&self, dir: &Path) -> Result<PathBuf, std::io::Error> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("stats_{}.json", current_timestamp()));
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let telemetry = ScanTelemetry::new();
        telemetry.record_scan_started();
        telemetry.record_scan_completed(120);
        telemetry.record_scan_completed(80);
        telemetry.record_probe("mixer_exposure", ProbeOutcome::Timeout);
        telemetry.record_probe("mixer_exposure", ProbeOutcome::Timeout);
        telemetry.record_simulation(false);

        let stats = telemetry.snapshot();
        assert_eq!(stats.scans_started, 1);
        assert_eq!(stats.scans_completed, 2);
        assert!((stats.avg_scan_latency_ms - 100.0).abs() < f64::EPSILON);
        assert_eq!(stats.probe_outcomes.get("mixer_exposure.timeout"), Some(&2));
        assert_eq!(stats.simulations_reverted, 1);
    }

    #[test]
    fn test_json_export() {
        let json = ScanTelemetry::new().snapshot().to_json();
        assert!(json.contains("scansStarted"));
    }

    #[test]
    fn test_export_to_file() {
        let dir = std::env::temp_dir().join(format!("guardian-telemetry-{}", uuid::Uuid::new_v4()));
        let telemetry = ScanTelemetry::new();
        telemetry.record_rate_limited();

        let path = telemetry.export_stats_json(&dir).unwrap();
        let stats: TelemetryStats =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stats.rate_limited, 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
