//! Evidence Cache Module
//!
//! Thread-safe evidence store shared by all probes.
//! Uses DashMap for concurrent access without lock contention.
//!
//! Features:
//! - Per-entry TTL taken from the evidence itself
//! - Expired entries kept for a retention window as stale fallback
//! - Capacity bound with oldest-first eviction
//! - Key normalization (lowercase address)
//! - Hit / stale / miss counters

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::Evidence;

/// Cache key: probe name, lowercase subject, chain
type EvidenceKey = (String, String, u64);

/// Global evidence cache
#[derive(Clone)]
pub struct EvidenceCache {
    store: Arc<DashMap<EvidenceKey, Evidence>>,
    /// How long past its TTL an entry is still served as stale
    stale_retention: Duration,
    capacity: usize,
    hits: Arc<AtomicU64>,
    stale_hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl EvidenceCache {
    pub fn new(capacity: usize, stale_retention: Duration) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            stale_retention,
            capacity: capacity.max(1),
            hits: Arc::new(AtomicU64::new(0)),
            stale_hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    fn key(probe: &str, subject: &Address, chain_id: u64) -> EvidenceKey {
        (
            probe.to_string(),
            subject.to_string().to_lowercase(),
            chain_id,
        )
    }

    fn is_retained(&self, evidence: &Evidence, now: DateTime<Utc>) -> bool {
        evidence.age_secs_at(now)
            <= evidence.ttl_seconds as f64 + self.stale_retention.as_secs_f64()
    }

    /// Evidence still within its TTL
    pub fn get_fresh(&self, probe: &str, subject: &Address, chain_id: u64) -> Option<Evidence> {
        let key = Self::key(probe, subject, chain_id);
        match self.store.get(&key) {
            Some(entry) if !entry.is_stale() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("✅ EVIDENCE HIT: {}/{} chain {}", key.0, key.1, chain_id);
                Some(entry.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("📭 EVIDENCE MISS: {}/{} chain {}", key.0, key.1, chain_id);
                None
            }
        }
    }

    /// Any retained evidence, fresh or expired; used when the live fetch failed
    pub fn get_any(&self, probe: &str, subject: &Address, chain_id: u64) -> Option<Evidence> {
        let key = Self::key(probe, subject, chain_id);
        let now = Utc::now();

        let entry = self.store.get(&key)?;
        if !self.is_retained(&entry, now) {
            drop(entry);
            self.store.remove(&key);
            return None;
        }
        if entry.is_stale_at(now) {
            self.stale_hits.fetch_add(1, Ordering::Relaxed);
            info!(
                "♻️ STALE EVIDENCE served: {}/{} (age {:.0}s, ttl {}s)",
                key.0,
                key.1,
                entry.age_secs_at(now),
                entry.ttl_seconds
            );
        }
        Some(entry.clone())
    }

    /// Store evidence, evicting the oldest entries when over capacity
    pub fn insert(&self, probe: &str, subject: &Address, chain_id: u64, evidence: Evidence) {
        let key = Self::key(probe, subject, chain_id);
        if !self.store.contains_key(&key) && self.store.len() >= self.capacity {
            self.sweep();
            while self.store.len() >= self.capacity {
                if !self.evict_oldest() {
                    break;
                }
            }
        }
        debug!("💾 EVIDENCE SET: {}/{} (TTL: {}s)", key.0, key.1, evidence.ttl_seconds);
        self.store.insert(key, evidence);
    }

    fn evict_oldest(&self) -> bool {
        let oldest = self
            .store
            .iter()
            .min_by_key(|entry| entry.value().observed_at)
            .map(|entry| entry.key().clone());
        match oldest {
            Some(key) => {
                self.store.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drop entries past TTL plus stale retention
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.store.len();
        let retention = self.stale_retention.as_secs_f64();
        self.store
            .retain(|_, ev| ev.age_secs_at(now) <= ev.ttl_seconds as f64 + retention);
        let removed = before.saturating_sub(self.store.len());
        if removed > 0 {
            info!("🧹 EVIDENCE SWEEP: {} expired entries removed", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            entries: self.store.len(),
            capacity: self.capacity,
            hits,
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate,
        }
    }
}

/// Cache statistics for /v1/stats
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> Address {
        Address::repeat_byte(0xab)
    }

    fn evidence(source: &str, age_secs: i64, ttl: u64) -> Evidence {
        let mut ev = Evidence::new(source, ttl, serde_json::json!({ "n": age_secs }));
        ev.observed_at = Utc::now() - chrono::Duration::seconds(age_secs);
        ev
    }

    #[test]
    fn test_fresh_hit() {
        let cache = EvidenceCache::new(10, Duration::from_secs(3600));
        cache.insert("approvals", &subject(), 1, evidence("alchemy", 0, 300));
        assert!(cache.get_fresh("approvals", &subject(), 1).is_some());
        assert!(cache.get_fresh("approvals", &subject(), 10).is_none());
        assert!(cache.get_fresh("transfers", &subject(), 1).is_none());
    }

    #[test]
    fn test_expired_is_served_only_as_stale() {
        let cache = EvidenceCache::new(10, Duration::from_secs(3600));
        cache.insert("approvals", &subject(), 1, evidence("alchemy", 400, 300));

        assert!(cache.get_fresh("approvals", &subject(), 1).is_none());
        let stale = cache.get_any("approvals", &subject(), 1).unwrap();
        assert!(stale.is_stale());
        assert_eq!(cache.stats().stale_hits, 1);
    }

    #[test]
    fn test_beyond_retention_is_gone() {
        let cache = EvidenceCache::new(10, Duration::from_secs(60));
        cache.insert("approvals", &subject(), 1, evidence("alchemy", 1000, 300));
        assert!(cache.get_any("approvals", &subject(), 1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = EvidenceCache::new(2, Duration::from_secs(3600));
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let c = Address::repeat_byte(3);
        cache.insert("approvals", &a, 1, evidence("alchemy", 30, 300));
        cache.insert("approvals", &b, 1, evidence("alchemy", 10, 300));
        cache.insert("approvals", &c, 1, evidence("alchemy", 0, 300));

        assert_eq!(cache.len(), 2);
        assert!(cache.get_any("approvals", &a, 1).is_none());
        assert!(cache.get_any("approvals", &c, 1).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_sweep() {
        let cache = EvidenceCache::new(10, Duration::from_secs(10));
        cache.insert("approvals", &Address::repeat_byte(1), 1, evidence("alchemy", 500, 300));
        cache.insert("approvals", &Address::repeat_byte(2), 1, evidence("alchemy", 5, 300));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
    }
}
