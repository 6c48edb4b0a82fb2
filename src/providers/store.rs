//! Scan result persistence
//!
//! Completed sessions are written as `ScanRecord`s, indexed by subject/chain
//! (latest scan) and by request id. Saving the same request twice is a no-op.

use alloy_primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::kv::KvStore;
use crate::models::{AppError, AppResult, ErrorCode, ScanRecord};

#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn save(&self, record: &ScanRecord) -> AppResult<()>;

    /// Most recent completed scan of a subject
    async fn latest(&self, subject: Address, chain_id: u64) -> AppResult<Option<ScanRecord>>;

    async fn by_request_id(&self, request_id: &str) -> AppResult<Option<ScanRecord>>;
}

/// `ScanStore` over the shared KV store
pub struct KvScanStore {
    kv: Arc<dyn KvStore>,
    retention: Option<Duration>,
}

impl KvScanStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            retention: None,
        }
    }

    /// Expire records after `retention`
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    fn latest_key(subject: &Address, chain_id: u64) -> String {
        format!(
            "guardian:scan:latest:{}:{}",
            chain_id,
            subject.to_string().to_lowercase()
        )
    }

    fn request_key(request_id: &str) -> String {
        format!("guardian:scan:req:{}", request_id)
    }

    async fn read(&self, key: &str) -> AppResult<Option<ScanRecord>> {
        match self.kv.get(key).await? {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                AppError::with_source(ErrorCode::StoreUnavailable, "Corrupt scan record", e)
            }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ScanStore for KvScanStore {
    async fn save(&self, record: &ScanRecord) -> AppResult<()> {
        if let Some(existing) = self.by_request_id(&record.request_id).await? {
            if existing.session_id == record.session_id {
                debug!("Scan record {} already persisted", record.request_id);
                return Ok(());
            }
        }

        let body = serde_json::to_string(record)
            .map_err(|e| AppError::internal(format!("Cannot encode scan record: {}", e)))?;

        self.kv
            .set(&Self::request_key(&record.request_id), &body, self.retention)
            .await?;

        // never replace a newer scan with an older one
        let latest_key = Self::latest_key(&record.subject_address, record.chain_id);
        let newer_exists = self
            .read(&latest_key)
            .await?
            .map(|current| current.scanned_at > record.scanned_at)
            .unwrap_or(false);
        if !newer_exists {
            self.kv.set(&latest_key, &body, self.retention).await?;
        }

        info!(
            "🗄️ Persisted scan {} (score {:.1}, confidence {:.2})",
            record.request_id, record.aggregate_score, record.confidence
        );
        Ok(())
    }

    async fn latest(&self, subject: Address, chain_id: u64) -> AppResult<Option<ScanRecord>> {
        self.read(&Self::latest_key(&subject, chain_id)).await
    }

    async fn by_request_id(&self, request_id: &str) -> AppResult<Option<ScanRecord>> {
        self.read(&Self::request_key(request_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::kv::MemoryKvStore;
    use chrono::Utc;

    fn record(request_id: &str, score: f64, minutes_ago: i64) -> ScanRecord {
        ScanRecord {
            subject_address: Address::repeat_byte(0x11),
            chain_id: 1,
            aggregate_score: score,
            confidence: 1.0,
            request_id: request_id.to_string(),
            session_id: format!("session-{}", request_id),
            scanned_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn test_save_and_lookup() {
        let store = KvScanStore::new(Arc::new(MemoryKvStore::new()));
        store.save(&record("r1", 42.0, 0)).await.unwrap();

        let latest = store.latest(Address::repeat_byte(0x11), 1).await.unwrap().unwrap();
        assert_eq!(latest.request_id, "r1");
        assert!(store.by_request_id("r1").await.unwrap().is_some());
        assert!(store.latest(Address::repeat_byte(0x11), 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_older_record_does_not_replace_latest() {
        let store = KvScanStore::new(Arc::new(MemoryKvStore::new()));
        store.save(&record("new", 10.0, 0)).await.unwrap();
        store.save(&record("old", 90.0, 30)).await.unwrap();

        let latest = store.latest(Address::repeat_byte(0x11), 1).await.unwrap().unwrap();
        assert_eq!(latest.request_id, "new");
        assert!(store.by_request_id("old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = KvScanStore::new(Arc::new(MemoryKvStore::new()));
        let r = record("r1", 42.0, 0);
        store.save(&r).await.unwrap();
        store.save(&r).await.unwrap();
        assert_eq!(store.by_request_id("r1").await.unwrap(), Some(r));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_expire_after_retention() {
        let store = KvScanStore::new(Arc::new(MemoryKvStore::new()))
            .with_retention(Duration::from_secs(60));
        store.save(&record("r1", 42.0, 0)).await.unwrap();
        assert!(store.by_request_id("r1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.by_request_id("r1").await.unwrap().is_none());
        assert!(store.latest(Address::repeat_byte(0x11), 1).await.unwrap().is_none());
    }
}
