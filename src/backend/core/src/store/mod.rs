//! Result store: job records keyed by job id, each expiring after the result TTL.

pub mod backend;

pub use backend::{connect_manager, InMemoryStore, RedisStore, ResultStore, StoreStats};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::jobs::{JobId, JobRecord};
use crate::observability::metrics::record_store_op;

/// Typed access to [`JobRecord`]s on top of a [`ResultStore`].
#[derive(Clone)]
pub struct JobStore {
    backend: Arc<dyn ResultStore>,
    ttl: Duration,
}

impl JobStore {
    pub fn new(backend: Arc<dyn ResultStore>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryStore::new()), ttl)
    }

    pub fn backend(&self) -> &Arc<dyn ResultStore> {
        &self.backend
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(id: JobId) -> String {
        format!("job:{}", id)
    }

    pub async fn load(&self, id: JobId) -> Result<Option<JobRecord>> {
        record_store_op("load");
        match self.backend.get(&Self::key(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load several records in one round trip, in the order of `ids`.
    pub async fn load_many(&self, ids: &[JobId]) -> Result<Vec<Option<JobRecord>>> {
        record_store_op("load_many");
        let keys: Vec<String> = ids.iter().map(|id| Self::key(*id)).collect();
        self.backend
            .get_many(&keys)
            .await?
            .into_iter()
            .map(|value| match value {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            })
            .collect()
    }

    /// Write the record, refreshing its expiry.
    pub async fn save(&self, record: &mut JobRecord) -> Result<()> {
        record_store_op("save");
        record.expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);
        let bytes = serde_json::to_vec(record)?;
        self.backend.set(&Self::key(record.id), bytes, self.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobFailure, JobKind};

    #[tokio::test]
    async fn test_save_and_load_record() {
        let store = JobStore::in_memory(Duration::from_secs(3600));
        let mut record = JobRecord::pending(JobId::new(), JobKind::Convert, Utc::now());
        record.mark_processing().unwrap();
        store.save(&mut record).await.unwrap();

        let loaded = store.load(record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(loaded.expires_at.is_some());
        assert!(store.load(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_many() {
        let store = JobStore::in_memory(Duration::from_secs(3600));
        let mut a = JobRecord::pending(JobId::new(), JobKind::Convert, Utc::now());
        a.mark_processing().unwrap();
        a.mark_failed(JobFailure::conversion("bad input")).unwrap();
        store.save(&mut a).await.unwrap();

        let missing = JobId::new();
        let records = store.load_many(&[missing, a.id]).await.unwrap();
        assert!(records[0].is_none());
        assert_eq!(records[1].as_ref().map(|r| r.id), Some(a.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_expire_after_ttl() {
        let store = JobStore::in_memory(Duration::from_secs(60));
        let mut record = JobRecord::pending(JobId::new(), JobKind::Convert, Utc::now());
        store.save(&mut record).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.load(record.id).await.unwrap().is_none());
    }
}
