//! In-process scan store
//!
//! Backs tests and the binary's dry-run mode. The recency check and the write
//! run under a single write guard, which gives the same atomicity as the
//! conditional statement used by the Postgres store.

use async_trait::async_trait;
use scanstate_common::{Scan, ScanKey};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{observed_at, ScanStore, StoreResult, StoredScan, UpsertOutcome};

#[derive(Debug, Default)]
pub struct MemoryScanStore {
    rows: RwLock<HashMap<ScanKey, StoredScan>>,
}

impl MemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored endpoints
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Copy of every stored row
    pub async fn snapshot(&self) -> Vec<StoredScan> {
        self.rows.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ScanStore for MemoryScanStore {
    async fn upsert(&self, scan: &Scan) -> StoreResult<UpsertOutcome> {
        let updated_at = observed_at(scan)?;
        let key = scan.key();

        let mut rows = self.rows.write().await;
        match rows.get_mut(&key) {
            Some(row) if updated_at <= row.updated_at => Ok(UpsertOutcome::Stale),
            Some(row) => {
                row.data = scan.data.clone();
                row.updated_at = updated_at;
                Ok(UpsertOutcome::Written)
            }
            None => {
                rows.insert(
                    key.clone(),
                    StoredScan {
                        key,
                        data: scan.data.clone(),
                        updated_at,
                    },
                );
                Ok(UpsertOutcome::Written)
            }
        }
    }

    async fn get(&self, key: &ScanKey) -> StoreResult<Option<StoredScan>> {
        Ok(self.rows.read().await.get(key).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use scanstate_common::DataVersion;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn scan(data: &str, timestamp: i64) -> Scan {
        Scan {
            ip: Ipv4Addr::new(1, 2, 3, 4),
            port: 80,
            service: "http".to_string(),
            data_version: DataVersion::V2,
            data: data.as_bytes().to_vec(),
            timestamp,
        }
    }

    async fn stored(store: &MemoryScanStore) -> StoredScan {
        store.get(&scan("", 0).key()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_insert_then_newer_overwrites() {
        let store = MemoryScanStore::new();

        assert_eq!(store.upsert(&scan("a", 1)).await.unwrap(), UpsertOutcome::Written);
        assert_eq!(store.upsert(&scan("b", 2)).await.unwrap(), UpsertOutcome::Written);
        assert_eq!(store.upsert(&scan("c", 3)).await.unwrap(), UpsertOutcome::Written);

        let row = stored(&store).await;
        assert_eq!(row.data, b"c");
        assert_eq!(row.updated_at.timestamp(), 3);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_out_of_order_keeps_maximum() {
        let store = MemoryScanStore::new();

        store.upsert(&scan("c", 3)).await.unwrap();
        assert_eq!(store.upsert(&scan("b", 2)).await.unwrap(), UpsertOutcome::Stale);
        assert_eq!(store.upsert(&scan("a", 1)).await.unwrap(), UpsertOutcome::Stale);

        let row = stored(&store).await;
        assert_eq!(row.data, b"c");
        assert_eq!(row.updated_at.timestamp(), 3);
    }

    #[tokio::test]
    async fn test_equal_timestamp_is_noop() {
        let store = MemoryScanStore::new();

        store.upsert(&scan("first", 10)).await.unwrap();
        assert_eq!(
            store.upsert(&scan("second", 10)).await.unwrap(),
            UpsertOutcome::Stale
        );
        assert_eq!(stored(&store).await.data, b"first");
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = MemoryScanStore::new();
        let mut other = scan("ssh", 1);
        other.port = 22;
        other.service = "ssh".to_string();

        store.upsert(&scan("http", 5)).await.unwrap();
        store.upsert(&other).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(stored(&store).await.data, b"http");
        assert_eq!(store.get(&other.key()).await.unwrap().unwrap().data, b"ssh");
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_is_rejected() {
        let store = MemoryScanStore::new();
        let err = store.upsert(&scan("x", i64::MAX)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_converge_on_max() {
        let store = Arc::new(MemoryScanStore::new());
        let mut handles = Vec::new();

        // Interleave timestamps so that arrival order differs from recency
        for ts in (1..=200).map(|i: i64| (i * 37) % 200 + 1) {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(&scan(&format!("v{ts}"), ts)).await.unwrap()
            }));
        }

        let mut written = 0;
        for handle in handles {
            if handle.await.unwrap() == UpsertOutcome::Written {
                written += 1;
            }
        }

        let row = stored(&store).await;
        assert_eq!(row.data, b"v200");
        assert_eq!(row.updated_at.timestamp(), 200);
        assert!(written >= 1);
    }
}
