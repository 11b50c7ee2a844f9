//! Last-write-wins persistence of scan state
//!
//! A [`ScanStore`] keeps one row per natural key `(ip, port, service)`.
//! [`ScanStore::upsert`] inserts a missing row, or overwrites an existing
//! one only when the incoming scan is strictly newer. The comparison and the
//! write happen in one atomic step inside the store, so callers never lock
//! and concurrent or reordered deliveries converge on the newest scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scanstate_common::{Scan, ScanKey};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryScanStore;
pub use postgres::PgScanStore;

/// Store operation errors. None of them leave a partial write behind.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection, pool, or statement failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The record cannot be represented by the store
    #[error("Invalid record {key}: {reason}")]
    InvalidRecord { key: ScanKey, reason: String },
}

impl StoreError {
    pub fn invalid(key: ScanKey, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            key,
            reason: reason.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a successful upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Row inserted, or overwritten by a newer scan
    Written,
    /// Stored row is as new or newer; nothing changed
    Stale,
}

/// Current persisted state of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredScan {
    pub key: ScanKey,
    pub data: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Persist `scan` if it is newer than what is stored for its key
    async fn upsert(&self, scan: &Scan) -> StoreResult<UpsertOutcome>;

    /// Read the stored row for `key`
    async fn get(&self, key: &ScanKey) -> StoreResult<Option<StoredScan>>;
}

#[async_trait]
impl<T: ScanStore + ?Sized> ScanStore for std::sync::Arc<T> {
    async fn upsert(&self, scan: &Scan) -> StoreResult<UpsertOutcome> {
        (**self).upsert(scan).await
    }

    async fn get(&self, key: &ScanKey) -> StoreResult<Option<StoredScan>> {
        (**self).get(key).await
    }
}

/// `scan.timestamp` as a store timestamp
pub(crate) fn observed_at(scan: &Scan) -> StoreResult<DateTime<Utc>> {
    scan.observed_at()
        .ok_or_else(|| StoreError::invalid(scan.key(), format!("timestamp {} out of range", scan.timestamp)))
}
