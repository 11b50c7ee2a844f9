//! PostgreSQL scan store
//!
//! Rows live in the `scans` table (see `migrations/`). Last-write-wins is
//! enforced by the guarded `ON CONFLICT ... DO UPDATE ... WHERE` clause:
//! Postgres locks the conflicting row and re-checks the predicate against
//! its latest committed version, so racing writers cannot lose an update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scanstate_common::{Scan, ScanKey};
use sqlx::PgPool;
use tracing::trace;

use super::{observed_at, ScanStore, StoreResult, StoredScan, UpsertOutcome};

const UPSERT_SCAN: &str = r#"
    INSERT INTO scans AS s (ip, port, service, data, updated_at)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (ip, port, service) DO UPDATE SET
        data = EXCLUDED.data,
        updated_at = EXCLUDED.updated_at
    WHERE EXCLUDED.updated_at > s.updated_at
"#;

const SELECT_SCAN: &str = r#"
    SELECT data, updated_at
    FROM scans
    WHERE ip = $1 AND port = $2 AND service = $3
"#;

#[derive(Debug, Clone)]
pub struct PgScanStore {
    pool: PgPool,
}

impl PgScanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScanStore for PgScanStore {
    async fn upsert(&self, scan: &Scan) -> StoreResult<UpsertOutcome> {
        let updated_at = observed_at(scan)?;

        let result = sqlx::query(UPSERT_SCAN)
            .bind(scan.ip.to_string())
            .bind(i32::from(scan.port))
            .bind(&scan.service)
            .bind(&scan.data)
            .bind(updated_at)
            .execute(&self.pool)
            .await?;

        let outcome = if result.rows_affected() == 0 {
            UpsertOutcome::Stale
        } else {
            UpsertOutcome::Written
        };

        trace!(ip = %scan.ip, port = scan.port, service = %scan.service, ?outcome, "Scan upserted");

        Ok(outcome)
    }

    async fn get(&self, key: &ScanKey) -> StoreResult<Option<StoredScan>> {
        let row: Option<(Vec<u8>, DateTime<Utc>)> = sqlx::query_as(SELECT_SCAN)
            .bind(key.ip.to_string())
            .bind(i32::from(key.port))
            .bind(&key.service)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(data, updated_at)| StoredScan {
            key: key.clone(),
            data,
            updated_at,
        }))
    }
}
