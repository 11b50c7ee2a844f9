//! Durable queue in the `scan_messages` table
//!
//! A consumer claims the oldest visible message with `FOR UPDATE SKIP LOCKED`
//! and takes a lease on it: the row stays `pending` but becomes invisible
//! until the lease runs out, and it carries a fresh lease token. Acking
//! deletes the row; nacking releases the lease and pushes the row's
//! visibility out by an exponential back-off. A consumer that dies without
//! settling simply lets the lease expire, after which the message is claimed
//! again.
//!
//! Settlement is guarded by the lease token, so a consumer whose lease has
//! already passed to someone else gets [`QueueError::LeaseLost`] instead of
//! silently settling the other consumer's delivery.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{InboundMessage, QueueError, QueueResult, Subscription};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(300);

const INSERT_MESSAGE: &str = r#"
    INSERT INTO scan_messages (body)
    VALUES ($1)
    RETURNING id
"#;

const CLAIM_MESSAGE: &str = r#"
    UPDATE scan_messages
    SET attempts = attempts + 1,
        lease_token = $1,
        visible_at = NOW() + make_interval(secs => $2)
    WHERE id = (
        SELECT id
        FROM scan_messages
        WHERE status = 'pending' AND visible_at <= NOW()
        ORDER BY visible_at, id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING id, body, attempts
"#;

const ACK_MESSAGE: &str = r#"
    DELETE FROM scan_messages
    WHERE id = $1 AND lease_token = $2
"#;

const NACK_MESSAGE: &str = r#"
    UPDATE scan_messages
    SET status = CASE
            WHEN $3::INT > 0 AND attempts >= $3::INT THEN 'failed'::text
            ELSE 'pending'::text
        END,
        lease_token = NULL,
        visible_at = NOW() + make_interval(secs => $4),
        last_nacked_at = NOW()
    WHERE id = $1 AND lease_token = $2
    RETURNING status
"#;

const QUEUE_DEPTH: &str = r#"
    SELECT
        COUNT(*) FILTER (WHERE status = 'pending'),
        COUNT(*) FILTER (WHERE status = 'failed')
    FROM scan_messages
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgQueueConfig {
    /// Sleep between claim attempts while the queue is empty
    pub poll_interval: Duration,
    /// How long a claimed message stays invisible to other consumers
    pub lease: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Deliveries after which a rejected message is parked as `failed`.
    /// Zero retries forever.
    pub max_attempts: u32,
}

impl Default for PgQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease: DEFAULT_LEASE,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
            max_attempts: 0,
        }
    }
}

impl PgQueueConfig {
    /// Back-off applied after the `attempts`-th delivery is rejected:
    /// `retry_base * 2^(attempts - 1)`, capped at `retry_max`
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.retry_base.checked_mul(factor))
            .map_or(self.retry_max, |delay| delay.min(self.retry_max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: i64,
    pub failed: i64,
}

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    config: PgQueueConfig,
}

impl PgQueue {
    pub fn new(pool: PgPool, config: PgQueueConfig) -> Self {
        Self { pool, config }
    }

    /// Enqueue a message body, returning its id
    pub async fn publish(&self, body: &[u8]) -> QueueResult<i64> {
        let (id,): (i64,) = sqlx::query_as(INSERT_MESSAGE)
            .bind(body)
            .fetch_one(&self.pool)
            .await?;

        debug!(message_id = id, bytes = body.len(), "Message published");
        Ok(id)
    }

    pub async fn depth(&self) -> QueueResult<QueueDepth> {
        let (pending, failed): (i64, i64) =
            sqlx::query_as(QUEUE_DEPTH).fetch_one(&self.pool).await?;
        Ok(QueueDepth { pending, failed })
    }

    /// Claim one visible message, if any
    pub async fn claim(&self) -> QueueResult<Option<PgMessage>> {
        let lease_token = Uuid::new_v4();
        let row: Option<(i64, Vec<u8>, i32)> = sqlx::query_as(CLAIM_MESSAGE)
            .bind(lease_token)
            .bind(self.config.lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id, body, attempts)| PgMessage {
            id: id.to_string(),
            row_id: id,
            body,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            lease_token,
            queue: self.clone(),
        }))
    }

    pub fn subscribe(&self) -> PgSubscription {
        PgSubscription {
            queue: self.clone(),
        }
    }
}

/// Polls the table for visible messages. Never exhausts on its own; the
/// consumer stops it by cancellation.
#[derive(Debug)]
pub struct PgSubscription {
    queue: PgQueue,
}

#[async_trait]
impl Subscription for PgSubscription {
    type Message = PgMessage;

    async fn next(&mut self) -> QueueResult<Option<PgMessage>> {
        loop {
            if let Some(message) = self.queue.claim().await? {
                return Ok(Some(message));
            }
            tokio::time::sleep(self.queue.config.poll_interval).await;
        }
    }
}

#[derive(Debug)]
pub struct PgMessage {
    id: String,
    row_id: i64,
    body: Vec<u8>,
    attempts: u32,
    lease_token: Uuid,
    queue: PgQueue,
}

#[async_trait]
impl InboundMessage for PgMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_attempt(&self) -> u32 {
        self.attempts
    }

    async fn ack(self) -> QueueResult<()> {
        let result = sqlx::query(ACK_MESSAGE)
            .bind(self.row_id)
            .bind(self.lease_token)
            .execute(&self.queue.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(self.id));
        }
        Ok(())
    }

    async fn nack(self) -> QueueResult<()> {
        let config = &self.queue.config;
        let delay = config.retry_delay(self.attempts);
        let max_attempts = i32::try_from(config.max_attempts).unwrap_or(i32::MAX);

        let status: Option<(String,)> = sqlx::query_as(NACK_MESSAGE)
            .bind(self.row_id)
            .bind(self.lease_token)
            .bind(max_attempts)
            .bind(delay.as_secs_f64())
            .fetch_optional(&self.queue.pool)
            .await?;

        match status {
            None => Err(QueueError::LeaseLost(self.id)),
            Some((status,)) if status == "failed" => {
                error!(
                    message_id = %self.id,
                    attempts = self.attempts,
                    "Message failed after max attempts"
                );
                Ok(())
            }
            Some(_) => {
                warn!(
                    message_id = %self.id,
                    attempts = self.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "Message rejected, will retry"
                );
                Ok(())
            }
        }
    }
}
