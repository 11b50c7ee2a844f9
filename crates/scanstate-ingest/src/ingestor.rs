//! Queue-driven scan ingestion
//!
//! [`Ingestor::run`] pulls deliveries from a [`Subscription`] and handles each
//! one in its own task: decode, upsert, then ack on success or nack on any
//! error. Ordering is left entirely to the store's recency check, so the
//! ingestor never serializes messages, not even for the same key.
//!
//! Shutdown is driven by a [`CancellationToken`]. Once it fires, no further
//! message is taken, handlers already running are awaited, and the
//! subscription is closed before the run returns its statistics.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use scanstate_common::ScanKey;

use crate::decoder::{DecodeError, ScanDecoder};
use crate::queue::{InboundMessage, Subscription};
use crate::report::Reporter;
use crate::store::{ScanStore, StoreError, UpsertOutcome};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;
pub const DEFAULT_RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Why a message was rejected
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestorConfig {
    /// Upper bound on concurrently running handlers
    pub max_in_flight: usize,
    /// Pause after a failed receive before trying again
    pub receive_backoff: Duration,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            receive_backoff: DEFAULT_RECEIVE_BACKOFF,
        }
    }
}

/// Counters for one ingestor, summed over all runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    /// Acknowledged after changing the store
    pub written: u64,
    /// Acknowledged without a change (an equal or newer scan was stored)
    pub stale: u64,
    pub decode_rejected: u64,
    pub store_rejected: u64,
    pub settle_failures: u64,
    pub receive_errors: u64,
    /// Deliveries whose processing panicked; each one was nacked
    pub handler_panics: u64,
}

impl IngestStats {
    pub fn acknowledged(&self) -> u64 {
        self.written + self.stale
    }

    pub fn rejected(&self) -> u64 {
        self.decode_rejected + self.store_rejected
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    written: AtomicU64,
    stale: AtomicU64,
    decode_rejected: AtomicU64,
    store_rejected: AtomicU64,
    settle_failures: AtomicU64,
    receive_errors: AtomicU64,
    handler_panics: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            decode_rejected: self.decode_rejected.load(Ordering::Relaxed),
            store_rejected: self.store_rejected.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

struct Inner<S, R> {
    decoder: ScanDecoder,
    store: S,
    reporter: R,
    config: IngestorConfig,
    counters: Counters,
}

/// Cheap to clone; clones share the decoder, store, reporter and counters.
pub struct Ingestor<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for Ingestor<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, R> std::fmt::Debug for Ingestor<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("decoder", &self.inner.decoder)
            .field("config", &self.inner.config)
            .field("stats", &self.inner.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl<S, R> Ingestor<S, R>
where
    S: ScanStore + 'static,
    R: Reporter,
{
    pub fn new(decoder: ScanDecoder, store: S, reporter: R, config: IngestorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                decoder,
                store,
                reporter,
                config,
                counters: Counters::default(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn reporter(&self) -> &R {
        &self.inner.reporter
    }

    pub fn stats(&self) -> IngestStats {
        self.inner.counters.snapshot()
    }

    /// Decode `body` and apply it to the store. The store is only reached
    /// when decoding succeeds.
    pub async fn process(&self, body: &[u8]) -> Result<(ScanKey, UpsertOutcome), IngestError> {
        let scan = self.inner.decoder.decode(body)?;
        let outcome = self.inner.store.upsert(&scan).await?;
        Ok((scan.key(), outcome))
    }

    /// Process one delivery and settle it exactly once
    pub async fn handle<M: InboundMessage>(&self, message: M) {
        let inner = &*self.inner;
        let message_id = message.id().to_owned();

        Counters::bump(&inner.counters.received);
        inner
            .reporter
            .received(&message_id, message.delivery_attempt());

        let processed = AssertUnwindSafe(self.process(message.body()))
            .catch_unwind()
            .await;

        match processed {
            Ok(Ok((key, outcome))) => {
                match outcome {
                    UpsertOutcome::Written => Counters::bump(&inner.counters.written),
                    UpsertOutcome::Stale => Counters::bump(&inner.counters.stale),
                }
                match message.ack().await {
                    Ok(()) => inner.reporter.acknowledged(&message_id, &key, outcome),
                    Err(e) => {
                        Counters::bump(&inner.counters.settle_failures);
                        inner.reporter.settle_failed(&message_id, &e);
                    }
                }
            }
            Ok(Err(err)) => {
                match &err {
                    IngestError::Decode(_) => Counters::bump(&inner.counters.decode_rejected),
                    IngestError::Store(_) => Counters::bump(&inner.counters.store_rejected),
                }
                inner.reporter.rejected(&message_id, &err);
                self.reject(message, &message_id).await;
            }
            Err(panic) => {
                Counters::bump(&inner.counters.handler_panics);
                inner
                    .reporter
                    .handler_panicked(&message_id, &panic_message(panic.as_ref()));
                self.reject(message, &message_id).await;
            }
        }
    }

    async fn reject<M: InboundMessage>(&self, message: M, message_id: &str) {
        if let Err(e) = message.nack().await {
            Counters::bump(&self.inner.counters.settle_failures);
            self.inner.reporter.settle_failed(message_id, &e);
        }
    }

    /// Consume `subscription` until it is exhausted or `shutdown` fires
    pub async fn run<Q>(&self, mut subscription: Q, shutdown: CancellationToken) -> IngestStats
    where
        Q: Subscription,
    {
        let config = self.inner.config;
        let permits = Arc::new(Semaphore::new(
            config.max_in_flight.clamp(1, Semaphore::MAX_PERMITS),
        ));
        let mut handlers = JoinSet::new();

        info!(max_in_flight = config.max_in_flight, "Ingestor started");

        loop {
            while let Some(result) = handlers.try_join_next() {
                self.reap(result);
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = subscription.next() => next,
            };

            match next {
                Ok(Some(message)) => {
                    let ingestor = self.clone();
                    handlers.spawn(async move {
                        let _permit = permit;
                        ingestor.handle(message).await;
                    });
                }
                Ok(None) => {
                    info!("Subscription exhausted");
                    break;
                }
                Err(e) => {
                    drop(permit);
                    Counters::bump(&self.inner.counters.receive_errors);
                    self.inner.reporter.receive_failed(&e);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(config.receive_backoff) => {}
                    }
                }
            }
        }

        if !handlers.is_empty() {
            info!(in_flight = handlers.len(), "Waiting for in-flight handlers");
        }
        while let Some(result) = handlers.join_next().await {
            self.reap(result);
        }

        if let Err(e) = subscription.close().await {
            warn!(error = %e, "Failed to close subscription");
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            written = stats.written,
            stale = stats.stale,
            rejected = stats.rejected(),
            settle_failures = stats.settle_failures,
            "Ingestor stopped"
        );
        stats
    }

    /// Panics inside `process` are caught in `handle`; anything reaching
    /// here escaped from settlement or the reporter itself.
    fn reap(&self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "Message task panicked outside processing");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
