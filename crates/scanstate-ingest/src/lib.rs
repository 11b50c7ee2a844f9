//! Scanstate Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Consumes scan messages from a queue and keeps the latest known state of
//! every `(ip, port, service)` endpoint.
//!
//! # Components
//!
//! - [`decoder`]: versioned JSON message decoding into [`Scan`] records
//! - [`store`]: last-write-wins persistence keyed by endpoint
//! - [`queue`]: subscription and settlement abstraction plus implementations
//! - [`ingestor`]: the concurrent receive loop tying the three together
//!
//! # Example
//!
//! ```no_run
//! use scanstate_ingest::{
//!     Ingestor, IngestorConfig, MemoryQueue, MemoryScanStore, ScanDecoder, TracingReporter,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let queue = MemoryQueue::new();
//!     queue.publish(r#"{"ip":"1.2.3.4","port":80,"service":"http","data_version":2,"data":"hello","timestamp":100}"#);
//!     queue.close();
//!
//!     let ingestor = Ingestor::new(
//!         ScanDecoder::default(),
//!         MemoryScanStore::new(),
//!         TracingReporter,
//!         IngestorConfig::default(),
//!     );
//!     let stats = ingestor.run(queue.subscribe()?, CancellationToken::new()).await;
//!     assert_eq!(stats.written, 1);
//!     Ok(())
//! }
//! ```
//!
//! [`Scan`]: scanstate_common::Scan

pub mod config;
pub mod db;
pub mod decoder;
pub mod ingestor;
pub mod queue;
pub mod report;
pub mod store;

pub use config::Config;
pub use decoder::{DecodeError, PayloadRule, ScanDecoder};
pub use ingestor::{IngestError, IngestStats, Ingestor, IngestorConfig};
pub use queue::{InboundMessage, MemoryQueue, PgQueue, QueueError, Subscription};
pub use report::{Reporter, TracingReporter};
pub use store::{MemoryScanStore, PgScanStore, ScanStore, StoreError, UpsertOutcome};
