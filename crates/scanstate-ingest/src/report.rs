//! Per-message outcome reporting
//!
//! The ingestor hands every outcome to a [`Reporter`]. The default
//! [`TracingReporter`] turns them into structured `tracing` events; tests
//! substitute a recording implementation.

use scanstate_common::ScanKey;
use tracing::{debug, error, trace, warn};

use crate::decoder::DecodeError;
use crate::ingestor::IngestError;
use crate::queue::QueueError;
use crate::store::UpsertOutcome;

pub trait Reporter: Send + Sync + 'static {
    fn received(&self, _message_id: &str, _attempt: u32) {}

    /// The message was applied (or found stale) and acknowledged
    fn acknowledged(&self, message_id: &str, key: &ScanKey, outcome: UpsertOutcome);

    /// The message was rejected and handed back to the queue
    fn rejected(&self, message_id: &str, error: &IngestError);

    /// Ack or nack itself failed; the queue will redeliver on its own terms
    fn settle_failed(&self, message_id: &str, error: &QueueError);

    fn receive_failed(&self, error: &QueueError);

    /// Processing panicked; the message was handed back to the queue
    fn handler_panicked(&self, message_id: &str, detail: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn received(&self, message_id: &str, attempt: u32) {
        trace!(message_id, attempt, "Message received");
    }

    fn acknowledged(&self, message_id: &str, key: &ScanKey, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Written => debug!(message_id, key = %key, "Scan stored"),
            UpsertOutcome::Stale => debug!(message_id, key = %key, "Stale scan ignored"),
        }
    }

    fn rejected(&self, message_id: &str, err: &IngestError) {
        match err {
            IngestError::Decode(DecodeError::UnsupportedVersion(version)) => error!(
                message_id,
                data_version = %version,
                "Rejected message with unsupported data version"
            ),
            IngestError::Decode(decode) => warn!(
                message_id,
                kind = decode.kind(),
                error = %decode,
                "Rejected undecodable message"
            ),
            IngestError::Store(store) => error!(
                message_id,
                error = %store,
                "Failed to store scan, message rejected"
            ),
        }
    }

    fn settle_failed(&self, message_id: &str, err: &QueueError) {
        error!(message_id, error = %err, "Failed to settle message");
    }

    fn receive_failed(&self, err: &QueueError) {
        warn!(error = %err, "Failed to receive message");
    }

    fn handler_panicked(&self, message_id: &str, detail: &str) {
        error!(message_id, panic = detail, "Message handler panicked, message rejected");
    }
}
