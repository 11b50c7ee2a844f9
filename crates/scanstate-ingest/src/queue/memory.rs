//! In-process queue backed by a tokio channel
//!
//! Every ack and nack is recorded as a [`Settlement`] so tests can assert on
//! exactly how each delivery was resolved. Rejected messages can optionally
//! be delivered again, up to a fixed number of deliveries.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

use super::{InboundMessage, QueueError, QueueResult, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked,
}

/// How one delivery was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub message_id: String,
    pub attempt: u32,
    pub disposition: Disposition,
}

#[derive(Debug)]
struct Envelope {
    id: String,
    body: Vec<u8>,
    attempt: u32,
}

#[derive(Debug)]
struct Inner {
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    settlements: Mutex<Vec<Settlement>>,
    settled: watch::Sender<usize>,
    next_id: AtomicU64,
    max_deliveries: u32,
}

impl Inner {
    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Envelope>>> {
        self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, envelope: Envelope) -> bool {
        match self.sender().as_ref() {
            Some(sender) => sender.send(envelope).is_ok(),
            None => false,
        }
    }

    fn record(&self, settlement: Settlement) {
        let count = {
            let mut settlements = self
                .settlements
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            settlements.push(settlement);
            settlements.len()
        };
        self.settled.send_replace(count);
    }
}

/// Channel-backed queue. Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    /// Queue that never redelivers rejected messages
    pub fn new() -> Self {
        Self::with_max_deliveries(1)
    }

    /// Queue that redelivers a rejected message until it has been delivered
    /// `max_deliveries` times
    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                receiver: Mutex::new(Some(receiver)),
                settlements: Mutex::new(Vec::new()),
                settled,
                next_id: AtomicU64::new(1),
                max_deliveries: max_deliveries.max(1),
            }),
        }
    }

    /// Enqueue a message, returning its id. Returns `None` once the queue
    /// has been closed.
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Option<String> {
        let id = format!("mem-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let envelope = Envelope {
            id: id.clone(),
            body: body.into(),
            attempt: 1,
        };
        self.inner.send(envelope).then_some(id)
    }

    /// Stop accepting messages. The subscription drains what is already
    /// queued and then reports exhaustion.
    pub fn close(&self) {
        self.inner.sender().take();
    }

    /// Take the single subscription of this queue
    pub fn subscribe(&self) -> QueueResult<MemorySubscription> {
        let receiver = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(QueueError::AlreadySubscribed)?;

        Ok(MemorySubscription {
            receiver,
            inner: self.inner.clone(),
        })
    }

    /// Every settlement so far, in the order it happened
    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner
            .settlements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Dispositions recorded for `message_id`, oldest first
    pub fn dispositions_of(&self, message_id: &str) -> Vec<Disposition> {
        self.settlements()
            .into_iter()
            .filter(|s| s.message_id == message_id)
            .map(|s| s.disposition)
            .collect()
    }

    /// Wait until at least `count` settlements have been recorded
    pub async fn wait_for_settlements(&self, count: usize) {
        let mut settled = self.inner.settled.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = settled.wait_for(|n| *n >= count).await;
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MemorySubscription {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    type Message = MemoryMessage;

    async fn next(&mut self) -> QueueResult<Option<MemoryMessage>> {
        Ok(self.receiver.recv().await.map(|envelope| MemoryMessage {
            envelope,
            inner: self.inner.clone(),
        }))
    }

    async fn close(&mut self) -> QueueResult<()> {
        self.receiver.close();
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryMessage {
    envelope: Envelope,
    inner: Arc<Inner>,
}

impl MemoryMessage {
    fn settle(self, disposition: Disposition) {
        self.inner.record(Settlement {
            message_id: self.envelope.id.clone(),
            attempt: self.envelope.attempt,
            disposition,
        });

        if disposition == Disposition::Nacked && self.envelope.attempt < self.inner.max_deliveries {
            let redelivery = Envelope {
                attempt: self.envelope.attempt + 1,
                ..self.envelope
            };
            self.inner.send(redelivery);
        }
    }
}

#[async_trait]
impl InboundMessage for MemoryMessage {
    fn id(&self) -> &str {
        &self.envelope.id
    }

    fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    fn delivery_attempt(&self) -> u32 {
        self.envelope.attempt
    }

    async fn ack(self) -> QueueResult<()> {
        self.settle(Disposition::Acked);
        Ok(())
    }

    async fn nack(self) -> QueueResult<()> {
        self.settle(Disposition::Nacked);
        Ok(())
    }
}
