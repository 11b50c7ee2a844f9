//! Newline-delimited messages from an async reader
//!
//! Used to replay captured scan messages (one JSON object per line) through
//! the ingestor, typically from stdin. There is no broker behind it, so a
//! rejected line cannot be redelivered; rejection is only logged.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use super::{InboundMessage, QueueResult, Subscription};

#[derive(Debug)]
pub struct LinesSubscription<R> {
    reader: R,
    line_number: u64,
}

impl<R> LinesSubscription<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_number: 0,
        }
    }
}

#[async_trait]
impl<R> Subscription for LinesSubscription<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    type Message = LineMessage;

    async fn next(&mut self) -> QueueResult<Option<LineMessage>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(LineMessage {
                    id: format!("line-{}", self.line_number),
                    body: trimmed.as_bytes().to_vec(),
                }));
            }
        }
    }
}

#[derive(Debug)]
pub struct LineMessage {
    id: String,
    body: Vec<u8>,
}

#[async_trait]
impl InboundMessage for LineMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_attempt(&self) -> u32 {
        1
    }

    async fn ack(self) -> QueueResult<()> {
        debug!(message_id = %self.id, "Line consumed");
        Ok(())
    }

    async fn nack(self) -> QueueResult<()> {
        warn!(message_id = %self.id, "Line rejected; replay cannot redeliver it");
        Ok(())
    }
}
