use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;

use crate::queue::{DeleteOutcome, Delivery, DeliveryToken, Driver};

/// In-memory queue backend for testing or local pipelines.
///
/// Implements the full [`Driver`] contract with real visibility-timeout
/// semantics: a dequeued message stays hidden until its deadline and gets a
/// fresh pop receipt on every dequeue, so stale-token acknowledgment
/// behaves the way a cloud queue behaves.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDriver {
    queues: Arc<Mutex<HashMap<String, Vec<Stored>>>>,
}

#[derive(Debug)]
struct Stored {
    message_id: Uuid,
    body: Vec<u8>,
    visible_at: Instant,
    receipt: Uuid,
    delivery_count: u32,
}

impl InMemoryDriver {
    /// Number of messages currently stored in a queue, visible or not.
    ///
    /// Primarily intended for tests.
    pub async fn stored_count(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Driver for InMemoryDriver {
    type Error = InMemoryDriverError;

    async fn create_queue_if_missing(&self, queue: &str) -> Result<(), Self::Error> {
        self.queues
            .lock()
            .await
            .entry(queue.to_owned())
            .or_default();
        Ok(())
    }

    #[tracing::instrument(skip(self, body))]
    async fn enqueue(&self, queue: &str, body: Vec<u8>) -> Result<String, Self::Error> {
        let mut queues = self.queues.lock().await;
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| InMemoryDriverError::queue_not_found(queue))?;
        let message_id = Uuid::new_v4();
        messages.push(Stored {
            message_id,
            body,
            visible_at: Instant::now(),
            receipt: Uuid::new_v4(),
            delivery_count: 0,
        });
        tracing::debug!(%message_id, "Message enqueued to in-memory queue");
        Ok(message_id.to_string())
    }

    async fn dequeue(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<Delivery>, Self::Error> {
        let mut queues = self.queues.lock().await;
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| InMemoryDriverError::queue_not_found(queue))?;

        let now = Instant::now();
        let mut batch = Vec::new();
        for stored in messages.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if stored.visible_at > now {
                continue;
            }
            stored.visible_at = now + visibility;
            stored.receipt = Uuid::new_v4();
            stored.delivery_count += 1;
            batch.push(Delivery {
                body: stored.body.clone(),
                token: DeliveryToken {
                    message_id: stored.message_id.to_string(),
                    receipt: stored.receipt.to_string(),
                },
                delivery_count: Some(stored.delivery_count),
            });
        }
        Ok(batch)
    }

    async fn delete_message(
        &self,
        queue: &str,
        token: &DeliveryToken,
    ) -> Result<DeleteOutcome, Self::Error> {
        let mut queues = self.queues.lock().await;
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| InMemoryDriverError::queue_not_found(queue))?;

        let now = Instant::now();
        let Some(position) = messages
            .iter()
            .position(|stored| stored.message_id.to_string() == token.message_id)
        else {
            // Already removed; the token cannot be current anymore.
            return Ok(DeleteOutcome::Stale);
        };

        let stored = &messages[position];
        // A rotated receipt or an elapsed visibility window both invalidate
        // the token, even if nobody re-dequeued the message yet.
        if stored.receipt.to_string() != token.receipt || stored.visible_at <= now {
            return Ok(DeleteOutcome::Stale);
        }

        messages.remove(position);
        Ok(DeleteOutcome::Deleted)
    }
}

/// Error type for `InMemoryDriver` operations.
#[derive(Debug)]
pub struct InMemoryDriverError {
    kind: InMemoryDriverErrorKind,
}

#[derive(Debug)]
enum InMemoryDriverErrorKind {
    QueueNotFound(String),
}

impl InMemoryDriverError {
    fn queue_not_found(queue: &str) -> Self {
        Self {
            kind: InMemoryDriverErrorKind::QueueNotFound(queue.to_owned()),
        }
    }
}

impl std::fmt::Display for InMemoryDriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryDriverErrorKind::QueueNotFound(queue) => {
                write!(f, "Queue {queue} not found in in-memory driver")
            }
        }
    }
}

impl std::error::Error for InMemoryDriverError {}
