/// Queue message operations
///
/// Messages move pending -> processing on poll, then to completed on ack or
/// back to pending on nack (after a fixed backoff) or on stuck reclamation.
/// Retrying is the caller's business; the engine never retries by itself.

use super::WorkflowService;
use crate::{
    error::{EmulatorError, EmulatorResult},
    store::{
        types::{QueueMessage, QueueMessageStatus},
        Tables,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Delay before a nacked message becomes eligible again
pub const NACK_BACKOFF: Duration = Duration::from_secs(5);

/// Time without a heartbeat after which a processing message is reclaimed
pub const STUCK_PROCESSING_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enqueued {
    pub message_id: String,
}

/// A claimed message as handed to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolledMessage {
    pub id: String,
    pub data: Value,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Acknowledged {
    pub success: bool,
}

impl Acknowledged {
    const OK: Self = Self { success: true };
}

fn chrono_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}

impl WorkflowService {
    /// Enqueue a message, deduplicated by idempotency key within the queue
    pub async fn queue(
        &self,
        db_name: &str,
        queue_name: &str,
        message: &Value,
        opts: EnqueueOptions,
    ) -> EmulatorResult<Enqueued> {
        let store = self.store(db_name).await;
        let (enqueued, created) = {
            let mut tables = store.lock().await;
            self.enqueue_locked(&mut tables, queue_name, message, opts.idempotency_key)?
        };
        if created {
            self.persist(&store).await;
        }
        Ok(enqueued)
    }

    /// Enqueue into already-locked tables; returns whether a message was created
    pub(crate) fn enqueue_locked(
        &self,
        tables: &mut Tables,
        queue_name: &str,
        message: &Value,
        idempotency_key: Option<String>,
    ) -> EmulatorResult<(Enqueued, bool)> {
        if let Some(key) = idempotency_key.as_deref() {
            let existing = tables.queue.iter().find(|msg| {
                msg.queue_name == queue_name && msg.idempotency_key.as_deref() == Some(key)
            });
            if let Some(existing) = existing {
                tracing::debug!(
                    "Idempotency key '{}' already queued on '{}' as {}",
                    key,
                    queue_name,
                    existing.message_id
                );
                return Ok((
                    Enqueued {
                        message_id: existing.message_id.clone(),
                    },
                    false,
                ));
            }
        }

        let payload = serde_json::to_string(message)
            .map_err(|e| EmulatorError::malformed("queue message", e))?;
        let now = Utc::now();
        let msg = QueueMessage {
            message_id: self.ids.next("msg_"),
            queue_name: queue_name.to_string(),
            payload,
            idempotency_key,
            status: QueueMessageStatus::Pending,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            not_before: now,
            created_at: now,
            updated_at: now,
            processed_at: None,
        };
        let enqueued = Enqueued {
            message_id: msg.message_id.clone(),
        };
        tables.queue.push(msg);
        Ok((enqueued, true))
    }

    /// Claim the first eligible pending message of a queue
    ///
    /// The eligibility check and the claim happen under one lock, so two
    /// concurrent pollers never receive the same message. A message whose
    /// payload cannot be decoded is marked failed and reported as malformed.
    pub async fn poll(&self, db_name: &str, queue_name: &str) -> EmulatorResult<Option<PolledMessage>> {
        let store = self.store(db_name).await;
        let now = Utc::now();

        let claimed = {
            let mut tables = store.lock().await;
            let Some(msg) = tables.queue.iter_mut().find(|msg| {
                msg.queue_name == queue_name
                    && msg.status == QueueMessageStatus::Pending
                    && msg.not_before <= now
            }) else {
                return Ok(None);
            };

            msg.updated_at = now;
            match serde_json::from_str::<Value>(&msg.payload) {
                Ok(data) => {
                    msg.status = QueueMessageStatus::Processing;
                    msg.attempt += 1;
                    Ok(PolledMessage {
                        id: msg.message_id.clone(),
                        data,
                        attempt: msg.attempt,
                    })
                }
                Err(e) => {
                    msg.status = QueueMessageStatus::Failed;
                    tracing::warn!("Queue message {} has an undecodable payload: {}", msg.message_id, e);
                    Err(EmulatorError::malformed(
                        &format!("payload of queue message {}", msg.message_id),
                        e,
                    ))
                }
            }
        };
        self.persist(&store).await;

        claimed.map(Some)
    }

    /// Mark a message completed; unknown ids are ignored
    pub async fn ack(&self, db_name: &str, message_id: &str) -> EmulatorResult<Acknowledged> {
        self.update_message(db_name, message_id, |msg, now| {
            msg.status = QueueMessageStatus::Completed;
            msg.processed_at = Some(now);
            msg.updated_at = now;
        })
        .await
    }

    /// Return a message to pending after the fixed backoff, keeping its attempt count
    pub async fn nack(&self, db_name: &str, message_id: &str) -> EmulatorResult<Acknowledged> {
        self.update_message(db_name, message_id, |msg, now| {
            msg.status = QueueMessageStatus::Pending;
            msg.not_before = now + chrono_delta(NACK_BACKOFF);
            msg.updated_at = now;
        })
        .await
    }

    /// Liveness heartbeat of a processing message
    pub async fn touch(&self, db_name: &str, message_id: &str) -> EmulatorResult<Acknowledged> {
        self.update_message(db_name, message_id, |msg, now| {
            msg.updated_at = now;
        })
        .await
    }

    async fn update_message<F>(&self, db_name: &str, message_id: &str, apply: F) -> EmulatorResult<Acknowledged>
    where
        F: FnOnce(&mut QueueMessage, DateTime<Utc>),
    {
        let store = self.store(db_name).await;
        let found = {
            let mut tables = store.lock().await;
            match tables.queue.iter_mut().find(|msg| msg.message_id == message_id) {
                Some(msg) => {
                    apply(msg, Utc::now());
                    true
                }
                None => false,
            }
        };

        if found {
            self.persist(&store).await;
        } else {
            tracing::debug!("Queue message {} not found in '{}'", message_id, db_name);
        }
        Ok(Acknowledged::OK)
    }

    /// Return messages stuck in processing past the timeout to pending
    ///
    /// Returns how many were reclaimed.
    pub async fn cleanup_stuck_messages(&self, db_name: &str) -> EmulatorResult<usize> {
        let store = self.store(db_name).await;
        let now = Utc::now();
        let timeout = chrono_delta(STUCK_PROCESSING_TIMEOUT);

        let reclaimed = {
            let mut tables = store.lock().await;
            let mut count = 0;
            for msg in tables.queue.iter_mut() {
                if msg.status == QueueMessageStatus::Processing && now - msg.updated_at > timeout {
                    msg.status = QueueMessageStatus::Pending;
                    msg.not_before = now;
                    msg.updated_at = now;
                    count += 1;
                }
            }
            count
        };

        if reclaimed > 0 {
            tracing::warn!("Reclaimed {} stuck queue messages in '{}'", reclaimed, db_name);
            self.persist(&store).await;
        }
        Ok(reclaimed)
    }
}
