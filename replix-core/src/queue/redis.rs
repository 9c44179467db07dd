use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use super::{
    Delivery, Envelope, ProvisioningMessage, ProvisioningQueue, RedeliveryPolicy,
    ReleaseOutcome,
};
use crate::error::QueueError;

/// Upper bound on delayed messages promoted per receive.
const PROMOTE_BATCH: usize = 100;

/// Redis-backed provisioning queue.
///
/// Keys, for a queue named `q`:
/// - `q:ready` list of visible messages, pushed left and taken right
/// - `q:inflight` list of received, unacknowledged messages
/// - `q:delayed` sorted set of released messages scored by visibility time (ms)
/// - `q:dead` list of dead-lettered messages
///
/// Messages left in `q:inflight` by a consumer that died are not reaped
/// automatically; [`RedisQueue::recover_in_flight`] requeues them and is run
/// when a consumer starts.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    name: String,
    policy: RedeliveryPolicy,
}

impl fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueue")
            .field("connection", &"ConnectionManager")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}

fn backend(context: &str) -> impl FnOnce(redis::RedisError) -> QueueError + '_ {
    move |e| QueueError::Backend(format!("Redis {context} failed: {e}"))
}

impl RedisQueue {
    pub async fn connect(
        redis_url: &str,
        name: impl Into<String>,
        policy: RedeliveryPolicy,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        info!(queue = %name, "connecting provisioning queue to Redis");

        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Backend(format!("Failed to create Redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Backend(format!("Failed to connect to Redis: {e}")))?;

        Ok(Self { conn, name, policy })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.name)
    }

    /// Number of visible messages.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(self.key("ready"))
            .query_async::<u64>(&mut conn)
            .await
            .map_err(backend("LLEN"))
    }

    /// Requeue every in-flight message. Returns how many were moved.
    pub async fn recover_in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        loop {
            let next: Option<String> = redis::cmd("LMOVE")
                .arg(self.key("inflight"))
                .arg(self.key("ready"))
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(backend("LMOVE"))?;
            if next.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            warn!(queue = %self.name, moved, "requeued in-flight messages");
        }
        Ok(moved)
    }

    async fn promote_due(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key("delayed"))
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut *conn)
            .await
            .map_err(backend("ZRANGEBYSCORE"))?;

        for member in due {
            // Only the consumer that wins the ZREM moves the message.
            let removed: u64 = redis::cmd("ZREM")
                .arg(self.key("delayed"))
                .arg(&member)
                .query_async(&mut *conn)
                .await
                .map_err(backend("ZREM"))?;
            if removed == 1 {
                redis::cmd("LPUSH")
                    .arg(self.key("ready"))
                    .arg(&member)
                    .query_async::<()>(&mut *conn)
                    .await
                    .map_err(backend("LPUSH"))?;
            }
        }
        Ok(())
    }

    async fn remove_in_flight(
        &self,
        conn: &mut ConnectionManager,
        delivery: &Delivery,
    ) -> Result<bool, QueueError> {
        let removed: u64 = redis::cmd("LREM")
            .arg(self.key("inflight"))
            .arg(1)
            .arg(&delivery.receipt)
            .query_async(&mut *conn)
            .await
            .map_err(backend("LREM"))?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl ProvisioningQueue for RedisQueue {
    async fn publish(&self, message: &ProvisioningMessage) -> Result<String, QueueError> {
        let envelope = Envelope::wrap(message)?;
        let raw = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(self.key("ready"))
            .arg(raw)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend("LPUSH"))?;
        debug!(queue = %self.name, message_id = %envelope.id, "published provisioning message");
        Ok(envelope.id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        self.promote_due(&mut conn).await?;

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(self.key("ready"))
                .arg(self.key("inflight"))
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(backend("LMOVE"))?;
            let Some(raw) = raw else {
                break;
            };

            let delivery = match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => Delivery {
                    message_id: envelope.id,
                    receive_count: envelope.deliveries + 1,
                    body: envelope.body,
                    receipt: raw,
                },
                // Foreign payload: hand it over as is so the consumer can
                // dead-letter it.
                Err(_) => Delivery {
                    message_id: String::new(),
                    receive_count: 1,
                    body: raw.clone(),
                    receipt: raw,
                },
            };
            deliveries.push(delivery);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        if !self.remove_in_flight(&mut conn, delivery).await? {
            warn!(message_id = %delivery.message_id, "acknowledged message was not in flight");
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<ReleaseOutcome, QueueError> {
        let mut conn = self.conn.clone();
        if !self.remove_in_flight(&mut conn, delivery).await? {
            return Err(QueueError::Backend(format!(
                "message {} is not in flight",
                delivery.message_id
            )));
        }

        let envelope = Envelope {
            id: delivery.message_id.clone(),
            deliveries: delivery.receive_count,
            body: delivery.body.clone(),
        };
        let raw = serde_json::to_string(&envelope)?;

        match self.policy.next_delay(delivery.receive_count) {
            Some(after) => {
                let visible_at = Utc::now().timestamp_millis() + after.as_millis() as i64;
                redis::cmd("ZADD")
                    .arg(self.key("delayed"))
                    .arg(visible_at)
                    .arg(raw)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(backend("ZADD"))?;
                Ok(ReleaseOutcome::Redelivering { after })
            }
            None => {
                redis::cmd("LPUSH")
                    .arg(self.key("dead"))
                    .arg(raw)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(backend("LPUSH"))?;
                Ok(ReleaseOutcome::DeadLettered)
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        if self.remove_in_flight(&mut conn, delivery).await? {
            redis::cmd("LPUSH")
                .arg(self.key("dead"))
                .arg(&delivery.receipt)
                .query_async::<()>(&mut conn)
                .await
                .map_err(backend("LPUSH"))?;
        }
        Ok(())
    }
}
