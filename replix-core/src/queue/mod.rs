//! Decoupled provisioning path.
//!
//! Submissions in queued mode publish a [`ProvisioningMessage`]; the
//! [`consumer::QueueConsumer`] drains the queue in batches and provisions
//! each job through the same engine as the direct path. A delivery that is
//! not acknowledged is released and becomes visible again after a backoff;
//! after `max_receives` deliveries it is moved to the dead-letter list.

pub mod consumer;
pub mod memory;
#[cfg(feature = "database")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::JobId;

pub use consumer::{BatchReport, QueueConsumer};
pub use memory::InMemoryQueue;
#[cfg(feature = "database")]
pub use self::redis::RedisQueue;

pub const DEFAULT_QUEUE_NAME: &str = "replix:provisioning";
pub const DEFAULT_MAX_RECEIVES: u32 = 5;
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_REDELIVERY_DELAY: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningMessage {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl ProvisioningMessage {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            trace_id: None,
            options: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }
}

/// Stored form of a message. `deliveries` counts previous receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub id: String,
    pub deliveries: u32,
    pub body: String,
}

impl Envelope {
    pub(crate) fn wrap(message: &ProvisioningMessage) -> Result<Self, QueueError> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            deliveries: 0,
            body: serde_json::to_string(message)?,
        })
    }
}

/// One received message. Must be acknowledged, released, or dead-lettered.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    /// 1 on first delivery.
    pub receive_count: u32,
    pub body: String,
    pub(crate) receipt: String,
}

impl Delivery {
    pub fn decode(&self) -> Result<ProvisioningMessage, QueueError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Redelivering { after: Duration },
    DeadLettered,
}

/// Redelivery backoff shared by queue implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_receives: u32,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_REDELIVERY_DELAY,
            max_delay: DEFAULT_MAX_REDELIVERY_DELAY,
            max_receives: DEFAULT_MAX_RECEIVES,
        }
    }
}

impl RedeliveryPolicy {
    /// Delay before a message released after its `receive_count`-th delivery
    /// becomes visible again, or `None` when it should be dead-lettered.
    pub fn next_delay(&self, receive_count: u32) -> Option<Duration> {
        if receive_count >= self.max_receives {
            return None;
        }
        let exponent = receive_count.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

#[async_trait]
pub trait ProvisioningQueue: Send + Sync {
    /// Returns the new message id.
    async fn publish(&self, message: &ProvisioningMessage) -> Result<String, QueueError>;

    /// Up to `max` visible messages. Never blocks waiting for more.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn release(&self, delivery: &Delivery) -> Result<ReleaseOutcome, QueueError>;

    /// Move a message that can never succeed straight to the dead-letter list.
    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError>;
}
