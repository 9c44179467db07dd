use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    Delivery, Envelope, ProvisioningMessage, ProvisioningQueue, RedeliveryPolicy,
    ReleaseOutcome,
};
use crate::error::QueueError;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<String, Envelope>,
    delayed: Vec<(Instant, Envelope)>,
    dead: Vec<Envelope>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = waiting;
        self.ready.extend(due.into_iter().map(|(_, envelope)| envelope));
    }
}

/// Process-local queue for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    policy: RedeliveryPolicy,
}

impl InMemoryQueue {
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            policy,
        }
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn delayed_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }

    /// Bodies of dead-lettered messages.
    pub async fn dead_letters(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .dead
            .iter()
            .map(|envelope| envelope.body.clone())
            .collect()
    }

    /// Publish a raw body, bypassing message encoding.
    pub async fn publish_raw(&self, body: impl Into<String>) -> String {
        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            deliveries: 0,
            body: body.into(),
        };
        let id = envelope.id.clone();
        self.state.lock().await.ready.push_back(envelope);
        id
    }
}

#[async_trait]
impl ProvisioningQueue for InMemoryQueue {
    async fn publish(&self, message: &ProvisioningMessage) -> Result<String, QueueError> {
        let envelope = Envelope::wrap(message)?;
        let id = envelope.id.clone();
        self.state.lock().await.ready.push_back(envelope);
        Ok(id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        state.promote_due(Instant::now());

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(mut envelope) = state.ready.pop_front() else {
                break;
            };
            envelope.deliveries += 1;
            deliveries.push(Delivery {
                message_id: envelope.id.clone(),
                receive_count: envelope.deliveries,
                body: envelope.body.clone(),
                receipt: envelope.id.clone(),
            });
            state.in_flight.insert(envelope.id.clone(), envelope);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state.lock().await.in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<ReleaseOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let Some(envelope) = state.in_flight.remove(&delivery.receipt) else {
            return Err(QueueError::Backend(format!(
                "message {} is not in flight",
                delivery.message_id
            )));
        };

        match self.policy.next_delay(delivery.receive_count) {
            Some(after) => {
                state.delayed.push((Instant::now() + after, envelope));
                Ok(ReleaseOutcome::Redelivering { after })
            }
            None => {
                state.dead.push(envelope);
                Ok(ReleaseOutcome::DeadLettered)
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(envelope) = state.in_flight.remove(&delivery.receipt) {
            state.dead.push(envelope);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::JobId;

    fn policy() -> RedeliveryPolicy {
        RedeliveryPolicy {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_receives: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn released_message_returns_after_backoff_then_dead_letters() {
        let queue = InMemoryQueue::new(policy());
        queue
            .publish(&ProvisioningMessage::new(JobId::new()))
            .await
            .unwrap();

        let first = queue.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert_eq!(
            queue.release(&first[0]).await.unwrap(),
            ReleaseOutcome::Redelivering {
                after: Duration::from_secs(5)
            }
        );
        assert!(queue.receive(10).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = queue.receive(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_eq!(second[0].message_id, first[0].message_id);

        assert_eq!(
            queue.release(&second[0]).await.unwrap(),
            ReleaseOutcome::DeadLettered
        );
        assert_eq!(queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn receive_respects_batch_size_and_ack_removes() {
        let queue = InMemoryQueue::new(policy());
        for _ in 0..3 {
            queue
                .publish(&ProvisioningMessage::new(JobId::new()))
                .await
                .unwrap();
        }

        let batch = queue.receive(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.ready_len().await, 1);
        assert_eq!(queue.in_flight_len().await, 2);

        for delivery in &batch {
            queue.ack(delivery).await.unwrap();
        }
        assert_eq!(queue.in_flight_len().await, 0);
    }
}
