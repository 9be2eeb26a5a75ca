//! Delivery workers
//!
//! Primary and retry topics get separate worker pools so retry traffic,
//! which waits out its delay, never starves fresh deliveries. Every worker
//! handles its own stream sequentially and stops on the shared cancellation
//! token; a delivery interrupted by shutdown is left unsettled and comes back.

use super::{process, DeliveryContext, Outcome};
use crate::queue::{Consumer, Delivery, Producer};
use courier_core::Envelope;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Primary,
    Retry,
}

impl Lane {
    fn as_str(&self) -> &'static str {
        match self {
            Lane::Primary => "primary",
            Lane::Retry => "retry",
        }
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

struct Worker {
    index: usize,
    lane: Lane,
    context: Arc<DeliveryContext>,
    consumer: Arc<dyn Consumer>,
    producer: Arc<dyn Producer>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(lane = self.lane.as_str(), index = self.index, "delivery worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.consumer.next() => next,
            };
            let Some(delivery) = next else {
                info!(lane = self.lane.as_str(), "consumer closed");
                break;
            };
            self.handle(delivery).await;
        }
        debug!(lane = self.lane.as_str(), index = self.index, "delivery worker stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        let envelope = match Envelope::decode(&delivery.record.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(lane = self.lane.as_str(), key = %delivery.record.key, error = %err, "undecodable payload, dead-lettering");
                self.dead_letter(delivery).await;
                return;
            }
        };

        if !self.wait_retry_delay(&envelope).await {
            return;
        }

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            outcome = process(&self.context, envelope) => outcome,
        };

        match outcome {
            Outcome::Done => delivery.ack(),
            Outcome::Retry(envelope) => self.republish(delivery, envelope).await,
            Outcome::DeadLetter(envelope) => {
                let topic = &self.context.delivery.dlq_topic;
                self.publish_envelope(delivery, envelope, topic).await;
            }
        }
    }

    /// Sleep until `last_attempt_at + retry_delay`; false when shut down first
    async fn wait_retry_delay(&self, envelope: &Envelope) -> bool {
        let delay = self.context.delivery.retry_delay();
        if envelope.retry_count == 0 || delay.is_zero() {
            return true;
        }
        let Some(last_attempt_at) = envelope.last_attempt_at else {
            warn!(seq = %envelope.seq, "retried envelope without last attempt time");
            return true;
        };

        let now = self.context.clock.now();
        let due = last_attempt_at + delay;
        if due <= now {
            return true;
        }
        let remaining = due - now;
        debug!(seq = %envelope.seq, delay_ms = remaining.as_millis() as u64, "delaying retry");
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(remaining) => true,
        }
    }

    async fn dead_letter(&self, delivery: Delivery) {
        let topic = &self.context.delivery.dlq_topic;
        let published = self
            .producer
            .publish(topic, &delivery.record.key, delivery.record.payload.clone())
            .await;
        match published {
            Ok(()) => delivery.ack(),
            Err(err) => {
                error!(topic = %topic, error = %err, "dead-letter publish failed");
                delivery.nack();
            }
        }
    }

    /// Route an unfinished envelope to the retry topic, or the DLQ once exhausted
    async fn republish(&self, delivery: Delivery, mut envelope: Envelope) {
        let config = &self.context.delivery;
        let topic = if envelope.retry_count >= config.max_retries {
            error!(seq = %envelope.seq, kind = envelope.body.kind(), retry_count = envelope.retry_count, "retries exhausted, dead-lettering");
            &config.dlq_topic
        } else {
            envelope.retry_count += 1;
            warn!(seq = %envelope.seq, kind = envelope.body.kind(), retry_count = envelope.retry_count, "scheduling retry");
            &config.retry_topic
        };
        self.publish_envelope(delivery, envelope, topic).await;
    }

    /// Stamp the attempt time and publish keyed by seq; nack on failure
    async fn publish_envelope(&self, delivery: Delivery, mut envelope: Envelope, topic: &str) {
        envelope.last_attempt_at = Some(self.context.clock.now());

        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(seq = %envelope.seq, error = %err, "failed to encode envelope");
                delivery.nack();
                return;
            }
        };
        match self.producer.publish(topic, &envelope.seq, payload).await {
            Ok(()) => delivery.ack(),
            Err(err) => {
                error!(seq = %envelope.seq, topic = %topic, error = %err, "republish failed");
                delivery.nack();
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

/// Running delivery worker pools
pub struct DeliveryService {
    shutdown: CancellationToken,
    workers: JoinSet<()>,
}

impl DeliveryService {
    /// Spawn `concurrency` primary and `retry_concurrency` retry workers
    pub fn start(
        context: Arc<DeliveryContext>,
        primary: Arc<dyn Consumer>,
        retry: Arc<dyn Consumer>,
        producer: Arc<dyn Producer>,
        shutdown: CancellationToken,
    ) -> Self {
        let config = context.delivery_config();
        let lanes = [
            (Lane::Primary, primary, config.concurrency),
            (Lane::Retry, retry, config.retry_concurrency),
        ];

        let mut workers = JoinSet::new();
        for (lane, consumer, count) in lanes {
            for index in 0..count {
                let worker = Worker {
                    index,
                    lane,
                    context: context.clone(),
                    consumer: consumer.clone(),
                    producer: producer.clone(),
                    shutdown: shutdown.clone(),
                };
                workers.spawn(worker.run());
            }
        }
        info!(
            primary = config.concurrency,
            retry = config.retry_concurrency,
            "delivery workers started"
        );

        Self { shutdown, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Cancel every worker and wait for them to finish
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "delivery worker failed");
            }
        }
        info!("delivery workers stopped");
    }
}
