//! Durable Queue Abstraction
//!
//! [`Producer`] publishes keyed records; [`Consumer`] yields [`Delivery`]
//! handles that must be acked (consumed) or nacked (redelivered). Several
//! workers may pull from one consumer concurrently.
//!
//! [`MemoryQueue`] implements both sides in-process and keeps a log of every
//! published record for inspection.

use async_trait::async_trait;
use courier_core::{CourierError, CourierResult};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ----------------------------------------------------------------------------
// Records and Deliveries
// ----------------------------------------------------------------------------

/// A published record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Settles a delivery with the queue backend
pub trait Settle: Send {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>);
}

/// A consumed record awaiting settlement
pub struct Delivery {
    pub record: Record,
    settle: Option<Box<dyn Settle>>,
}

impl Delivery {
    pub fn new(record: Record, settle: Box<dyn Settle>) -> Self {
        Self {
            record,
            settle: Some(settle),
        }
    }

    /// Remove the record from the queue
    pub fn ack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle.ack();
        }
    }

    /// Hand the record back for redelivery
    pub fn nack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle.nack();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("record", &self.record)
            .field("settled", &self.settle.is_none())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        // Dropping unsettled means the worker gave up on it (shutdown).
        if let Some(settle) = self.settle.take() {
            settle.nack();
        }
    }
}

// ----------------------------------------------------------------------------
// Traits
// ----------------------------------------------------------------------------

#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> CourierResult<()>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Next delivery, or `None` once the topic is closed
    async fn next(&self) -> Option<Delivery>;
}

// ----------------------------------------------------------------------------
// In-memory Queue
// ----------------------------------------------------------------------------

struct Topic {
    sender: mpsc::UnboundedSender<Record>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Record>>>,
    log: Mutex<Vec<Record>>,
}

impl Topic {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            log: Mutex::new(Vec::new()),
        }
    }
}

/// In-process queue with per-topic FIFO delivery
#[derive(Clone, Default)]
pub struct MemoryQueue {
    topics: Arc<DashMap<String, Arc<Topic>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new()))
            .clone()
    }

    /// Consumer handle for one topic; clones share the same stream
    pub fn consumer(&self, topic: &str) -> MemoryConsumer {
        MemoryConsumer {
            topic: self.topic(topic),
        }
    }

    /// Every record ever published to `topic`, in publish order
    pub fn published(&self, topic: &str) -> Vec<Record> {
        self.topics
            .get(topic)
            .and_then(|topic| topic.log.lock().ok().map(|log| log.clone()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Producer for MemoryQueue {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> CourierResult<()> {
        let record = Record {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        };
        let target = self.topic(topic);
        target
            .log
            .lock()
            .map_err(|_| CourierError::internal("queue log poisoned"))?
            .push(record.clone());
        target
            .sender
            .send(record)
            .map_err(|_| CourierError::unavailable(format!("topic {} closed", topic)))?;
        debug!(topic, key, "published record");
        Ok(())
    }
}

/// Consumer side of one [`MemoryQueue`] topic
#[derive(Clone)]
pub struct MemoryConsumer {
    topic: Arc<Topic>,
}

struct MemorySettle {
    record: Option<Record>,
    sender: mpsc::UnboundedSender<Record>,
}

impl Settle for MemorySettle {
    fn ack(self: Box<Self>) {}

    fn nack(mut self: Box<Self>) {
        if let Some(record) = self.record.take() {
            if self.sender.send(record).is_err() {
                warn!("topic closed, nacked record lost");
            }
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&self) -> Option<Delivery> {
        let record = self.topic.receiver.lock().await.recv().await?;
        let settle = MemorySettle {
            record: Some(record.clone()),
            sender: self.topic.sender.clone(),
        };
        Some(Delivery::new(record, Box::new(settle)))
    }
}
