//! Message router.
//!
//! Delivery is at-least-once: a message stays owned by the broker until the
//! consumer acks it, and a nack (or a missing ack) hands it back for
//! redelivery. Consumers achieve exactly-once effects through idempotency
//! keys, never through the broker.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryBus;
pub use nats::NatsBus;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("Subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("Ack failed: {0}")]
    Ack(String),
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Ack handle bound to one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;
    /// Hand the message back for redelivery.
    async fn nack(&self) -> Result<(), BusError>;
}

pub struct Delivery {
    pub subject: String,
    /// Partition key the publisher attached.
    pub key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery.
    pub attempt: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        subject: String,
        key: String,
        payload: Vec<u8>,
        attempt: u64,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            subject,
            key,
            payload,
            attempt,
            acker,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), BusError> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("key", &self.key)
            .field("attempt", &self.attempt)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer group.
pub struct Subscription {
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Durable publish; returns once the broker has accepted the message.
    async fn publish(&self, subject: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Joins consumer group `group` on `subject` (wildcards allowed). Members of
    /// one group compete for messages; distinct groups each see every message.
    async fn subscribe(&self, subject: &str, group: &str) -> Result<Subscription, BusError>;
}

pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn MessageBus,
    subject: &str,
    key: &str,
    value: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(subject, key, payload).await
}
