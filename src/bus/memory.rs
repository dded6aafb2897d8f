use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{Acker, BusError, Delivery, MessageBus, Subscription};
use crate::subjects;

const MEMBER_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct Envelope {
    subject: String,
    key: String,
    payload: Vec<u8>,
    attempt: u64,
}

struct Group {
    pattern: String,
    inbox: mpsc::UnboundedSender<Envelope>,
    members: Arc<Mutex<Vec<mpsc::Sender<Delivery>>>>,
}

#[derive(Default)]
struct Inner {
    /// Everything ever published; new groups start from the beginning.
    log: Vec<Envelope>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Stats {
    acked: AtomicU64,
    nacked: AtomicU64,
    failing_publishes: AtomicU32,
}

/// In-process broker with the same delivery contract as the JetStream bus:
/// retained messages, durable groups and redelivery on nack.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
    stats: Arc<Stats>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads published on subjects matching `pattern`, oldest first.
    pub fn published(&self, pattern: &str) -> Vec<(String, Vec<u8>)> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|e| subjects::matches(pattern, &e.subject))
            .map(|e| (e.subject.clone(), e.payload.clone()))
            .collect()
    }

    /// Decoded payloads on `pattern`; entries that do not decode as `T` are skipped.
    pub fn published_json<T: DeserializeOwned>(&self, pattern: &str) -> Vec<T> {
        self.published(pattern)
            .into_iter()
            .filter_map(|(_, payload)| serde_json::from_slice(&payload).ok())
            .collect()
    }

    pub fn ack_count(&self) -> u64 {
        self.stats.acked.load(Ordering::SeqCst)
    }

    pub fn nack_count(&self) -> u64 {
        self.stats.nacked.load(Ordering::SeqCst)
    }

    /// Makes the next `n` publishes fail, for exercising retry paths.
    pub fn fail_next_publishes(&self, n: u32) {
        self.stats.failing_publishes.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let injected = self
            .stats
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let envelope = Envelope {
            subject: subject.to_string(),
            key: key.to_string(),
            payload,
            attempt: 1,
        };
        let mut inner = self.inner.lock();
        for group in inner.groups.values() {
            if subjects::matches(&group.pattern, subject) {
                // Forwarder holds the receiver for the lifetime of the bus
                let _ = group.inbox.send(envelope.clone());
            }
        }
        inner.log.push(envelope);
        Ok(())
    }

    async fn subscribe(&self, subject: &str, group: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(MEMBER_BUFFER);
        let group_key = format!("{}|{}", subject, group);

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.groups.get(&group_key) {
            existing.members.lock().push(tx);
            return Ok(Subscription::new(rx));
        }

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        for envelope in inner.log.iter().filter(|e| subjects::matches(subject, &e.subject)) {
            let _ = inbox_tx.send(envelope.clone());
        }
        let members = Arc::new(Mutex::new(vec![tx]));
        tokio::spawn(forward(
            inbox_rx,
            inbox_tx.clone(),
            members.clone(),
            self.stats.clone(),
        ));
        inner.groups.insert(
            group_key,
            Group {
                pattern: subject.to_string(),
                inbox: inbox_tx,
                members,
            },
        );
        debug!(subject = %subject, group = %group, "Memory consumer group created");
        Ok(Subscription::new(rx))
    }
}

/// Hands each envelope to the group members round-robin.
async fn forward(
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    requeue: mpsc::UnboundedSender<Envelope>,
    members: Arc<Mutex<Vec<mpsc::Sender<Delivery>>>>,
    stats: Arc<Stats>,
) {
    let mut next = 0usize;
    while let Some(envelope) = inbox.recv().await {
        loop {
            let member = {
                let members = members.lock();
                if members.is_empty() {
                    None
                } else {
                    Some(members[next % members.len()].clone())
                }
            };
            let Some(member) = member else {
                warn!(subject = %envelope.subject, "Consumer group has no members left");
                return;
            };
            next = next.wrapping_add(1);

            let delivery = Delivery::new(
                envelope.subject.clone(),
                envelope.key.clone(),
                envelope.payload.clone(),
                envelope.attempt,
                Box::new(MemoryAcker {
                    envelope: envelope.clone(),
                    requeue: requeue.clone(),
                    stats: stats.clone(),
                }),
            );
            if member.send(delivery).await.is_ok() {
                break;
            }
            members.lock().retain(|m| !m.is_closed());
        }
    }
}

struct MemoryAcker {
    envelope: Envelope,
    requeue: mpsc::UnboundedSender<Envelope>,
    stats: Arc<Stats>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.stats.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self) -> Result<(), BusError> {
        self.stats.nacked.fetch_add(1, Ordering::SeqCst);
        let mut again = self.envelope.clone();
        again.attempt += 1;
        self.requeue
            .send(again)
            .map_err(|_| BusError::Ack("consumer group closed".to_string()))
    }
}
