use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::{Acker, BusError, Delivery, MessageBus, Subscription};
use crate::config::BusConfig;
use crate::subjects;

const PARTITION_KEY_HEADER: &str = "Dex-Partition-Key";
const CONSUMER_BUFFER: usize = 256;

/// JetStream-backed router. One file-backed stream captures every `dex.>`
/// subject; each consumer group is a durable pull consumer with explicit acks.
pub struct NatsBus {
    jetstream: jetstream::Context,
    stream: jetstream::stream::Stream,
    config: BusConfig,
}

impl NatsBus {
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let url = config
            .nats_url
            .clone()
            .unwrap_or_else(|| "nats://localhost:4222".to_string());
        let client = async_nats::connect(&url).await.map_err(|e| {
            error!("❌ Failed to connect to NATS at {}: {}", url, e);
            BusError::Connection(e.to_string())
        })?;
        info!("✅ Connected to NATS at {}", url);

        let jetstream = jetstream::new(client);
        let stream = match jetstream.get_stream(&config.stream_name).await {
            Ok(s) => s,
            Err(_) => {
                info!("Creating JetStream Stream: {}", config.stream_name);
                jetstream
                    .create_stream(jetstream::stream::Config {
                        name: config.stream_name.clone(),
                        subjects: vec![subjects::STREAM_SUBJECTS.to_string()],
                        storage: jetstream::stream::StorageType::File,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        error!("❌ Failed to create JetStream stream: {}", e);
                        BusError::Connection(e.to_string())
                    })?
            }
        };

        Ok(Self {
            jetstream,
            stream,
            config: config.clone(),
        })
    }

    fn durable_name(&self, group: &str) -> String {
        // Durable names may not contain '.', '*' or '>'
        let cleaned: String = group
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        format!("{}_{}", self.config.durable_prefix, cleaned)
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut headers = HeaderMap::new();
        headers.insert(PARTITION_KEY_HEADER, key);

        let publish_err = |reason: String| BusError::Publish {
            subject: subject.to_string(),
            reason,
        };
        // First await: accepted by the client; second: persisted by the stream
        self.jetstream
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| publish_err(e.to_string()))?
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str, group: &str) -> Result<Subscription, BusError> {
        let durable = self.durable_name(group);
        let subscribe_err = |reason: String| BusError::Subscribe {
            subject: subject.to_string(),
            reason,
        };

        let consumer = self
            .stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(self.config.ack_wait_secs),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                error!("❌ Failed to create JetStream consumer: {}", e);
                subscribe_err(e.to_string())
            })?;

        let mut messages = consumer.messages().await.map_err(|e| {
            error!("❌ Failed to get messages stream: {}", e);
            subscribe_err(e.to_string())
        })?;
        info!("🚀 JetStream Consumer '{}' listening on '{}'", durable, subject);

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        tokio::spawn(async move {
            while let Some(next) = messages.next().await {
                let msg = match next {
                    Ok(msg) => msg,
                    Err(e) => {
                        error!("Error receiving message from JetStream: {}", e);
                        continue;
                    }
                };
                let attempt = msg.info().map(|i| i.delivered as u64).unwrap_or(1);
                let key = msg
                    .headers
                    .as_ref()
                    .and_then(|h| h.get(PARTITION_KEY_HEADER))
                    .map(|v| v.as_str().to_string())
                    .unwrap_or_default();
                let delivery = Delivery::new(
                    msg.subject.to_string(),
                    key,
                    msg.payload.to_vec(),
                    attempt,
                    Box::new(NatsAcker { message: msg }),
                );
                if tx.send(delivery).await.is_err() {
                    warn!("Subscription dropped, stopping JetStream pull loop");
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nack(&self) -> Result<(), BusError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}
