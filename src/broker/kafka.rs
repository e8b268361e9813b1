//! Kafka broker client.
//!
//! Publishes through a shared `FutureProducer` and creates one
//! `StreamConsumer` per subscription. Offsets are committed manually: `ack`
//! commits the next offset, `nack` seeks the partition back so the message is
//! fetched again. Envelope metadata travels as Kafka headers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{AckHandle, Acknowledger, BrokerClient, Delivery, Subscription};
use crate::error::TransportError;
use crate::message::{metadata_keys, new_unique_id, Envelope};
use crate::types::BrokerConfig;

/// Delivery timeout for a single publish.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for seeking a partition back on nack.
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a consumer error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Attempt counters per (partition, offset) for one subscription.
type AttemptMap = Arc<Mutex<HashMap<(i32, i64), u32>>>;

/// Broker client backed by librdkafka.
pub struct KafkaBroker {
    producer: FutureProducer,
    config: BrokerConfig,
    closed: CancellationToken,
}

impl KafkaBroker {
    /// Header carrying the envelope id.
    pub const ENVELOPE_ID_HEADER: &'static str = "envelope_id";

    /// Create the producer and verify the cluster is reachable.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connect` if the producer cannot be created or
    /// cluster metadata cannot be fetched within the connect timeout.
    pub fn connect(config: &BrokerConfig) -> Result<Self, TransportError> {
        let connect_error = |e: KafkaError| TransportError::Connect {
            brokers: config.bootstrap_servers(),
            reason: e.to_string(),
        };

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", DELIVERY_TIMEOUT.as_millis().to_string())
            .create()
            .map_err(connect_error)?;

        let metadata = producer
            .client()
            .fetch_metadata(None, config.connect_timeout())
            .map_err(connect_error)?;

        info!(
            bootstrap = %config.bootstrap_servers(),
            brokers = metadata.brokers().len(),
            "Kafka producer connected"
        );

        Ok(Self {
            producer,
            config: config.clone(),
            closed: CancellationToken::new(),
        })
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set("client.id", &self.config.client_id)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string());
        client_config
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    #[instrument(skip(self, envelope), fields(id = %envelope.id()))]
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut headers = OwnedHeaders::new().insert(Header {
            key: Self::ENVELOPE_ID_HEADER,
            value: Some(envelope.id()),
        });
        for (key, value) in &envelope.metadata {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let key = envelope.partition_key().to_string();
        let record = FutureRecord::to(topic)
            .key(&key)
            .payload(&envelope.payload)
            .headers(headers);

        match self.producer.send(record, Timeout::After(DELIVERY_TIMEOUT)).await {
            Ok(_) => {
                debug!(topic = %topic, "Envelope published");
                Ok(())
            }
            Err((e, _)) => Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> Result<Subscription, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let subscribe_error = |e: KafkaError| TransportError::Subscribe {
            topic: topic.to_string(),
            group: consumer_group.to_string(),
            reason: e.to_string(),
        };

        let consumer: StreamConsumer = self
            .consumer_config(consumer_group)
            .create()
            .map_err(subscribe_error)?;
        consumer.subscribe(&[topic]).map_err(subscribe_error)?;

        info!(topic = %topic, group = %consumer_group, "Subscribed to Kafka topic");

        let consumer = Arc::new(consumer);
        let attempts: AttemptMap = Arc::new(Mutex::new(HashMap::new()));

        let closed = self.closed.clone();

        let stream = futures::stream::unfold(
            (consumer, attempts, closed),
            |(consumer, attempts, closed)| async move {
                loop {
                    let received = tokio::select! {
                        biased;
                        _ = closed.cancelled() => return None,
                        received = consumer.recv() => received.map(|message| message.detach()),
                    };
                    match received {
                        Ok(message) => {
                            let delivery = to_delivery(&consumer, &attempts, message);
                            return Some((delivery, (consumer, attempts, closed)));
                        }
                        Err(e) => {
                            warn!(error = %e, "Kafka consumer error");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        self.producer
            .flush(Timeout::After(DELIVERY_TIMEOUT))
            .map_err(|e| TransportError::Publish {
                topic: "*".to_string(),
                reason: format!("flush failed: {e}"),
            })?;
        info!("Kafka producer flushed, subscriptions closed");
        Ok(())
    }
}

fn to_delivery(consumer: &Arc<StreamConsumer>, attempts: &AttemptMap, message: OwnedMessage) -> Delivery {
    let partition = message.partition();
    let offset = message.offset();

    let mut id = None;
    let mut metadata = HashMap::new();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            if header.key == KafkaBroker::ENVELOPE_ID_HEADER {
                id = Some(value);
            } else {
                metadata.insert(header.key.to_string(), value);
            }
        }
    }

    let attempt = {
        let mut attempts = attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = attempts.entry((partition, offset)).or_insert(0);
        *count += 1;
        *count
    };
    metadata.insert(metadata_keys::DELIVERY_ATTEMPT.to_string(), attempt.to_string());

    let envelope = Envelope::from_parts(
        id.unwrap_or_else(new_unique_id),
        message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        metadata,
    );

    let ack = KafkaAck {
        consumer: Arc::clone(consumer),
        attempts: Arc::clone(attempts),
        topic: message.topic().to_string(),
        partition,
        offset,
        resolved: false,
    };
    Delivery::new(envelope, AckHandle::new(ack))
}

struct KafkaAck {
    consumer: Arc<StreamConsumer>,
    attempts: AttemptMap,
    topic: String,
    partition: i32,
    offset: i64,
    resolved: bool,
}

impl KafkaAck {
    fn commit(&self) -> Result<(), TransportError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|e| TransportError::Ack(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| TransportError::Ack(e.to_string()))?;

        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(self.partition, self.offset));
        Ok(())
    }

    fn rewind(&self) -> Result<(), TransportError> {
        self.consumer
            .seek(&self.topic, self.partition, Offset::Offset(self.offset), SEEK_TIMEOUT)
            .map_err(|e| TransportError::Ack(format!("seek failed: {e}")))
    }
}

#[async_trait]
impl Acknowledger for KafkaAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        let mut this = self;
        this.resolved = true;
        this.commit()
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        let mut this = self;
        this.resolved = true;
        this.rewind()
    }
}

impl Drop for KafkaAck {
    fn drop(&mut self) {
        if !self.resolved {
            if let Err(e) = self.rewind() {
                warn!(error = %e, topic = %self.topic, offset = self.offset, "Failed to rewind dropped delivery");
            }
        }
    }
}
