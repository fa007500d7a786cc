use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::auth::AuthContext;
use crate::client::base_client_config;
use crate::config::KafkaConfig;
use crate::error::KafkaProduceError;
use crate::metrics::{KafkaContext, METRIC_PRODUCE_DURATION, METRIC_PRODUCE_TOTAL};
use crate::retry::RetryPolicy;

/// Transport behind `Producer`: hands one serialized record to the cluster
/// and resolves once it was acknowledged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), KafkaError>;

    /// Flushes pending records and releases the connection.
    fn close(&self) -> Result<(), KafkaError>;
}

pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    timeout: Duration,
}

#[async_trait]
impl RecordSink for KafkaSink {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), KafkaError> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload);

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(error, _)| error)
    }

    fn close(&self) -> Result<(), KafkaError> {
        self.producer.flush(Timeout::After(self.timeout))
    }
}

/// Creates the acknowledged producer: every record waits for all in-sync
/// replicas, the idempotent producer stays off, and failed sends are not
/// retried by the client. Only the initial metadata fetch is retried, per
/// `RetryPolicy::max_count`.
pub async fn create_kafka_producer(
    config: &KafkaConfig,
    policy: &RetryPolicy,
    auth: Option<&AuthContext>,
    health_check_timeout: Duration,
    liveness: HealthHandle,
) -> Result<KafkaSink, KafkaError> {
    let mut client_config = base_client_config(config, policy, auth, health_check_timeout);
    client_config
        .set("acks", "all")
        .set("enable.idempotence", "false")
        .set("message.send.max.retries", "0");

    if config.producer_flush_bytes > 0 {
        client_config.set("batch.size", config.producer_flush_bytes.to_string());
    }
    if config.producer_flush_messages > 0 {
        client_config.set(
            "batch.num.messages",
            config.producer_flush_messages.to_string(),
        );
    }
    if !config.producer_flush_frequency.0.is_zero() {
        client_config.set(
            "linger.ms",
            config.producer_flush_frequency.0.as_millis().to_string(),
        );
    }

    if auth.is_none() {
        debug!("rdkafka configuration: {:?}", client_config);
    }
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext::new("producer", liveness))?;

    ping_brokers(&producer, config, policy).await?;

    Ok(KafkaSink {
        producer,
        timeout: policy.timeout,
    })
}

/// "Ping" the brokers by requesting metadata, retrying transient failures.
async fn ping_brokers(
    producer: &FutureProducer<KafkaContext>,
    config: &KafkaConfig,
    policy: &RetryPolicy,
) -> Result<(), KafkaError> {
    let mut attempt = 0;

    loop {
        match producer
            .client()
            .fetch_metadata(None, Timeout::After(policy.dial_timeout))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
                for topic in &config.producer_topics.0 {
                    if !metadata.topics().iter().any(|t| t.name() == topic.as_str()) {
                        warn!("producer topic {} does not exist yet", topic);
                    }
                }
                return Ok(());
            }
            Err(error) if attempt < policy.max_count => {
                attempt += 1;
                warn!(
                    "failed to fetch metadata from Kafka brokers (attempt {}): {:?}",
                    attempt, error
                );
                tokio::time::sleep(policy.timeout).await;
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }
    }
}

/// Synchronous, acknowledged publisher. `produce` returns once the cluster
/// accepted the record. Closing drops the transport, after which every call
/// fails with `KafkaProduceError::Unavailable`.
pub struct Producer {
    sink: Mutex<Option<Arc<dyn RecordSink>>>,
}

impl Producer {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub async fn produce<T>(&self, topic: &str, payload: &T) -> Result<(), KafkaProduceError>
    where
        T: Serialize + ?Sized,
    {
        let sink = self
            .sink
            .lock()
            .clone()
            .ok_or(KafkaProduceError::Unavailable)?;

        let payload = serde_json::to_vec(payload)
            .map_err(|error| KafkaProduceError::SerializationError { error })?;

        let start = Instant::now();
        let result = sink.send(topic, &payload).await;
        histogram!(METRIC_PRODUCE_DURATION, "topic" => topic.to_owned())
            .record(start.elapsed().as_secs_f64());

        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter!(
            METRIC_PRODUCE_TOTAL,
            "topic" => topic.to_owned(),
            "outcome" => outcome
        )
        .increment(1);

        result.map_err(|error| KafkaProduceError::KafkaProduceError { error })
    }

    /// Safe to call any number of times.
    pub fn close(&self) -> Result<(), KafkaError> {
        let Some(sink) = self.sink.lock().take() else {
            return Ok(());
        };

        sink.close().map_err(|error| {
            error!("error closing Kafka producer: {}", error);
            error
        })
    }
}
