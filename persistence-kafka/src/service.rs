use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use health::HealthRegistry;
use rdkafka::error::KafkaError;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{AuthContext, EnvResolver, SecretResolver};
use crate::config::KafkaConfig;
use crate::consumer::{ConsumerGroup, KafkaConsumerGroup, MessageHandler};
use crate::error::{KafkaProduceError, ServiceError};
use crate::producer::{create_kafka_producer, Producer};
use crate::supervisor::{ConsumerSupervisor, StopReason};

/// Entry point of the broker layer: one acknowledged producer plus one
/// supervised consumer group per configured key.
pub struct KafkaService {
    producer: Producer,
    supervisor: ConsumerSupervisor,
}

impl KafkaService {
    /// Builds every client up front, reading broker secrets from the
    /// process environment.
    pub async fn new(config: &KafkaConfig, liveness: &HealthRegistry) -> Result<Self, ServiceError> {
        Self::with_resolver(config, liveness, &EnvResolver).await
    }

    pub async fn with_resolver(
        config: &KafkaConfig,
        liveness: &HealthRegistry,
        resolver: &dyn SecretResolver,
    ) -> Result<Self, ServiceError> {
        let health_check_timeout = config.health_check_timeout()?;
        let policy = config.retry_policy();
        let auth = AuthContext::from_config(&config.auth, resolver)?;

        let sink = create_kafka_producer(
            config,
            &policy,
            auth.as_ref(),
            health_check_timeout,
            liveness.register("rdkafka-producer", health_check_timeout),
        )
        .await?;

        let mut groups: HashMap<String, Arc<dyn ConsumerGroup>> = HashMap::new();
        for key in &config.consumer_keys.0 {
            if groups.contains_key(key) {
                warn!("consumer key {} is listed twice, ignoring the duplicate", key);
                continue;
            }
            let group = KafkaConsumerGroup::new(
                key,
                config,
                &policy,
                auth.as_ref(),
                health_check_timeout,
                liveness.register(format!("rdkafka-consumer-{key}"), health_check_timeout),
            )?;
            groups.insert(key.clone(), Arc::new(group));
        }
        info!(
            "kafka service ready with {} consumer groups",
            groups.len()
        );

        Ok(Self::from_parts(
            Producer::new(Arc::new(sink)),
            ConsumerSupervisor::new(groups, policy),
        ))
    }

    pub fn from_parts(producer: Producer, supervisor: ConsumerSupervisor) -> Self {
        Self {
            producer,
            supervisor,
        }
    }

    pub async fn produce<T>(&self, topic: &str, payload: &T) -> Result<(), KafkaProduceError>
    where
        T: Serialize + ?Sized,
    {
        self.producer.produce(topic, payload).await
    }

    pub fn start_consumer(
        &self,
        shutdown: CancellationToken,
        key: &str,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        workers: usize,
    ) -> Option<JoinHandle<StopReason>> {
        self.supervisor
            .start_consumer(shutdown, key, topics, handler, workers)
    }

    pub async fn wait_for_consumers(&self, timeout: Duration) -> Result<(), Elapsed> {
        self.supervisor.wait_for_consumers(timeout).await
    }

    pub fn close_consumers(&self) -> Vec<(String, KafkaError)> {
        self.supervisor.close_consumers()
    }

    pub fn close_producer(&self) -> Result<(), KafkaError> {
        self.producer.close()
    }
}
