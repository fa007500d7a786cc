use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientContext, Statistics};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthContext;
use crate::client::base_client_config;
use crate::config::KafkaConfig;
use crate::consumer::handler::{ConsumerGroupHandler, GroupSession};
use crate::metrics::KafkaContext;
use crate::retry::RetryPolicy;

/// One consumer-group connection, owned by a single consumer key.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Runs one session: joins the group for `topics` and feeds every
    /// claimed record to `handler` until the session ends. Returns `Ok` when
    /// `shutdown` fires or the group rebalances away our partitions, and an
    /// error when the session broke.
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<ConsumerGroupHandler>,
        shutdown: &CancellationToken,
    ) -> Result<(), KafkaError>;

    fn close(&self) -> Result<(), KafkaError>;
}

/// Client context of a consumer group: statistics feed liveness like any
/// other client, and partition revocations are broadcast to the running
/// session.
pub struct GroupContext {
    inner: KafkaContext,
    revocations: watch::Sender<u64>,
}

impl GroupContext {
    fn new(inner: KafkaContext) -> Self {
        let (revocations, _) = watch::channel(0);
        Self { inner, revocations }
    }
}

impl ClientContext for GroupContext {
    fn stats(&self, stats: Statistics) {
        self.inner.record_stats(&stats);
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                info!(
                    client = self.inner.client(),
                    "revoking {} partitions",
                    partitions.count()
                );
                self.revocations.send_modify(|generation| *generation += 1);
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    client = self.inner.client(),
                    "assigning {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!(client = self.inner.client(), "rebalance error: {}", e);
            }
        }
    }
}

pub struct KafkaConsumerGroup {
    consumer: Arc<StreamConsumer<GroupContext>>,
    closed: AtomicBool,
}

impl KafkaConsumerGroup {
    /// Offsets are stored explicitly once a record was handled and committed
    /// by the periodic auto-commit. A new group starts from the oldest
    /// available offset.
    pub fn new(
        key: &str,
        config: &KafkaConfig,
        policy: &RetryPolicy,
        auth: Option<&AuthContext>,
        health_check_timeout: Duration,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = base_client_config(config, policy, auth, health_check_timeout);
        client_config
            .set("group.id", &config.consumer_group)
            .set("client.id", key)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("max.in.flight.requests.per.connection", "1");

        let context = GroupContext::new(KafkaContext::new(key, liveness));
        let consumer: StreamConsumer<GroupContext> =
            client_config.create_with_context(context)?;

        Ok(Self {
            consumer: Arc::new(consumer),
            closed: AtomicBool::new(false),
        })
    }
}

struct OffsetStore {
    consumer: Arc<StreamConsumer<GroupContext>>,
}

impl GroupSession for OffsetStore {
    fn mark_message(&self, message: &OwnedMessage) {
        // The stored offset is the next one to read
        if let Err(e) =
            self.consumer
                .store_offset(message.topic(), message.partition(), message.offset() + 1)
        {
            warn!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                "failed to store offset: {}",
                e
            );
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<ConsumerGroupHandler>,
        shutdown: &CancellationToken,
    ) -> Result<(), KafkaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KafkaError::Subscription(
                "consumer group is closed".to_owned(),
            ));
        }

        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;

        // Only revocations from here on end this session
        let mut revocations = self.consumer.context().revocations.subscribe();

        let (tx, rx) = mpsc::channel(handler.workers());
        let session: Arc<dyn GroupSession> = Arc::new(OffsetStore {
            consumer: self.consumer.clone(),
        });

        let feed = async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = revocations.changed() => {
                        info!("partitions revoked, ending session");
                        return Ok(());
                    }
                    received = self.consumer.recv() => {
                        let message = match received {
                            Ok(message) => message.detach(),
                            Err(e) => return Err(e),
                        };
                        if tx.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        };

        let (result, ()) = tokio::join!(feed, handler.consume_claim(session, rx));
        result
    }

    fn close(&self) -> Result<(), KafkaError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => return Err(e),
        }
        self.consumer.unsubscribe();

        Ok(())
    }
}
