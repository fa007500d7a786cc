use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rdkafka::error::KafkaError;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::consumer::{ConsumerGroup, ConsumerGroupHandler, MessageHandler};
use crate::metrics::{METRIC_CONSUMER_RECONNECTS, METRIC_CONSUMER_SESSIONS, METRIC_CONSUMER_STOPPED};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown token fired.
    Cancelled,
    /// Too many consecutive failed sessions.
    ReconnectLimit,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Cancelled => "cancelled",
            StopReason::ReconnectLimit => "reconnect_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Running,
    Backoff { attempt: u32 },
    Stopped(StopReason),
}

/// Keeps every started consumer alive: failed sessions are reopened after a
/// jittered exponential backoff until the shutdown token fires or the
/// reconnect ceiling is hit.
pub struct ConsumerSupervisor {
    groups: HashMap<String, Arc<dyn ConsumerGroup>>,
    policy: RetryPolicy,
    tracker: TaskTracker,
}

impl ConsumerSupervisor {
    pub fn new(groups: HashMap<String, Arc<dyn ConsumerGroup>>, policy: RetryPolicy) -> Self {
        Self {
            groups,
            policy,
            tracker: TaskTracker::new(),
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.groups.contains_key(key)
    }

    /// Spawns the consumer task for `key`. Returns `None` when no group is
    /// registered under that key.
    pub fn start_consumer(
        &self,
        shutdown: CancellationToken,
        key: &str,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        workers: usize,
    ) -> Option<JoinHandle<StopReason>> {
        let Some(group) = self.groups.get(key) else {
            error!("consumer not found: {}", key);
            return None;
        };

        let consumer = SupervisedConsumer {
            key: key.to_owned(),
            group: group.clone(),
            topics,
            handler: Arc::new(ConsumerGroupHandler::new(handler, workers)),
            policy: self.policy,
            shutdown,
        };
        info!("starting consumer {}", key);

        Some(self.tracker.spawn(consumer.run()))
    }

    /// Waits for every started consumer to stop. Tasks that outlive
    /// `timeout` keep running.
    pub async fn wait_for_consumers(&self, timeout: Duration) -> Result<(), Elapsed> {
        info!("waiting for all kafka consumers to finish");
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("all kafka consumers finished");
                Ok(())
            }
            Err(elapsed) => {
                warn!(
                    "timed out after {:?} waiting for {} kafka consumers",
                    timeout,
                    self.tracker.len()
                );
                Err(elapsed)
            }
        }
    }

    /// Closes every group connection, carrying on past failures.
    pub fn close_consumers(&self) -> Vec<(String, KafkaError)> {
        let mut failures = Vec::new();

        for (key, group) in &self.groups {
            match group.close() {
                Ok(()) => info!("closed consumer {}", key),
                Err(e) => {
                    error!("failed to close consumer {}: {}", key, e);
                    failures.push((key.clone(), e));
                }
            }
        }

        failures
    }
}

struct SupervisedConsumer {
    key: String,
    group: Arc<dyn ConsumerGroup>,
    topics: Vec<String>,
    handler: Arc<ConsumerGroupHandler>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl SupervisedConsumer {
    async fn run(self) -> StopReason {
        let mut attempt: u32 = 0;
        let mut state = ConsumerState::Running;

        loop {
            state = match state {
                ConsumerState::Running => self.run_session(&mut attempt).await,
                ConsumerState::Backoff { attempt } => self.backoff(attempt).await,
                ConsumerState::Stopped(reason) => {
                    counter!(
                        METRIC_CONSUMER_STOPPED,
                        "consumer" => self.key.clone(),
                        "reason" => reason.as_str()
                    )
                    .increment(1);
                    return reason;
                }
            };
        }
    }

    async fn run_session(&self, attempt: &mut u32) -> ConsumerState {
        if self.shutdown.is_cancelled() {
            info!("context canceled, stopping consumer {}", self.key);
            return ConsumerState::Stopped(StopReason::Cancelled);
        }

        let result = self
            .group
            .consume(&self.topics, self.handler.clone(), &self.shutdown)
            .await;

        if self.shutdown.is_cancelled() {
            info!("context canceled, stopping consumer {}", self.key);
            return ConsumerState::Stopped(StopReason::Cancelled);
        }

        match result {
            Ok(()) => {
                counter!(METRIC_CONSUMER_SESSIONS, "consumer" => self.key.clone(), "outcome" => "clean")
                    .increment(1);
                info!(
                    "consumer {} rebalanced or returned without error, reconnecting",
                    self.key
                );
                *attempt = 0;
                ConsumerState::Running
            }
            Err(e) => {
                counter!(METRIC_CONSUMER_SESSIONS, "consumer" => self.key.clone(), "outcome" => "error")
                    .increment(1);
                *attempt = attempt.saturating_add(1);

                if self.policy.reconnects_exhausted(*attempt) {
                    error!(
                        "maximum reconnection attempts reached ({}) for consumer {}, stopping: {}",
                        self.policy.max_reconnect_tries, self.key, e
                    );
                    return ConsumerState::Stopped(StopReason::ReconnectLimit);
                }

                warn!(
                    "error from consumer {}: {} (reconnect attempt {})",
                    self.key, e, attempt
                );
                ConsumerState::Backoff { attempt: *attempt }
            }
        }
    }

    async fn backoff(&self, attempt: u32) -> ConsumerState {
        let delay = self.policy.reconnect_backoff(attempt);
        counter!(METRIC_CONSUMER_RECONNECTS, "consumer" => self.key.clone()).increment(1);
        info!("reconnecting consumer {} in {:?}", self.key, delay);

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("context canceled during backoff, stopping consumer {}", self.key);
                ConsumerState::Stopped(StopReason::Cancelled)
            }
            _ = tokio::time::sleep(delay) => ConsumerState::Running,
        }
    }
}
