use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::message::{Message, OwnedMessage};
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, warn};

use crate::metrics::{METRIC_HANDLER_IN_FLIGHT, METRIC_MESSAGES_HANDLED};

/// Handlers run concurrently up to this many when no worker count is configured.
pub const DEFAULT_WORKERS_COUNT: usize = 30;

/// Upper bound on the worker count: the permit gate and the claim channel
/// both hold one permit per worker, and the drain acquires them all at once.
pub const MAX_WORKERS_COUNT: usize = if (u32::MAX as usize) < Semaphore::MAX_PERMITS {
    u32::MAX as usize
} else {
    Semaphore::MAX_PERMITS
};

/// Application callback invoked once per delivered message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: &OwnedMessage) -> anyhow::Result<()>;
}

/// The open consumer session. Marked offsets are committed by the group's
/// periodic commit.
#[cfg_attr(test, mockall::automock)]
pub trait GroupSession: Send + Sync {
    fn mark_message(&self, message: &OwnedMessage);
}

/// Dispatches one claim's messages to the application handler, at most
/// `workers` at a time.
pub struct ConsumerGroupHandler {
    handler: Arc<dyn MessageHandler>,
    workers: usize,
}

impl ConsumerGroupHandler {
    pub fn new(handler: Arc<dyn MessageHandler>, workers: usize) -> Self {
        let workers = match workers {
            0 => DEFAULT_WORKERS_COUNT,
            n if n > MAX_WORKERS_COUNT => {
                warn!(
                    "worker count {} exceeds the maximum, using {}",
                    n, MAX_WORKERS_COUNT
                );
                MAX_WORKERS_COUNT
            }
            n => n,
        };

        Self { handler, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs until `messages` is closed, then waits for every in-flight
    /// handler before returning. A message is marked once its handler
    /// returned, whatever the outcome: failures are logged and never
    /// redelivered.
    pub async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut messages: mpsc::Receiver<OwnedMessage>,
    ) {
        let permits = Arc::new(Semaphore::new(self.workers));

        while let Some(message) = messages.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            let handler = self.handler.clone();
            let session = session.clone();
            tokio::spawn(async move {
                gauge!(METRIC_HANDLER_IN_FLIGHT).increment(1.0);
                let outcome = match handler.handle_message(&message).await {
                    Ok(()) => "success",
                    Err(e) => {
                        error!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            "failed to handle message: {:#}",
                            e
                        );
                        "failure"
                    }
                };
                counter!(
                    METRIC_MESSAGES_HANDLED,
                    "topic" => message.topic().to_owned(),
                    "outcome" => outcome
                )
                .increment(1);
                session.mark_message(&message);
                gauge!(METRIC_HANDLER_IN_FLIGHT).decrement(1.0);
                drop(permit);
            });
        }

        // Every permit back in hand means every handler has finished
        let capacity = u32::try_from(self.workers).unwrap_or(u32::MAX);
        let drained = permits.acquire_many(capacity).await;
        drop(drained);
    }
}
