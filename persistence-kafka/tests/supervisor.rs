use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use persistence_kafka::consumer::{ConsumerGroup, ConsumerGroupHandler, MessageHandler};
use persistence_kafka::retry::RetryPolicy;
use persistence_kafka::supervisor::{ConsumerSupervisor, StopReason};
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedMessage;
use rdkafka::types::RDKafkaErrorCode;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Step {
    Fail,
    Clean,
    /// Ignores the shutdown token entirely.
    Hang,
}

/// Plays back scripted session outcomes, then behaves like a healthy
/// session that only ends on shutdown.
#[derive(Default)]
struct ScriptedGroup {
    script: Mutex<VecDeque<Step>>,
    sessions: AtomicUsize,
    fail_close: bool,
}

impl ScriptedGroup {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        })
    }

    fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    async fn wait_for_sessions(&self, count: usize) {
        while self.sessions() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ConsumerGroup for ScriptedGroup {
    async fn consume(
        &self,
        _topics: &[String],
        _handler: Arc<ConsumerGroupHandler>,
        shutdown: &CancellationToken,
    ) -> Result<(), KafkaError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front();

        match step {
            Some(Step::Fail) => Err(KafkaError::Subscription("broker went away".to_owned())),
            Some(Step::Clean) => Ok(()),
            Some(Step::Hang) => std::future::pending().await,
            None => {
                shutdown.cancelled().await;
                Ok(())
            }
        }
    }

    fn close(&self) -> Result<(), KafkaError> {
        if self.fail_close {
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::BrokerTransportFailure))
        } else {
            Ok(())
        }
    }
}

struct NoopHandler;

#[async_trait]
impl MessageHandler for NoopHandler {
    async fn handle_message(&self, _message: &OwnedMessage) -> anyhow::Result<()> {
        Ok(())
    }
}

fn policy(max_reconnect_tries: u32) -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        max_reconnect_tries,
        ..Default::default()
    }
}

fn supervisor(groups: Vec<(&str, Arc<ScriptedGroup>)>, policy: RetryPolicy) -> ConsumerSupervisor {
    let groups: HashMap<String, Arc<dyn ConsumerGroup>> = groups
        .into_iter()
        .map(|(key, group)| {
            let group: Arc<dyn ConsumerGroup> = group;
            (key.to_owned(), group)
        })
        .collect();
    ConsumerSupervisor::new(groups, policy)
}

fn start(
    supervisor: &ConsumerSupervisor,
    shutdown: &CancellationToken,
    key: &str,
) -> tokio::task::JoinHandle<StopReason> {
    supervisor
        .start_consumer(
            shutdown.clone(),
            key,
            vec!["requests".to_owned()],
            Arc::new(NoopHandler),
            4,
        )
        .expect("key is registered")
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_reconnect_ceiling() {
    let group = ScriptedGroup::new([Step::Fail; 10]);
    let supervisor = supervisor(vec![("start-process", group.clone())], policy(3));
    let shutdown = CancellationToken::new();

    let reason = start(&supervisor, &shutdown, "start-process").await.unwrap();

    assert_eq!(reason, StopReason::ReconnectLimit);
    // the first session plus three reconnects
    assert_eq!(group.sessions(), 4);
}

#[tokio::test(start_paused = true)]
async fn clean_sessions_reset_the_attempt_counter() {
    let group = ScriptedGroup::new([
        Step::Fail,
        Step::Clean,
        Step::Fail,
        Step::Clean,
        Step::Fail,
        Step::Clean,
    ]);
    let supervisor = supervisor(vec![("fallback-consumer", group.clone())], policy(1));
    let shutdown = CancellationToken::new();

    let handle = start(&supervisor, &shutdown, "fallback-consumer");
    group.wait_for_sessions(7).await;
    assert!(!handle.is_finished());

    shutdown.cancel();
    assert_eq!(handle.await.unwrap(), StopReason::Cancelled);
    assert_eq!(group.sessions(), 7);
}

#[tokio::test(start_paused = true)]
async fn unlimited_reconnects_keep_trying() {
    let group = ScriptedGroup::new([Step::Fail; 25]);
    let supervisor = supervisor(vec![("start-process", group.clone())], policy(0));
    let shutdown = CancellationToken::new();

    let handle = start(&supervisor, &shutdown, "start-process");
    group.wait_for_sessions(26).await;

    shutdown.cancel();
    assert_eq!(handle.await.unwrap(), StopReason::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_backoff() {
    let group = ScriptedGroup::new([Step::Fail]);
    let policy = RetryPolicy {
        initial_backoff: Duration::from_secs(60),
        max_backoff: Duration::from_secs(600),
        ..Default::default()
    };
    let supervisor = supervisor(vec![("start-process", group.clone())], policy);
    let shutdown = CancellationToken::new();

    let started = tokio::time::Instant::now();
    let handle = start(&supervisor, &shutdown, "start-process");
    group.wait_for_sessions(1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    shutdown.cancel();
    assert_eq!(handle.await.unwrap(), StopReason::Cancelled);
    assert_eq!(group.sessions(), 1);
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test]
async fn cancelled_token_never_opens_a_session() {
    let group = ScriptedGroup::new([]);
    let supervisor = supervisor(vec![("start-process", group.clone())], policy(0));
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let reason = start(&supervisor, &shutdown, "start-process").await.unwrap();

    assert_eq!(reason, StopReason::Cancelled);
    assert_eq!(group.sessions(), 0);
}

#[tokio::test]
async fn unregistered_key_is_not_started() {
    let group = ScriptedGroup::new([]);
    let supervisor = supervisor(vec![("start-process", group.clone())], policy(0));

    let handle = supervisor.start_consumer(
        CancellationToken::new(),
        "create-user-task-consumer",
        vec!["users".to_owned()],
        Arc::new(NoopHandler),
        1,
    );

    assert!(handle.is_none());
    assert!(supervisor.is_registered("start-process"));
    assert!(!supervisor.is_registered("create-user-task-consumer"));

    tokio::task::yield_now().await;
    assert_eq!(group.sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn wait_for_consumers_returns_once_all_stopped() {
    let first = ScriptedGroup::new([]);
    let second = ScriptedGroup::new([Step::Fail]);
    let supervisor = supervisor(
        vec![
            ("start-process", first.clone()),
            ("request-actions-consumer", second.clone()),
        ],
        policy(0),
    );
    let shutdown = CancellationToken::new();

    drop(start(&supervisor, &shutdown, "start-process"));
    drop(start(&supervisor, &shutdown, "request-actions-consumer"));
    first.wait_for_sessions(1).await;
    second.wait_for_sessions(2).await;

    shutdown.cancel();
    supervisor
        .wait_for_consumers(Duration::from_secs(5))
        .await
        .expect("consumers stop on cancel");
}

#[tokio::test(start_paused = true)]
async fn wait_for_consumers_times_out_on_a_stuck_session() {
    let group = ScriptedGroup::new([Step::Hang]);
    let supervisor = supervisor(vec![("start-process", group.clone())], policy(0));
    let shutdown = CancellationToken::new();

    let handle = start(&supervisor, &shutdown, "start-process");
    group.wait_for_sessions(1).await;

    shutdown.cancel();
    let result = supervisor.wait_for_consumers(Duration::from_secs(2)).await;

    assert!(result.is_err());
    // a timeout leaves the task running
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn close_reports_each_failure() {
    let healthy = ScriptedGroup::new([]);
    let broken = Arc::new(ScriptedGroup {
        fail_close: true,
        ..Default::default()
    });
    let supervisor = supervisor(
        vec![
            ("start-process", healthy),
            ("delegates-response-consumer", broken),
        ],
        policy(0),
    );

    let failures = supervisor.close_consumers();

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "delegates-response-consumer");
}
