use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::Statistics;

pub const METRIC_PRODUCE_TOTAL: &str = "kafka_produce_total";
pub const METRIC_PRODUCE_DURATION: &str = "kafka_produce_duration_seconds";
pub const METRIC_CONSUMER_SESSIONS: &str = "kafka_consumer_sessions_total";
pub const METRIC_CONSUMER_RECONNECTS: &str = "kafka_consumer_reconnect_attempts_total";
pub const METRIC_CONSUMER_STOPPED: &str = "kafka_consumer_stopped_total";
pub const METRIC_MESSAGES_HANDLED: &str = "kafka_messages_handled_total";
pub const METRIC_HANDLER_IN_FLIGHT: &str = "kafka_handler_in_flight";

/// Per-client rdkafka context. Each producer and consumer group owns one, and
/// every series it reports carries the client name, so two clients in the
/// same process never overwrite each other's statistics.
pub struct KafkaContext {
    client: String,
    liveness: HealthHandle,
}

impl KafkaContext {
    pub fn new(client: impl Into<String>, liveness: HealthHandle) -> Self {
        Self {
            client: client.into(),
            liveness,
        }
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub(crate) fn record_stats(&self, stats: &Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        let client = self.client.clone();
        gauge!("kafka_client_replyq", "client" => client.clone()).set(stats.replyq as f64);
        gauge!("kafka_client_msg_cnt", "client" => client.clone()).set(stats.msg_cnt as f64);
        gauge!("kafka_client_msg_size", "client" => client.clone()).set(stats.msg_size as f64);

        if let Some(group) = &stats.cgrp {
            gauge!("kafka_consumer_assignment_size", "client" => client.clone())
                .set(f64::from(group.assignment_size));
            counter!("kafka_consumer_rebalances_total", "client" => client.clone())
                .absolute(u64::try_from(group.rebalance_cnt).unwrap_or_default());
        }

        for broker in stats.brokers.values() {
            let broker_id = broker.nodeid.to_string();
            if let Some(rtt) = &broker.rtt {
                gauge!(
                    "kafka_broker_rtt_p99_us",
                    "client" => client.clone(),
                    "broker" => broker_id.clone()
                )
                .set(rtt.p99 as f64);
            }
            counter!(
                "kafka_broker_tx_errors_total",
                "client" => client.clone(),
                "broker" => broker_id.clone()
            )
            .absolute(broker.txerrs);
            counter!(
                "kafka_broker_rx_errors_total",
                "client" => client.clone(),
                "broker" => broker_id.clone()
            )
            .absolute(broker.rxerrs);
            counter!(
                "kafka_broker_request_timeouts",
                "client" => client.clone(),
                "broker" => broker_id
            )
            .absolute(broker.req_timeouts);
        }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: Statistics) {
        self.record_stats(&stats);
    }
}
