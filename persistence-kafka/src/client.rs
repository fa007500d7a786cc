use std::time::Duration;

use rdkafka::ClientConfig;

use crate::auth::AuthContext;
use crate::config::KafkaConfig;
use crate::retry::RetryPolicy;

// librdkafka rejects values outside these ranges at client creation
const MIN_CONNECTION_SETUP_TIMEOUT_MS: u128 = 1000;
const MAX_RETRY_BACKOFF_MS: u128 = 300_000;

/// Settings shared by the producer and every consumer group: brokers,
/// statistics cadence (which drives liveness), dial timeout, metadata retry
/// backoff and, when enabled, TLS and SASL.
pub(crate) fn base_client_config(
    config: &KafkaConfig,
    policy: &RetryPolicy,
    auth: Option<&AuthContext>,
    health_check_timeout: Duration,
) -> ClientConfig {
    let stats_interval_ms = (health_check_timeout / 2).as_millis().max(1);
    let dial_timeout_ms = policy
        .dial_timeout
        .as_millis()
        .max(MIN_CONNECTION_SETUP_TIMEOUT_MS);
    let retry_backoff_ms = policy.timeout.as_millis().clamp(1, MAX_RETRY_BACKOFF_MS);

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("statistics.interval.ms", stats_interval_ms.to_string())
        .set("socket.connection.setup.timeout.ms", dial_timeout_ms.to_string())
        .set("retry.backoff.ms", retry_backoff_ms.to_string())
        .set("retry.backoff.max.ms", retry_backoff_ms.to_string());

    if let Some(auth) = auth {
        auth.apply(&mut client_config);
    }

    client_config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommaSeparated, EnvMsDuration};
    use envconfig::Envconfig;
    use std::collections::HashMap;

    fn config() -> KafkaConfig {
        let mut config = KafkaConfig::init_from_hashmap(&HashMap::new()).unwrap();
        config.brokers = CommaSeparated::from_iter(["kafka-1:9092", "kafka-2:9092"]);
        config.health_check_timeout = Some(EnvMsDuration(Duration::from_secs(20)));
        config
    }

    #[test]
    fn applies_brokers_and_timeouts() {
        let client_config = base_client_config(
            &config(),
            &RetryPolicy::default(),
            None,
            Duration::from_secs(20),
        );

        assert_eq!(
            client_config.get("bootstrap.servers"),
            Some("kafka-1:9092,kafka-2:9092")
        );
        assert_eq!(client_config.get("statistics.interval.ms"), Some("10000"));
        assert_eq!(
            client_config.get("socket.connection.setup.timeout.ms"),
            Some("5000")
        );
        assert_eq!(client_config.get("retry.backoff.ms"), Some("5000"));
        assert_eq!(client_config.get("security.protocol"), None);
    }

    #[test]
    fn clamps_to_librdkafka_ranges() {
        let policy = RetryPolicy {
            dial_timeout: Duration::from_millis(10),
            timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let client_config =
            base_client_config(&config(), &policy, None, Duration::from_millis(1));

        assert_eq!(client_config.get("statistics.interval.ms"), Some("1"));
        assert_eq!(
            client_config.get("socket.connection.setup.timeout.ms"),
            Some("1000")
        );
        assert_eq!(client_config.get("retry.backoff.ms"), Some("300000"));
        assert_eq!(client_config.get("retry.backoff.max.ms"), Some("300000"));
    }
}
