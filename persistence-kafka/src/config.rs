use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::error::ConfigurationError;
use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_BROKERS", default = "localhost:9092")]
    pub brokers: CommaSeparated,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "persistence-service")]
    pub consumer_group: String,

    // Only used to check that the topics exist when the producer connects
    #[envconfig(from = "KAFKA_PRODUCER_TOPICS", default = "")]
    pub producer_topics: CommaSeparated,

    // Each key gets its own consumer group connection, created up front
    #[envconfig(from = "KAFKA_CONSUMER_KEYS", default = "")]
    pub consumer_keys: CommaSeparated,

    #[envconfig(nested = true)]
    pub retry: RetryConfig,

    // Mandatory: absent or zero fails service construction
    #[envconfig(from = "KAFKA_HEALTH_CHECK_TIMEOUT_MS")]
    pub health_check_timeout: Option<EnvMsDuration>,

    // 0 falls back to the handler default of 30
    #[envconfig(from = "KAFKA_CONSUMER_WORKERS_COUNT", default = "0")]
    pub consumer_workers_count: usize,

    #[envconfig(from = "KAFKA_PRODUCER_FLUSH_BYTES", default = "0")]
    pub producer_flush_bytes: usize,

    #[envconfig(from = "KAFKA_PRODUCER_FLUSH_MESSAGES", default = "0")]
    pub producer_flush_messages: usize,

    #[envconfig(from = "KAFKA_PRODUCER_FLUSH_FREQUENCY_MS", default = "0")]
    pub producer_flush_frequency: EnvMsDuration,

    #[envconfig(nested = true)]
    pub auth: AuthConfig,
}

impl KafkaConfig {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.0.join(",")
    }

    pub fn health_check_timeout(&self) -> Result<time::Duration, ConfigurationError> {
        match self.health_check_timeout {
            Some(EnvMsDuration(timeout)) if !timeout.is_zero() => Ok(timeout),
            _ => Err(ConfigurationError::MissingHealthCheckTimeout),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}

/// Raw retry settings. Zero means "not set" and is replaced by the defaults
/// in `RetryPolicy`.
#[derive(Envconfig, Clone, Debug, Default)]
pub struct RetryConfig {
    #[envconfig(from = "KAFKA_RETRY_TIMEOUT_MS", default = "0")]
    pub timeout: EnvMsDuration,

    #[envconfig(from = "KAFKA_RETRY_MAX_COUNT", default = "0")]
    pub max_count: u32,

    #[envconfig(from = "KAFKA_DIAL_TIMEOUT_MS", default = "0")]
    pub dial_timeout: EnvMsDuration,

    #[envconfig(from = "KAFKA_INITIAL_BACKOFF_MS", default = "0")]
    pub initial_backoff: EnvMsDuration,

    #[envconfig(from = "KAFKA_MAX_BACKOFF_MS", default = "0")]
    pub max_backoff: EnvMsDuration,

    #[envconfig(from = "KAFKA_BACKOFF_MULTIPLIER", default = "0")]
    pub backoff_multiplier: f64,

    #[envconfig(from = "KAFKA_MAX_RECONNECT_TRIES", default = "0")]
    pub max_reconnect_tries: u32,
}

/// Broker credentials are never configured directly: each field holds the
/// *name* of the environment variable carrying the secret.
#[derive(Envconfig, Clone, Debug)]
pub struct AuthConfig {
    #[envconfig(from = "KAFKA_AUTH_ENABLED", default = "false")]
    pub enable_auth: bool,

    #[envconfig(from = "KAFKA_AUTH_USERNAME_ENV", default = "KAFKA_USERNAME")]
    pub username_env: String,

    // The variable holds a base64 encoded password
    #[envconfig(from = "KAFKA_AUTH_PASSWORD_ENV", default = "KAFKA_PASSWORD")]
    pub password_env: String,

    // The variable holds a base64 encoded PEM CA bundle
    #[envconfig(from = "KAFKA_AUTH_CERTIFICATE_ENV", default = "KAFKA_CA_CERT")]
    pub certificate_env: String,

    #[envconfig(from = "KAFKA_AUTH_MECHANISM", default = "SCRAM-SHA-512")]
    pub mechanism: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enable_auth: false,
            username_env: "KAFKA_USERNAME".to_owned(),
            password_env: "KAFKA_PASSWORD".to_owned(),
            certificate_env: "KAFKA_CA_CERT".to_owned(),
            mechanism: "SCRAM-SHA-512".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A comma separated list, e.g. `kafka-1:9092,kafka-2:9092`. Blank entries are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaSeparated(pub Vec<String>);

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}

impl<S: Into<String>> FromIterator<S> for CommaSeparated {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        CommaSeparated(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<String, String> {
        HashMap::from([(
            "KAFKA_HEALTH_CHECK_TIMEOUT_MS".to_owned(),
            "30000".to_owned(),
        )])
    }

    #[test]
    fn defaults_from_empty_environment() {
        let config = KafkaConfig::init_from_hashmap(&base_env()).expect("valid config");

        assert_eq!(config.bootstrap_servers(), "localhost:9092");
        assert_eq!(config.consumer_group, "persistence-service");
        assert!(config.consumer_keys.0.is_empty());
        assert_eq!(
            config.health_check_timeout().unwrap(),
            time::Duration::from_secs(30)
        );
        assert!(!config.auth.enable_auth);
        assert_eq!(config.auth.mechanism, "SCRAM-SHA-512");
        assert_eq!(config.retry.max_count, 0);
    }

    #[test]
    fn parses_lists_and_nested_blocks() {
        let mut env = base_env();
        env.insert(
            "KAFKA_BROKERS".to_owned(),
            "kafka-1:9092, kafka-2:9092,,".to_owned(),
        );
        env.insert(
            "KAFKA_CONSUMER_KEYS".to_owned(),
            "start-process,fallback-consumer".to_owned(),
        );
        env.insert("KAFKA_MAX_RECONNECT_TRIES".to_owned(), "5".to_owned());
        env.insert("KAFKA_AUTH_ENABLED".to_owned(), "true".to_owned());
        env.insert(
            "KAFKA_AUTH_PASSWORD_ENV".to_owned(),
            "BROKER_SECRET".to_owned(),
        );

        let config = KafkaConfig::init_from_hashmap(&env).expect("valid config");

        assert_eq!(config.bootstrap_servers(), "kafka-1:9092,kafka-2:9092");
        assert_eq!(
            config.consumer_keys,
            CommaSeparated::from_iter(["start-process", "fallback-consumer"])
        );
        assert_eq!(config.retry.max_reconnect_tries, 5);
        assert!(config.auth.enable_auth);
        assert_eq!(config.auth.password_env, "BROKER_SECRET");
    }

    #[test]
    fn health_check_timeout_is_mandatory() {
        let config = KafkaConfig::init_from_hashmap(&HashMap::new()).expect("valid config");
        assert!(matches!(
            config.health_check_timeout(),
            Err(ConfigurationError::MissingHealthCheckTimeout)
        ));

        let zero = HashMap::from([(
            "KAFKA_HEALTH_CHECK_TIMEOUT_MS".to_owned(),
            "0".to_owned(),
        )]);
        let config = KafkaConfig::init_from_hashmap(&zero).expect("valid config");
        assert!(matches!(
            config.health_check_timeout(),
            Err(ConfigurationError::MissingHealthCheckTimeout)
        ));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(
            "1500".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(1500)))
        );
        assert_eq!(
            "1.5s".parse::<EnvMsDuration>(),
            Err(ParseEnvMsDurationError)
        );
    }
}
