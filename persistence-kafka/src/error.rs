use rdkafka::error::KafkaError;
use serde_json::error::Error as SerdeError;
use thiserror::Error;

/// Missing or invalid setup. Always fatal at construction, never retried.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("field health_check_timeout isn't specified in the config")]
    MissingHealthCheckTimeout,
    #[error("environment variable {name} is not set")]
    MissingEnvVar { name: String },
    #[error("environment variable {name} is not valid base64: {source}")]
    InvalidBase64 {
        name: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("environment variable {name} does not decode to UTF-8 text")]
    InvalidUtf8 { name: String },
    #[error("CA certificate from environment variable {name} is unusable: {reason}")]
    InvalidCertificate { name: String, reason: String },
    #[error("unsupported SASL mechanism: {0}")]
    UnsupportedMechanism(String),
}

/// Enumeration of errors that can happen while building the kafka service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid kafka configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("failed to create kafka client: {0}")]
    Client(#[from] KafkaError),
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("kafka service is unavailable")]
    Unavailable,
    #[error("failed to serialize message: {error}")]
    SerializationError { error: SerdeError },
    #[error("failed to send message to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
}
