mod client;

pub mod auth;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod retry;
pub mod service;
pub mod supervisor;

pub use config::KafkaConfig;
pub use consumer::{ConsumerGroup, MessageHandler};
pub use error::{ConfigurationError, KafkaProduceError, ServiceError};
pub use service::KafkaService;
pub use supervisor::{ConsumerSupervisor, StopReason};
