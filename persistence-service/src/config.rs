use envconfig::Envconfig;
use persistence_kafka::config::EnvMsDuration;
use persistence_kafka::KafkaConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    // How long consumers get to drain in-flight messages on shutdown
    #[envconfig(from = "SHUTDOWN_TIMEOUT_MS", default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
