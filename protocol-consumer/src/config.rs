use envconfig::Envconfig;

use protocol_common::config::{ConnectRetryConfig, EnvMsDuration, KafkaConfig, NonEmptyString};
use protocol_common::transport::AckMode;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    pub database_url: String,

    pub queue_name: NonEmptyString,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    /// Acknowledge deliveries on hand-off instead of after they are committed.
    #[envconfig(default = "false")]
    pub auto_ack: bool,

    /// How long to wait before receiving again after a delivery was requeued.
    #[envconfig(default = "1000")]
    pub requeue_delay: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub connect_retry: ConnectRetryConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ack_mode(&self) -> AckMode {
        if self.auto_ack {
            AckMode::Auto
        } else {
            AckMode::Manual
        }
    }
}
