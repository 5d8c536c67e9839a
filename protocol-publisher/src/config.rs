use envconfig::Envconfig;

use protocol_common::config::{ConnectRetryConfig, KafkaConfig, NonEmptyString};

#[derive(Envconfig, Clone)]
pub struct Config {
    pub queue_name: NonEmptyString,

    #[envconfig(default = "wwwroot/fotos")]
    pub photo_base_path: String,

    /// Makes the generated batch reproducible when set.
    pub mock_seed: Option<u64>,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub connect_retry: ConnectRetryConfig,
}
