//! Configuration pieces shared by the publisher and the consumer binaries.
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::retry::ConnectRetryPolicy;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "10000")]
    pub kafka_metadata_timeout_ms: u64, // How long a connect attempt waits for broker metadata

    #[envconfig(default = "3600000")]
    pub kafka_transient_retention_ms: u64, // Retention of non-durable queues: 1 hour

    #[envconfig(default = "protocol-consumer")]
    pub kafka_consumer_group: String,

    // We default to "earliest" so records published before the consumer started are not skipped
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest
}

/// How many times, and how far apart, a service tries to reach the queue transport at startup.
#[derive(Envconfig, Clone)]
pub struct ConnectRetryConfig {
    #[envconfig(from = "CONNECT_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,

    #[envconfig(from = "CONNECT_RETRY_INTERVAL", default = "5000")]
    pub retry_interval: EnvMsDuration,

    #[envconfig(from = "CONNECT_BACKOFF_COEFFICIENT", default = "1")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "CONNECT_MAXIMUM_INTERVAL")]
    pub maximum_interval: Option<EnvMsDuration>,
}

impl ConnectRetryConfig {
    pub fn policy(&self) -> ConnectRetryPolicy {
        ConnectRetryPolicy::new(
            self.max_attempts,
            self.backoff_coefficient,
            self.retry_interval.0,
            self.maximum_interval.map(|interval| interval.0),
        )
    }
}

#[derive(Debug, Clone, Copy)]
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ms_duration() {
        let duration: EnvMsDuration = "5000".parse().unwrap();
        assert_eq!(duration.0, time::Duration::from_secs(5));

        assert_eq!(
            "5s".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }

    #[test]
    fn test_parse_non_empty_string() {
        let queue: NonEmptyString = "protocolos".parse().unwrap();
        assert_eq!(queue.as_str(), "protocolos");

        assert_eq!("".parse::<NonEmptyString>().unwrap_err(), StringIsEmptyError);
        assert_eq!(
            "   ".parse::<NonEmptyString>().unwrap_err(),
            StringIsEmptyError
        );
    }

    #[test]
    fn test_default_connect_policy_is_five_attempts_five_seconds_apart() {
        let config = ConnectRetryConfig {
            max_attempts: 5,
            retry_interval: EnvMsDuration(time::Duration::from_secs(5)),
            backoff_coefficient: 1,
            maximum_interval: None,
        };
        let policy = config.policy();

        assert_eq!(policy.max_attempts(), 5);
        for attempt in 1..5 {
            assert_eq!(
                policy.time_until_next_attempt(attempt),
                time::Duration::from_secs(5)
            );
        }
    }
}
