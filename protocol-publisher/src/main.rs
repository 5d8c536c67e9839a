//! Generate a mock batch of protocol records and publish it to the queue.
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use protocol_common::signals::shutdown_token;
use protocol_common::transport::{KafkaTransport, QueueOptions};
use protocol_publisher::config::Config;
use protocol_publisher::generator::MockGenerator;
use protocol_publisher::publisher::{ProtocolPublisher, PublishError};

#[tokio::main]
async fn main() -> Result<(), PublishError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let mut generator = match config.mock_seed {
        Some(seed) => MockGenerator::seeded(&config.photo_base_path, seed),
        None => MockGenerator::new(&config.photo_base_path),
    };
    let records = generator.generate_batch();

    let publisher = ProtocolPublisher::new(
        KafkaTransport::new(config.kafka),
        QueueOptions::transient(config.queue_name.as_str()),
        config.connect_retry.policy(),
        shutdown_token(),
    );

    let summary = publisher.publish(&records).await?;
    info!(
        published = summary.published,
        failed = summary.failed,
        "finished publishing protocol records"
    );

    Ok(())
}
