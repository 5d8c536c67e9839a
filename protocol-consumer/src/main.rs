//! Consume protocol records from the queue, validate them and store them in Postgres.
use envconfig::Envconfig;
use health::HealthRegistry;
use tracing_subscriber::EnvFilter;

use protocol_common::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use protocol_common::signals::shutdown_token;
use protocol_common::store::PgRecordStore;
use protocol_common::transport::{KafkaTransport, QueueOptions};
use protocol_consumer::config::Config;
use protocol_consumer::consumer::ProtocolConsumer;
use protocol_consumer::error::ConsumerError;

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness.register(
        "consumer",
        time::Duration::milliseconds(config.liveness_deadline.0.as_millis() as i64),
    );
    let kafka_liveness = liveness.register("rdkafka", time::Duration::seconds(30));

    let recorder_handle = setup_metrics_recorder()
        .map_err(|e| ConsumerError::MetricsError(e.to_string()))?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router(recorder_handle, liveness);
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let store = PgRecordStore::new(&config.database_url, config.max_pg_connections).await?;
    store.migrate().await?;

    let consumer = ProtocolConsumer::new(
        KafkaTransport::new(config.kafka.clone()).with_liveness(kafka_liveness),
        store,
        QueueOptions::transient(config.queue_name.as_str()),
        config.ack_mode(),
        config.connect_retry.policy(),
        consumer_liveness,
        shutdown_token(),
    )
    .with_requeue_delay(config.requeue_delay.0);

    consumer.run().await
}
