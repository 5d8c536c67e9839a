//! Queue transport backed by Kafka.
//!
//! A queue is a single-partition topic. Non-durable queues get a bounded retention instead of
//! surviving indefinitely. Acknowledgement stores the consumer offset, and a requeue seeks the
//! partition back so the same message is read again.
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::gauge;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, Offset};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AckMode, Acker, Delivery, QueueChannel, QueueOptions, QueueTransport, Subscription,
    TransportError,
};
use crate::config::KafkaConfig;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

struct KafkaContext {
    liveness: Option<HealthHandle>,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The main rdkafka loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }

        gauge!("protocol_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("protocol_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("protocol_kafka_callback_queue_depth").set(stats.replyq as f64);
    }
}

#[derive(Clone)]
pub struct KafkaTransport {
    config: KafkaConfig,
    liveness: Option<HealthHandle>,
}

impl KafkaTransport {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            liveness: None,
        }
    }

    /// Report healthy on `liveness` every time the producer emits statistics.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}

#[async_trait]
impl QueueTransport for KafkaTransport {
    async fn connect(&self) -> Result<Box<dyn QueueChannel>, TransportError> {
        info!("connecting to Kafka brokers at {}...", self.config.kafka_hosts);

        let mut producer_config = self.client_config();
        producer_config
            .set(
                "linger.ms",
                self.config.kafka_producer_linger_ms.to_string(),
            )
            .set(
                "message.timeout.ms",
                self.config.kafka_message_timeout_ms.to_string(),
            );

        debug!("rdkafka configuration: {:?}", producer_config);
        let producer: FutureProducer<KafkaContext> = producer_config
            .create_with_context(KafkaContext {
                liveness: self.liveness.clone(),
            })
            .map_err(unreachable)?;

        // Ping the cluster to make sure we can reach brokers
        let ping = producer.clone();
        let timeout = Duration::from_millis(self.config.kafka_metadata_timeout_ms);
        tokio::task::spawn_blocking(move || {
            ping.client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(drop)
        })
        .await
        .map_err(|error| TransportError::Unreachable(error.to_string()))?
        .map_err(unreachable)?;

        let admin: AdminClient<DefaultClientContext> =
            self.client_config().create().map_err(unreachable)?;

        info!("connected to Kafka brokers");

        Ok(Box::new(KafkaChannel {
            producer,
            admin,
            transport: self.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

fn unreachable(error: KafkaError) -> TransportError {
    TransportError::Unreachable(error.to_string())
}

/// Topic settings for a declared queue. Kafka has no exclusive or auto-delete topics, so only
/// durability maps onto the topic.
fn new_topic<'a>(options: &'a QueueOptions, transient_retention_ms: &'a str) -> NewTopic<'a> {
    let topic = NewTopic::new(&options.name, 1, TopicReplication::Fixed(1));

    if options.durable {
        topic
    } else {
        topic.set("retention.ms", transient_retention_ms)
    }
}

pub struct KafkaChannel {
    producer: FutureProducer<KafkaContext>,
    admin: AdminClient<DefaultClientContext>,
    transport: KafkaTransport,
    closed: CancellationToken,
}

#[async_trait]
impl QueueChannel for KafkaChannel {
    async fn declare_queue(&self, options: &QueueOptions) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if options.exclusive || options.auto_delete {
            warn!(
                queue = %options.name,
                "exclusive and auto-delete queues are not supported by Kafka, declaring a plain topic"
            );
        }

        let retention = self.transport.config.kafka_transient_retention_ms.to_string();
        let topic = new_topic(options, &retention);
        let admin_options = AdminOptions::new().operation_timeout(Some(Timeout::After(
            Duration::from_millis(self.transport.config.kafka_metadata_timeout_ms),
        )));

        let results = self
            .admin
            .create_topics(&[topic], &admin_options)
            .await
            .map_err(|error| TransportError::DeclareError {
                queue: options.name.clone(),
                reason: error.to_string(),
            })?;

        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((queue, code)) => {
                    return Err(TransportError::DeclareError {
                        queue,
                        reason: code.to_string(),
                    })
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        // The delivery future is dropped: publishing does not wait for broker confirmation.
        match self
            .producer
            .send_result(FutureRecord::<(), [u8]>::to(queue).payload(payload))
        {
            Ok(_) => Ok(()),
            Err((error, _)) => Err(TransportError::PublishError {
                queue: queue.to_owned(),
                reason: error.to_string(),
            }),
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        ack_mode: AckMode,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let config = &self.transport.config;
        let mut client_config = self.transport.client_config();
        client_config
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set(
                "enable.auto.offset.store",
                (ack_mode == AckMode::Auto).to_string(),
            );

        let consumer: StreamConsumer = client_config.create().map_err(unreachable)?;
        consumer
            .subscribe(&[queue])
            .map_err(|error| TransportError::ReceiveError {
                queue: queue.to_owned(),
                reason: error.to_string(),
            })?;

        Ok(Box::new(KafkaSubscription {
            inner: Arc::new(Inner {
                consumer,
                topic: queue.to_owned(),
            }),
            ack_mode,
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();

        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(FLUSH_TIMEOUT)))
            .await
            .map_err(|error| TransportError::FlushError(error.to_string()))?
            .map_err(|error| TransportError::FlushError(error.to_string()))
    }
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

pub struct KafkaSubscription {
    inner: Arc<Inner>,
    ack_mode: AckMode,
    closed: CancellationToken,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn recv(&mut self) -> Result<Delivery, TransportError> {
        let message = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            message = self.inner.consumer.recv() => message.map_err(|error| {
                TransportError::ReceiveError {
                    queue: self.inner.topic.clone(),
                    reason: error.to_string(),
                }
            })?,
        };

        // An empty payload fails to decode downstream and is acknowledged there like any
        // other malformed message.
        let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

        let acker: Option<Box<dyn Acker>> = match self.ack_mode {
            AckMode::Auto => None,
            AckMode::Manual => Some(Box::new(KafkaAcker {
                handle: Arc::downgrade(&self.inner),
                partition: message.partition(),
                offset: message.offset(),
            })),
        };

        Ok(Delivery { payload, acker })
    }
}

struct KafkaAcker {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl KafkaAcker {
    fn inner(&self) -> Result<Arc<Inner>, TransportError> {
        self.handle
            .upgrade()
            .ok_or_else(|| TransportError::AckError("consumer gone".to_owned()))
    }

    fn store(&self) -> Result<(), TransportError> {
        let inner = self.inner()?;
        // The stored offset is the next one to read.
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset + 1)
            .map_err(|error| TransportError::AckError(error.to_string()))
    }
}

impl Acker for KafkaAcker {
    fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.store()
    }

    fn nack(self: Box<Self>, requeue: bool) -> Result<(), TransportError> {
        if !requeue {
            return self.store();
        }

        let inner = self.inner()?;
        inner
            .consumer
            .seek(
                &inner.topic,
                self.partition,
                Offset::Offset(self.offset),
                Timeout::After(SEEK_TIMEOUT),
            )
            .map_err(|error| TransportError::AckError(error.to_string()))
    }
}
