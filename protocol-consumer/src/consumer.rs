//! # ProtocolConsumer
//!
//! Subscribe to the protocol queue and feed every delivery through a `ProtocolHandler`, one at
//! a time, until cancelled.
use std::time::Duration;

use health::{ComponentStatus, HealthHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use protocol_common::retry::ConnectRetryPolicy;
use protocol_common::store::RecordStore;
use protocol_common::transport::{
    AckMode, Delivery, QueueOptions, QueueTransport, Subscription, TransportError,
};

use crate::error::ConsumerError;
use crate::handler::ProtocolHandler;

/// How often the loop reports liveness while idle.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

pub struct ProtocolConsumer<T, S> {
    transport: T,
    handler: ProtocolHandler<S>,
    queue: QueueOptions,
    ack_mode: AckMode,
    retry_policy: ConnectRetryPolicy,
    /// Pause before receiving again after a delivery was handed back for redelivery.
    requeue_delay: Duration,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl<T: QueueTransport, S: RecordStore> ProtocolConsumer<T, S> {
    pub fn new(
        transport: T,
        store: S,
        queue: QueueOptions,
        ack_mode: AckMode,
        retry_policy: ConnectRetryPolicy,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            handler: ProtocolHandler::new(store),
            queue,
            ack_mode,
            retry_policy,
            requeue_delay: Duration::from_secs(1),
            liveness,
            shutdown,
        }
    }

    pub fn with_requeue_delay(mut self, requeue_delay: Duration) -> Self {
        self.requeue_delay = requeue_delay;
        self
    }

    pub fn store(&self) -> &S {
        self.handler.store()
    }

    /// Connect, subscribe and consume until the shutdown token is cancelled.
    /// The channel is closed on the way out, whatever the reason.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        let channel = match self
            .retry_policy
            .run(
                "connect to queue transport",
                &self.shutdown,
                TransportError::is_unreachable,
                || self.transport.connect(),
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                self.liveness.report_status(ComponentStatus::Unhealthy);
                return Err(e.into());
            }
        };

        let result = match channel.declare_queue(&self.queue).await {
            Ok(()) => match channel.subscribe(&self.queue.name, self.ack_mode).await {
                Ok(mut subscription) => self.consume(subscription.as_mut()).await,
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        };

        if let Err(e) = channel.close().await {
            warn!("failed to close channel: {}", e);
        }
        self.liveness.report_status(match result {
            Ok(()) => ComponentStatus::Stopped,
            Err(_) => ComponentStatus::Unhealthy,
        });

        result
    }

    async fn consume(&self, subscription: &mut dyn Subscription) -> Result<(), ConsumerError> {
        info!(queue = %self.queue.name, "waiting for protocol records");
        let mut heartbeat = tokio::time::interval(LIVENESS_INTERVAL);

        loop {
            let delivery = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, stopping consumer");
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    self.liveness.report_healthy();
                    continue;
                }
                delivery = subscription.recv() => delivery,
            };

            match delivery {
                Ok(delivery) => {
                    self.liveness.report_healthy();
                    self.process(delivery).await;
                }
                Err(TransportError::Closed) => {
                    return Err(TransportError::Closed.into());
                }
                Err(e) => {
                    metrics::counter!("protocol_consumer_receive_errors_total").increment(1);
                    error!("failed to receive delivery: {}", e);
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let acknowledged = match self.handler.handle(&delivery.payload).await {
            Ok(_) => delivery.ack(),
            Err(e) if self.ack_mode == AckMode::Auto => {
                warn!("delivery was already acknowledged and is lost: {}", e);
                Ok(())
            }
            Err(_) => {
                let requeued = delivery.nack(true);
                self.wait_before_redelivery().await;
                requeued
            }
        };

        if let Err(e) = acknowledged {
            error!("failed to acknowledge delivery: {}", e);
        }
    }

    async fn wait_before_redelivery(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.requeue_delay) => {}
        }
    }
}
