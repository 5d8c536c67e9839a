use metrics::counter;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use protocol_common::record::ProtocolRecord;
use protocol_common::retry::{ConnectRetryPolicy, RetryError};
use protocol_common::transport::{QueueOptions, QueueTransport, TransportError};

/// Errors that abandon a whole batch. Failures of single records only show up in the summary.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("could not connect to the queue transport: {0}")]
    ConnectError(#[from] RetryError<TransportError>),
    #[error("could not declare the target queue: {0}")]
    DeclareError(TransportError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: usize,
    pub failed: usize,
}

/// Publishes batches of records onto a single queue.
pub struct ProtocolPublisher<T> {
    transport: T,
    queue: QueueOptions,
    retry_policy: ConnectRetryPolicy,
    shutdown: CancellationToken,
}

impl<T: QueueTransport> ProtocolPublisher<T> {
    pub fn new(
        transport: T,
        queue: QueueOptions,
        retry_policy: ConnectRetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            queue,
            retry_policy,
            shutdown,
        }
    }

    /// Publish every record of `records` over a fresh connection.
    /// Nothing is published if the transport stays unreachable for the whole retry budget.
    pub async fn publish(&self, records: &[ProtocolRecord]) -> Result<PublishSummary, PublishError> {
        let channel = self
            .retry_policy
            .run(
                "connect to queue transport",
                &self.shutdown,
                TransportError::is_unreachable,
                || self.transport.connect(),
            )
            .await?;

        if let Err(e) = channel.declare_queue(&self.queue).await {
            if let Err(close_error) = channel.close().await {
                warn!("failed to close channel: {}", close_error);
            }
            return Err(PublishError::DeclareError(e));
        }

        let mut summary = PublishSummary::default();

        for record in records {
            let result = match record.to_payload() {
                Ok(payload) => channel
                    .publish(&self.queue.name, &payload)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(()) => {
                    summary.published += 1;
                    counter!("protocol_publisher_records_total", "outcome" => "published")
                        .increment(1);
                    info!(
                        protocol_number = %record.protocol_number,
                        "published protocol record"
                    );
                }
                Err(reason) => {
                    summary.failed += 1;
                    counter!("protocol_publisher_records_total", "outcome" => "failed")
                        .increment(1);
                    error!(
                        protocol_number = %record.protocol_number,
                        "failed to publish protocol record: {}", reason
                    );
                }
            }
        }

        if let Err(e) = channel.close().await {
            error!("failed to close channel, pending records may be lost: {}", e);
        }

        Ok(summary)
    }
}
