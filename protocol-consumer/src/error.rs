use thiserror::Error;

use protocol_common::retry::RetryError;
use protocol_common::store::StoreError;
use protocol_common::transport::TransportError;

/// A delivery that could not be processed and should be delivered again.
#[derive(Error, Debug)]
pub enum HandleError {
    #[error("failed to persist protocol record {protocol_number}: {error}")]
    PersistenceError {
        protocol_number: String,
        error: StoreError,
    },
}

/// Errors that stop the consume loop.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("could not connect to the queue transport: {0}")]
    ConnectError(#[from] RetryError<TransportError>),
    #[error("queue transport failed: {0}")]
    TransportError(#[from] TransportError),
    #[error("record store failed: {0}")]
    StoreError(#[from] StoreError),
    #[error("metrics recorder could not be installed: {0}")]
    MetricsError(String),
}
