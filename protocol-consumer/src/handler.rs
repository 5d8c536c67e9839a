//! # ProtocolHandler
//!
//! Decode, validate and persist a single delivery inside one store transaction.
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{error, info, warn};

use protocol_common::record::{ErrorLogEntry, ProtocolRecord};
use protocol_common::store::{RecordStore, StoreError, StoreResult, StoreTransaction};

use crate::error::HandleError;
use crate::validation::{validate, Rejection};

/// What happened to a delivery that does not need to be delivered again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Stored under the given id.
    Persisted { id: i32 },
    /// Failed a rule. The rejection was written to the error log.
    Rejected(Rejection),
    /// Not a protocol record. Nothing was written.
    Malformed,
}

pub struct ProtocolHandler<S> {
    store: S,
}

impl<S: RecordStore> ProtocolHandler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process one delivery payload. An `Err` means nothing was committed and the delivery
    /// should be retried.
    pub async fn handle(&self, payload: &[u8]) -> Result<Outcome, HandleError> {
        let start = Instant::now();

        let record = match ProtocolRecord::from_payload(payload) {
            Ok(record) => record,
            Err(e) => {
                warn!("dropping malformed protocol message: {}", e);
                counter!("protocol_consumer_messages_total", "outcome" => "malformed")
                    .increment(1);
                return Ok(Outcome::Malformed);
            }
        };

        let result = self.persist(&record).await;
        histogram!("protocol_consumer_handle_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(Outcome::Persisted { id }) => {
                info!(
                    protocol_number = %record.protocol_number,
                    id, "stored protocol record"
                );
                counter!("protocol_consumer_messages_total", "outcome" => "persisted")
                    .increment(1);
                Ok(Outcome::Persisted { id })
            }
            Ok(Outcome::Rejected(rejection)) => {
                warn!(
                    protocol_number = %record.protocol_number,
                    rule = rejection.rule(),
                    "rejected protocol record: {}", rejection
                );
                counter!("protocol_consumer_messages_total", "outcome" => "rejected")
                    .increment(1);
                counter!("protocol_consumer_rejections_total", "rule" => rejection.rule())
                    .increment(1);
                Ok(Outcome::Rejected(rejection))
            }
            Ok(Outcome::Malformed) => Ok(Outcome::Malformed),
            Err(e) => {
                error!(
                    protocol_number = %record.protocol_number,
                    "failed to persist protocol record: {}", e
                );
                counter!("protocol_consumer_messages_total", "outcome" => "failed")
                    .increment(1);
                Err(HandleError::PersistenceError {
                    protocol_number: record.protocol_number,
                    error: e,
                })
            }
        }
    }

    /// Run the whole decision in one transaction and commit it, or roll it back on any error.
    async fn persist(&self, record: &ProtocolRecord) -> StoreResult<Outcome> {
        let mut tx = self.store.begin().await?;

        match decide(record, tx.as_mut()).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!("failed to roll back transaction: {}", rollback_error);
                }
                Err(e)
            }
        }
    }
}

async fn decide(record: &ProtocolRecord, tx: &mut dyn StoreTransaction) -> StoreResult<Outcome> {
    let rejection = match validate(record, tx).await? {
        Some(rejection) => rejection,
        None => match tx.insert(record).await {
            Ok(id) => return Ok(Outcome::Persisted { id }),
            // Another writer stored a conflicting record after validation ran.
            Err(StoreError::ConstraintViolation { key }) => Rejection::from_violation(key, record),
            Err(e) => return Err(e),
        },
    };

    tx.append_error(&ErrorLogEntry::new(
        &record.protocol_number,
        rejection.to_string(),
    ))
    .await?;

    Ok(Outcome::Rejected(rejection))
}
