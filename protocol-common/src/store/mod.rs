//! # Record Store
//!
//! The single source of truth for persisted protocol records and the error log.
//! Writes only happen inside a `StoreTransaction`; dropping a transaction without
//! committing it rolls every staged write back.
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{ErrorLogEntry, ProtocolRecord, StoredRecord};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgRecordStore;

/// The three uniqueness constraints of `Protocolos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueKey {
    ProtocolNumber,
    TaxIdAndCopy,
    NationalIdAndCopy,
}

impl UniqueKey {
    /// Name of the unique index backing this key.
    pub fn index_name(&self) -> &'static str {
        match self {
            UniqueKey::ProtocolNumber => "idx_numero_protocolo",
            UniqueKey::TaxIdAndCopy => "idx_cpf_numero_via",
            UniqueKey::NationalIdAndCopy => "idx_rg_numero_via",
        }
    }

    pub fn from_index_name(name: &str) -> Option<Self> {
        [
            UniqueKey::ProtocolNumber,
            UniqueKey::TaxIdAndCopy,
            UniqueKey::NationalIdAndCopy,
        ]
        .into_iter()
        .find(|key| key.index_name() == name)
    }
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.index_name())
    }
}

/// Enumeration of errors for operations with a RecordStore.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("record violates unique constraint {key}")]
    ConstraintViolation { key: UniqueKey },
    #[error("invalid page request: page {page}, page size {page_size}")]
    InvalidPage { page: i64, page_size: i64 },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A 1-based page request for paginated scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub page_size: i64,
}

impl Page {
    pub fn new(page: i64, page_size: i64) -> StoreResult<Self> {
        if page < 1 || page_size < 1 {
            return Err(StoreError::InvalidPage { page, page_size });
        }
        Ok(Self { page, page_size })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 10,
        }
    }
}

/// A storage transaction scoped to the processing of one message.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn exists_by_protocol_number(&mut self, protocol_number: &str) -> StoreResult<bool>;

    async fn exists_by_tax_id_and_copy(&mut self, tax_id: &str, copy_number: i32)
        -> StoreResult<bool>;

    async fn exists_by_national_id_and_copy(
        &mut self,
        national_id: &str,
        copy_number: i32,
    ) -> StoreResult<bool>;

    /// Insert a record and return its id.
    /// A violated unique constraint comes back as `StoreError::ConstraintViolation` and leaves
    /// the transaction usable, so the rejection can still be logged and committed.
    async fn insert(&mut self, record: &ProtocolRecord) -> StoreResult<i32>;

    async fn append_error(&mut self, entry: &ErrorLogEntry) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    async fn find_by_protocol_number(
        &self,
        protocol_number: &str,
    ) -> StoreResult<Option<StoredRecord>>;

    async fn find_by_tax_id(&self, tax_id: &str) -> StoreResult<Vec<StoredRecord>>;

    async fn find_by_national_id(&self, national_id: &str) -> StoreResult<Vec<StoredRecord>>;

    /// Records ordered by id.
    async fn list(&self, page: Page) -> StoreResult<Vec<StoredRecord>>;

    async fn count(&self) -> StoreResult<i64>;

    async fn errors_for(&self, protocol_number: &str) -> StoreResult<Vec<ErrorLogEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_key_from_index_name() {
        assert_eq!(
            UniqueKey::from_index_name("idx_numero_protocolo"),
            Some(UniqueKey::ProtocolNumber)
        );
        assert_eq!(
            UniqueKey::from_index_name("idx_cpf_numero_via"),
            Some(UniqueKey::TaxIdAndCopy)
        );
        assert_eq!(
            UniqueKey::from_index_name("idx_rg_numero_via"),
            Some(UniqueKey::NationalIdAndCopy)
        );
        assert_eq!(UniqueKey::from_index_name("PK_Protocolos"), None);
    }

    #[test]
    fn test_page_offsets() {
        assert_eq!(Page::default().offset(), 0);
        assert_eq!(Page::new(3, 10).unwrap().offset(), 20);
        assert!(matches!(
            Page::new(0, 10),
            Err(StoreError::InvalidPage { page: 0, .. })
        ));
        assert!(Page::new(1, 0).is_err());
    }
}
