//! An in-process `RecordStore`.
//!
//! A transaction holds the store lock until it is committed or dropped, so transactions are
//! serializable. Writes are staged on the transaction and only applied on commit.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Page, RecordStore, StoreError, StoreResult, StoreTransaction, UniqueKey};
use crate::record::{ErrorLogEntry, ProtocolRecord, StoredRecord};

#[derive(Default)]
struct MemoryState {
    next_id: i32,
    records: Vec<StoredRecord>,
    errors: Vec<ErrorLogEntry>,
}

/// The unique key of `record` that `existing` already holds, if any.
fn conflicting_key(existing: &ProtocolRecord, record: &ProtocolRecord) -> Option<UniqueKey> {
    if existing.protocol_number == record.protocol_number {
        Some(UniqueKey::ProtocolNumber)
    } else if existing.tax_id == record.tax_id && existing.copy_number == record.copy_number {
        Some(UniqueKey::TaxIdAndCopy)
    } else if existing.national_id == record.national_id
        && existing.copy_number == record.copy_number
    {
        Some(UniqueKey::NationalIdAndCopy)
    } else {
        None
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemoryStoreTransaction {
    state: OwnedMutexGuard<MemoryState>,
    staged_records: Vec<StoredRecord>,
    staged_errors: Vec<ErrorLogEntry>,
}

impl MemoryStoreTransaction {
    fn visible_records(&self) -> impl Iterator<Item = &ProtocolRecord> {
        self.state
            .records
            .iter()
            .chain(self.staged_records.iter())
            .map(|stored| &stored.record)
    }
}

#[async_trait]
impl StoreTransaction for MemoryStoreTransaction {
    async fn exists_by_protocol_number(&mut self, protocol_number: &str) -> StoreResult<bool> {
        Ok(self
            .visible_records()
            .any(|record| record.protocol_number == protocol_number))
    }

    async fn exists_by_tax_id_and_copy(
        &mut self,
        tax_id: &str,
        copy_number: i32,
    ) -> StoreResult<bool> {
        Ok(self
            .visible_records()
            .any(|record| record.tax_id == tax_id && record.copy_number == copy_number))
    }

    async fn exists_by_national_id_and_copy(
        &mut self,
        national_id: &str,
        copy_number: i32,
    ) -> StoreResult<bool> {
        Ok(self.visible_records().any(|record| {
            record.national_id == national_id && record.copy_number == copy_number
        }))
    }

    async fn insert(&mut self, record: &ProtocolRecord) -> StoreResult<i32> {
        if let Some(key) = self
            .visible_records()
            .find_map(|existing| conflicting_key(existing, record))
        {
            return Err(StoreError::ConstraintViolation { key });
        }

        let id = self.state.next_id + self.staged_records.len() as i32 + 1;
        self.staged_records.push(StoredRecord {
            id,
            record: record.clone(),
        });

        Ok(id)
    }

    async fn append_error(&mut self, entry: &ErrorLogEntry) -> StoreResult<()> {
        self.staged_errors.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryStoreTransaction {
            mut state,
            staged_records,
            staged_errors,
        } = *self;

        state.next_id += staged_records.len() as i32;
        state.records.extend(staged_records);
        state.errors.extend(staged_errors);

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let state = self.state.clone().lock_owned().await;

        Ok(Box::new(MemoryStoreTransaction {
            state,
            staged_records: Vec::new(),
            staged_errors: Vec::new(),
        }))
    }

    async fn find_by_protocol_number(
        &self,
        protocol_number: &str,
    ) -> StoreResult<Option<StoredRecord>> {
        let state = self.state.lock().await;

        Ok(state
            .records
            .iter()
            .find(|stored| stored.record.protocol_number == protocol_number)
            .cloned())
    }

    async fn find_by_tax_id(&self, tax_id: &str) -> StoreResult<Vec<StoredRecord>> {
        let state = self.state.lock().await;

        Ok(state
            .records
            .iter()
            .filter(|stored| stored.record.tax_id == tax_id)
            .cloned()
            .collect())
    }

    async fn find_by_national_id(&self, national_id: &str) -> StoreResult<Vec<StoredRecord>> {
        let state = self.state.lock().await;

        Ok(state
            .records
            .iter()
            .filter(|stored| stored.record.national_id == national_id)
            .cloned()
            .collect())
    }

    async fn list(&self, page: Page) -> StoreResult<Vec<StoredRecord>> {
        let state = self.state.lock().await;
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(page.page_size).unwrap_or(usize::MAX);

        Ok(state
            .records
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state.records.len() as i64)
    }

    async fn errors_for(&self, protocol_number: &str) -> StoreResult<Vec<ErrorLogEntry>> {
        let state = self.state.lock().await;

        Ok(state
            .errors
            .iter()
            .filter(|entry| entry.protocol_number == protocol_number)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(protocol_number: &str, copy_number: i32, tax_id: &str, national_id: &str) -> ProtocolRecord {
        ProtocolRecord {
            protocol_number: protocol_number.to_owned(),
            copy_number,
            tax_id: tax_id.to_owned(),
            national_id: national_id.to_owned(),
            full_name: "Arthur Pereira Santos".to_owned(),
            mother_name: "Juliana Santos".to_owned(),
            father_name: "Eduardo Pereira".to_owned(),
            photo_ref: "foto6.png".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_committed_records_are_queryable() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        let first = tx
            .insert(&record("00001", 1, "12345678901", "SP100001"))
            .await
            .unwrap();
        let second = tx
            .insert(&record("00106", 2, "12345678901", "SP100001"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(
            store
                .find_by_protocol_number("00106")
                .await
                .unwrap()
                .map(|stored| stored.id),
            Some(2)
        );
        assert_eq!(store.find_by_tax_id("12345678901").await.unwrap().len(), 2);
        assert_eq!(store.find_by_national_id("SP100001").await.unwrap().len(), 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = MemoryStore::new();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(&record("00001", 1, "12345678901", "SP100001"))
                .await
                .unwrap();
            tx.append_error(&ErrorLogEntry::new("00002", "whatever"))
                .await
                .unwrap();
        }

        let tx = store.begin().await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.errors_for("00002").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_staged_writes_are_visible_inside_the_transaction() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert(&record("00001", 1, "12345678901", "SP100001"))
            .await
            .unwrap();

        assert!(tx.exists_by_protocol_number("00001").await.unwrap());
        assert!(tx.exists_by_tax_id_and_copy("12345678901", 1).await.unwrap());
        assert!(!tx.exists_by_tax_id_and_copy("12345678901", 2).await.unwrap());
        assert!(tx.exists_by_national_id_and_copy("SP100001", 1).await.unwrap());
        assert!(!tx.exists_by_national_id_and_copy("MG100002", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_enforces_unique_keys() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert(&record("00001", 1, "12345678901", "SP100001"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let violations = [
            (record("00001", 2, "98765432100", "MG100002"), UniqueKey::ProtocolNumber),
            (record("00002", 1, "12345678901", "MG100002"), UniqueKey::TaxIdAndCopy),
            (record("00003", 1, "98765432100", "SP100001"), UniqueKey::NationalIdAndCopy),
        ];
        for (duplicate, expected) in violations {
            match tx.insert(&duplicate).await {
                Err(StoreError::ConstraintViolation { key }) => assert_eq!(key, expected),
                other => panic!("expected a constraint violation, got {:?}", other),
            }
        }

        // The transaction stays usable after a violation.
        tx.append_error(&ErrorLogEntry::new("00001", "duplicate"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.errors_for("00001").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_pages_in_id_order() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        for i in 1..=25 {
            tx.insert(&record(&format!("{i:05}"), 1, &format!("cpf{i}"), &format!("rg{i}")))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let first = store.list(Page::default()).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].record.protocol_number, "00001");

        let third = store.list(Page::new(3, 10).unwrap()).await.unwrap();
        assert_eq!(third.len(), 5);
        assert_eq!(third[0].record.protocol_number, "00021");

        assert!(store.list(Page::new(4, 10).unwrap()).await.unwrap().is_empty());
    }
}
