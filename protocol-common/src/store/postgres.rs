//! A `RecordStore` implemented on top of the `Protocolos` and `LogErros` PostgreSQL tables.
use std::time;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Acquire, Postgres, Transaction};

use super::{Page, RecordStore, StoreError, StoreResult, StoreTransaction, UniqueKey};
use crate::record::{ErrorLogEntry, ProtocolRecord, StoredRecord};

const SELECT_STORED_RECORD: &str = r#"
SELECT
    "Id", "NumeroProtocolo", "NumeroVia", "Cpf", "Rg", "Nome", "NomeMae", "NomePai", "Foto"
FROM
    "Protocolos"
"#;

/// Return the violated key if `error` comes from one of our unique indexes.
fn unique_violation(error: &sqlx::Error) -> Option<UniqueKey> {
    match error {
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => db_error
            .constraint()
            .and_then(UniqueKey::from_index_name),
        _ => None,
    }
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

fn transaction_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::TransactionError {
        command: command.to_owned(),
        error,
    }
}

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Connect a new pool to `url`.
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(time::Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|error| StoreError::PoolCreationError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables and unique indexes if they are missing.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::MigrationError { error })
    }
}

pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn exists_by_protocol_number(&mut self, protocol_number: &str) -> StoreResult<bool> {
        sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM "Protocolos" WHERE "NumeroProtocolo" = $1)"#,
        )
        .bind(protocol_number)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_error("SELECT"))
    }

    async fn exists_by_tax_id_and_copy(
        &mut self,
        tax_id: &str,
        copy_number: i32,
    ) -> StoreResult<bool> {
        sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM "Protocolos" WHERE "Cpf" = $1 AND "NumeroVia" = $2)"#,
        )
        .bind(tax_id)
        .bind(copy_number)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_error("SELECT"))
    }

    async fn exists_by_national_id_and_copy(
        &mut self,
        national_id: &str,
        copy_number: i32,
    ) -> StoreResult<bool> {
        sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM "Protocolos" WHERE "Rg" = $1 AND "NumeroVia" = $2)"#,
        )
        .bind(national_id)
        .bind(copy_number)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_error("SELECT"))
    }

    async fn insert(&mut self, record: &ProtocolRecord) -> StoreResult<i32> {
        // A failed statement aborts the whole Postgres transaction, so the insert runs inside a
        // savepoint to keep the outer transaction usable for the error log.
        let mut savepoint = (&mut self.tx)
            .begin()
            .await
            .map_err(transaction_error("SAVEPOINT"))?;

        let inserted = sqlx::query_scalar(
            r#"
INSERT INTO "Protocolos"
    ("NumeroProtocolo", "NumeroVia", "Cpf", "Rg", "Nome", "NomeMae", "NomePai", "Foto")
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
RETURNING
    "Id"
            "#,
        )
        .bind(&record.protocol_number)
        .bind(record.copy_number)
        .bind(&record.tax_id)
        .bind(&record.national_id)
        .bind(&record.full_name)
        .bind(&record.mother_name)
        .bind(&record.father_name)
        .bind(&record.photo_ref)
        .fetch_one(&mut *savepoint)
        .await;

        match inserted {
            Ok(id) => {
                savepoint
                    .commit()
                    .await
                    .map_err(transaction_error("RELEASE SAVEPOINT"))?;
                Ok(id)
            }
            Err(error) => {
                savepoint
                    .rollback()
                    .await
                    .map_err(transaction_error("ROLLBACK TO SAVEPOINT"))?;

                match unique_violation(&error) {
                    Some(key) => Err(StoreError::ConstraintViolation { key }),
                    None => Err(StoreError::QueryError {
                        command: "INSERT".to_owned(),
                        error,
                    }),
                }
            }
        }
    }

    async fn append_error(&mut self, entry: &ErrorLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO "LogErros"
    ("NumeroProtocolo", "MotivoErro", "DataHora")
VALUES
    ($1, $2, $3)
            "#,
        )
        .bind(&entry.protocol_number)
        .bind(&entry.reason)
        .bind(entry.logged_at)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error("INSERT"))?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(transaction_error("COMMIT"))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.map_err(transaction_error("ROLLBACK"))
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(transaction_error("BEGIN"))?;

        Ok(Box::new(PgStoreTransaction { tx }))
    }

    async fn find_by_protocol_number(
        &self,
        protocol_number: &str,
    ) -> StoreResult<Option<StoredRecord>> {
        let query = format!(r#"{SELECT_STORED_RECORD} WHERE "NumeroProtocolo" = $1"#);

        sqlx::query_as(&query)
            .bind(protocol_number)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn find_by_tax_id(&self, tax_id: &str) -> StoreResult<Vec<StoredRecord>> {
        let query = format!(r#"{SELECT_STORED_RECORD} WHERE "Cpf" = $1 ORDER BY "Id""#);

        sqlx::query_as(&query)
            .bind(tax_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn find_by_national_id(&self, national_id: &str) -> StoreResult<Vec<StoredRecord>> {
        let query = format!(r#"{SELECT_STORED_RECORD} WHERE "Rg" = $1 ORDER BY "Id""#);

        sqlx::query_as(&query)
            .bind(national_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn list(&self, page: Page) -> StoreResult<Vec<StoredRecord>> {
        let query = format!(r#"{SELECT_STORED_RECORD} ORDER BY "Id" LIMIT $1 OFFSET $2"#);

        sqlx::query_as(&query)
            .bind(page.page_size)
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn count(&self) -> StoreResult<i64> {
        sqlx::query_scalar(r#"SELECT COUNT(*) FROM "Protocolos""#)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("SELECT"))
    }

    async fn errors_for(&self, protocol_number: &str) -> StoreResult<Vec<ErrorLogEntry>> {
        sqlx::query_as(
            r#"
SELECT
    "NumeroProtocolo", "MotivoErro", "DataHora"
FROM
    "LogErros"
WHERE
    "NumeroProtocolo" = $1
ORDER BY
    "Id"
            "#,
        )
        .bind(protocol_number)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))
    }
}
