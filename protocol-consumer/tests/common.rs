#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use health::{HealthHandle, HealthRegistry};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use protocol_common::record::{ErrorLogEntry, ProtocolRecord, StoredRecord};
use protocol_common::retry::ConnectRetryPolicy;
use protocol_common::store::{
    MemoryStore, Page, RecordStore, StoreError, StoreResult, StoreTransaction,
};
use protocol_common::transport::{AckMode, MemoryBroker, QueueOptions};
use protocol_consumer::consumer::ProtocolConsumer;
use protocol_consumer::error::ConsumerError;
use protocol_publisher::publisher::ProtocolPublisher;

pub const QUEUE: &str = "protocolos";

pub fn record(
    protocol_number: &str,
    copy_number: i32,
    tax_id: &str,
    national_id: &str,
) -> ProtocolRecord {
    ProtocolRecord {
        protocol_number: protocol_number.to_owned(),
        copy_number,
        tax_id: tax_id.to_owned(),
        national_id: national_id.to_owned(),
        full_name: "Pedro Oliveira Costa".to_owned(),
        mother_name: "Fernanda Costa".to_owned(),
        father_name: "Gabriel Oliveira".to_owned(),
        photo_ref: "wwwroot/fotos/foto1.jpg".to_owned(),
    }
}

pub fn publisher(broker: &MemoryBroker) -> ProtocolPublisher<MemoryBroker> {
    ProtocolPublisher::new(
        broker.clone(),
        QueueOptions::transient(QUEUE),
        ConnectRetryPolicy::default(),
        CancellationToken::new(),
    )
}

pub struct RunningConsumer {
    pub registry: HealthRegistry,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<(), ConsumerError>>,
}

impl RunningConsumer {
    pub async fn stop(self) -> Result<(), ConsumerError> {
        self.shutdown.cancel();
        self.handle.await.expect("consumer task panicked")
    }
}

fn liveness(registry: &HealthRegistry) -> HealthHandle {
    registry.register("consumer", time::Duration::seconds(30))
}

/// Spawn a consumer in manual acknowledgement mode over `broker` and `store`.
pub fn start_consumer<S>(broker: &MemoryBroker, store: S) -> RunningConsumer
where
    S: RecordStore + 'static,
{
    let registry = HealthRegistry::new("liveness");
    let shutdown = CancellationToken::new();
    let consumer = ProtocolConsumer::new(
        broker.clone(),
        store,
        QueueOptions::transient(QUEUE),
        AckMode::Manual,
        ConnectRetryPolicy::default(),
        liveness(&registry),
        shutdown.clone(),
    )
    .with_requeue_delay(Duration::from_millis(10));

    let handle = tokio::spawn(async move { consumer.run().await });

    RunningConsumer {
        registry,
        shutdown,
        handle,
    }
}

/// Wait until `condition` holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// A `MemoryStore` whose next `failures` transactions cannot be opened.
#[derive(Clone)]
pub struct FlakyStore {
    inner: MemoryStore,
    failures: Arc<AtomicU32>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore, failures: u32) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicU32::new(failures)),
        }
    }

    pub fn remaining_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if failing {
            return Err(StoreError::TransactionError {
                command: "BEGIN".to_owned(),
                error: sqlx::Error::PoolTimedOut,
            });
        }

        self.inner.begin().await
    }

    async fn find_by_protocol_number(
        &self,
        protocol_number: &str,
    ) -> StoreResult<Option<StoredRecord>> {
        self.inner.find_by_protocol_number(protocol_number).await
    }

    async fn find_by_tax_id(&self, tax_id: &str) -> StoreResult<Vec<StoredRecord>> {
        self.inner.find_by_tax_id(tax_id).await
    }

    async fn find_by_national_id(&self, national_id: &str) -> StoreResult<Vec<StoredRecord>> {
        self.inner.find_by_national_id(national_id).await
    }

    async fn list(&self, page: Page) -> StoreResult<Vec<StoredRecord>> {
        self.inner.list(page).await
    }

    async fn count(&self) -> StoreResult<i64> {
        self.inner.count().await
    }

    async fn errors_for(&self, protocol_number: &str) -> StoreResult<Vec<ErrorLogEntry>> {
        self.inner.errors_for(protocol_number).await
    }
}
