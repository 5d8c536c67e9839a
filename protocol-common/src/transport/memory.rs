//! An in-process broker with named FIFO queues.
//!
//! Queues live as long as the broker. Faults can be injected to exercise the reconnect and
//! per-message error paths: refused connections and failed publishes.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{
    AckMode, Acker, Delivery, QueueChannel, QueueOptions, QueueTransport, Subscription,
    TransportError,
};

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<Vec<u8>>>,
    available: Notify,
}

impl MemoryQueue {
    fn messages(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        // Nothing panics while holding this lock.
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_back(&self, payload: Vec<u8>) {
        self.messages().push_back(payload);
        self.available.notify_one();
    }

    fn push_front(&self, payload: Vec<u8>) {
        self.messages().push_front(payload);
        self.available.notify_one();
    }

    fn pop_front(&self) -> Option<Vec<u8>> {
        self.messages().pop_front()
    }
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, (QueueOptions, Arc<MemoryQueue>)>>,
    refused_connections: AtomicU32,
    failed_publishes: AtomicU32,
    connections: AtomicU32,
}

impl BrokerState {
    fn queue(&self, name: &str) -> Result<Arc<MemoryQueue>, TransportError> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .map(|(_, queue)| queue.clone())
            .ok_or_else(|| TransportError::QueueNotFound(name.to_owned()))
    }
}

/// Decrement `counter` if it is positive. Returns whether it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts as unreachable.
    pub fn refuse_connections(&self, count: u32) {
        self.state.refused_connections.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes, on any channel.
    pub fn fail_publishes(&self, count: u32) {
        self.state.failed_publishes.store(count, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn connection_attempts(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Messages waiting in `queue`, or `None` if it was never declared.
    pub fn depth(&self, queue: &str) -> Option<usize> {
        self.state
            .queue(queue)
            .ok()
            .map(|queue| queue.messages().len())
    }

    /// Enqueue a raw payload, bypassing any channel.
    pub fn inject(&self, queue: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.state.queue(queue)?.push_back(payload);
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn QueueChannel>, TransportError> {
        self.state.connections.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.state.refused_connections) {
            return Err(TransportError::Unreachable(
                "connection refused by memory broker".to_owned(),
            ));
        }

        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

pub struct MemoryChannel {
    state: Arc<BrokerState>,
    closed: CancellationToken,
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn declare_queue(&self, options: &QueueOptions) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut queues = self
            .state
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match queues.get(&options.name) {
            Some((declared, _)) if declared != options => Err(TransportError::DeclareError {
                queue: options.name.clone(),
                reason: "queue already declared with different flags".to_owned(),
            }),
            Some(_) => Ok(()),
            None => {
                queues.insert(
                    options.name.clone(),
                    (options.clone(), Arc::new(MemoryQueue::default())),
                );
                Ok(())
            }
        }
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        if take_one(&self.state.failed_publishes) {
            return Err(TransportError::PublishError {
                queue: queue.to_owned(),
                reason: "publish failure injected by memory broker".to_owned(),
            });
        }

        self.state.queue(queue)?.push_back(payload.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        ack_mode: AckMode,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        Ok(Box::new(MemorySubscription {
            queue: self.state.queue(queue)?,
            ack_mode,
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        Ok(())
    }
}

pub struct MemorySubscription {
    queue: Arc<MemoryQueue>,
    ack_mode: AckMode,
    closed: CancellationToken,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Delivery, TransportError> {
        loop {
            if self.closed.is_cancelled() {
                return Err(TransportError::Closed);
            }

            // Register interest before checking, so a push in between is not missed.
            let available = self.queue.available.notified();

            if let Some(payload) = self.queue.pop_front() {
                let acker: Option<Box<dyn Acker>> = match self.ack_mode {
                    AckMode::Auto => None,
                    AckMode::Manual => Some(Box::new(MemoryAcker {
                        queue: self.queue.clone(),
                        payload: payload.clone(),
                    })),
                };
                return Ok(Delivery { payload, acker });
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Err(TransportError::Closed),
                _ = available => {}
            }
        }
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    payload: Vec<u8>,
}

impl Acker for MemoryAcker {
    fn ack(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }

    fn nack(self: Box<Self>, requeue: bool) -> Result<(), TransportError> {
        if requeue {
            self.queue.push_front(self.payload);
        }
        Ok(())
    }
}
