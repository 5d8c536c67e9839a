//! # Queue Transport
//!
//! A named queue carrying one producer's messages to one consumer process.
//! `connect` opens a connection and a channel in one step; the channel declares queues,
//! publishes without waiting for delivery confirmation, and subscribes.
use async_trait::async_trait;
use thiserror::Error;

pub mod kafka;
pub mod memory;

pub use kafka::KafkaTransport;
pub use memory::MemoryBroker;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("queue transport is unreachable: {0}")]
    Unreachable(String),
    #[error("queue {0} was not declared")]
    QueueNotFound(String),
    #[error("failed to declare queue {queue}: {reason}")]
    DeclareError { queue: String, reason: String },
    #[error("failed to publish to queue {queue}: {reason}")]
    PublishError { queue: String, reason: String },
    #[error("failed to receive from queue {queue}: {reason}")]
    ReceiveError { queue: String, reason: String },
    #[error("failed to acknowledge delivery: {0}")]
    AckError(String),
    #[error("failed to flush pending publishes: {0}")]
    FlushError(String),
    #[error("channel was closed")]
    Closed,
}

impl TransportError {
    /// Only an unreachable transport is worth reconnecting to.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

/// Queue declaration flags. Declaring an existing queue with the same flags is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Non-durable, non-exclusive, kept when the last consumer leaves.
    pub fn transient(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// When a delivery counts as consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Consumed as soon as it is handed to the subscriber.
    Auto,
    /// Consumed only once the subscriber calls `Acker::ack`.
    Manual,
}

pub trait Acker: Send {
    fn ack(self: Box<Self>) -> Result<(), TransportError>;

    /// Give the delivery back. With `requeue` it is delivered again, otherwise it is dropped.
    fn nack(self: Box<Self>, requeue: bool) -> Result<(), TransportError>;
}

/// A message handed to a subscriber.
pub struct Delivery {
    pub payload: Vec<u8>,
    /// Set only for `AckMode::Manual` subscriptions.
    pub acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn ack(self) -> Result<(), TransportError> {
        match self.acker {
            Some(acker) => acker.ack(),
            None => Ok(()),
        }
    }

    pub fn nack(self, requeue: bool) -> Result<(), TransportError> {
        match self.acker {
            Some(acker) => acker.nack(requeue),
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. Returns `TransportError::Closed` once the channel is closed.
    async fn recv(&mut self) -> Result<Delivery, TransportError>;
}

#[async_trait]
pub trait QueueChannel: Send + Sync {
    async fn declare_queue(&self, options: &QueueOptions) -> Result<(), TransportError>;

    /// Hand `payload` to the transport without waiting for delivery confirmation.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        queue: &str,
        ack_mode: AckMode,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Flush pending publishes and stop every subscription of this channel.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn QueueChannel>, TransportError>;
}
