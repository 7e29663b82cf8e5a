//! The broker driver seam.
//!
//! The rest of the system never speaks AMQP directly.  A [`QueueConnector`]
//! opens a [`QueueChannel`]; the channel offers the three primitives the
//! bridge needs: declare, non-blocking pull, and manual acknowledgment.
//!
//! Drivers:
//!
//! - [`AmqpConnector`][crate::amqp::AmqpConnector] – a real broker via
//!   `lapin`.
//! - [`MemoryBroker`][crate::memory::MemoryBroker] – an in-process queue.

use std::sync::Arc;

use async_trait::async_trait;
use sortline_types::{QueueMessage, SortError};

/// Opens broker channels.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Open a connection and a channel on it.
    ///
    /// # Errors
    ///
    /// Returns [`SortError::Connection`] on network or authentication failure.
    async fn connect(&self, url: &str) -> Result<Arc<dyn QueueChannel>, SortError>;
}

/// An open broker channel with manual-acknowledgment pull semantics.
#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// Ensure `name` exists.  Idempotent; `durable` queues survive a broker
    /// restart.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), SortError>;

    /// Pull one message without waiting.  `Ok(None)` means the queue is empty
    /// right now.
    async fn fetch_one(&self, queue: &str) -> Result<Option<QueueMessage>, SortError>;

    /// Mark `message` consumed.
    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), SortError>;
}

/// A fetched message bound to the channel it came from.
///
/// Delivery tags are only meaningful on their own channel, so the handle
/// keeps that channel alive.  [`Delivery::acknowledge`] consumes the handle:
/// a delivery can be acknowledged at most once.
pub struct Delivery {
    message: QueueMessage,
    channel: Arc<dyn QueueChannel>,
}

impl Delivery {
    pub(crate) fn new(message: QueueMessage, channel: Arc<dyn QueueChannel>) -> Self {
        Self { message, channel }
    }

    /// The fetched message.
    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    /// Raw message body.
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    /// Acknowledge on the originating channel.
    pub async fn acknowledge(self) -> Result<(), SortError> {
        self.channel.acknowledge(&self.message).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.message.delivery_tag)
            .field("payload_len", &self.message.payload.len())
            .finish()
    }
}
