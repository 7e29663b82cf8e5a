//! `sortline-middleware` – broker plumbing and the internal event bus.
//!
//! # Modules
//!
//! - [`bus`] – topic-routed publish/subscribe [`EventBus`] built on Tokio
//!   broadcast channels.
//! - [`queue`] – the [`QueueConnector`] / [`QueueChannel`] driver seam and the
//!   [`Delivery`] handle that must be acknowledged exactly once.
//! - [`client`] – [`QueueClient`], the single swappable broker handle, and its
//!   connect-retry supervisor driven by a [`RetryPolicy`].
//! - [`amqp`] – the `lapin` AMQP 0-9-1 driver.
//! - [`memory`] – [`MemoryBroker`], an in-process durable queue for tests and
//!   simulation.

pub mod amqp;
pub mod bus;
pub mod client;
pub mod memory;
pub mod queue;

pub use amqp::{AmqpConnector, redact_amqp_url};
pub use bus::{EventBus, Topic, TopicReceiver};
pub use client::{QueueClient, RetryPolicy};
pub use memory::MemoryBroker;
pub use queue::{Delivery, QueueChannel, QueueConnector};
