//! In-process broker for tests and simulation.
//!
//! [`MemoryBroker`] implements [`QueueConnector`] and hands out channels that
//! share one set of queues.  It tracks unacknowledged deliveries per channel
//! so callers can assert that every fetched message was acknowledged exactly
//! once, and it can simulate connect failures and dropped connections.
//!
//! ```rust
//! use sortline_middleware::{MemoryBroker, QueueConnector};
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let broker = MemoryBroker::new();
//!     broker.publish("fila_deteccao", br#"{"category":"metal"}"#.to_vec());
//!
//!     let channel = broker.connect("memory://").await.unwrap();
//!     let msg = channel.fetch_one("fila_deteccao").await.unwrap().unwrap();
//!     channel.acknowledge(&msg).await.unwrap();
//!     assert_eq!(broker.acked_count(), 1);
//! });
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sortline_types::{QueueMessage, SortError};

use crate::queue::{QueueChannel, QueueConnector};

#[derive(Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<Vec<u8>>,
}

struct Unacked {
    generation: u64,
    queue: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    generation: u64,
    failing_connects: u32,
    connect_attempts: u32,
    acked: u64,
}

/// Shared in-memory broker.  Clone it cheaply – clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, SortError> {
        self.state
            .lock()
            .map_err(|_| SortError::Connection("memory broker state poisoned".to_string()))
    }

    /// Append `payload` to `queue`, creating the queue if needed.
    pub fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        if let Ok(mut state) = self.lock() {
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(payload.into());
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.failing_connects = count;
        }
    }

    /// Close every open channel.  Their unacknowledged messages go back to
    /// the front of their queues, as a real broker would redeliver them.
    pub fn drop_connections(&self) {
        if let Ok(mut state) = self.lock() {
            let generation = state.generation;
            let mut requeue: Vec<(u64, String, Vec<u8>)> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.generation == generation)
                .map(|(tag, u)| (*tag, u.queue.clone(), u.payload.clone()))
                .collect();
            requeue.sort_by_key(|(tag, _, _)| std::cmp::Reverse(*tag));
            for (tag, queue, payload) in requeue {
                state.unacked.remove(&tag);
                state.queues.entry(queue).or_default().ready.push_front(payload);
            }
            state.generation += 1;
        }
    }

    /// Messages waiting in `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Messages fetched but not yet acknowledged, across all queues.
    pub fn unacked_count(&self) -> usize {
        self.lock().map(|s| s.unacked.len()).unwrap_or(0)
    }

    /// Total successful acknowledgments.
    pub fn acked_count(&self) -> u64 {
        self.lock().map(|s| s.acked).unwrap_or(0)
    }

    /// Total connect attempts, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().map(|s| s.connect_attempts).unwrap_or(0)
    }

    /// Whether `queue` has been declared durable.
    pub fn is_durable(&self, queue: &str) -> bool {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.durable))
            .unwrap_or(false)
    }
}

#[async_trait]
impl QueueConnector for MemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn QueueChannel>, SortError> {
        let mut state = self.lock()?;
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(SortError::Connection("connection refused (simulated)".to_string()));
        }
        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            generation: state.generation,
        }))
    }
}

/// A channel handed out by [`MemoryBroker`].
struct MemoryChannel {
    broker: MemoryBroker,
    generation: u64,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, SortError> {
        let state = self.broker.lock()?;
        if state.generation != self.generation {
            return Err(SortError::Connection("channel closed by broker".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), SortError> {
        let mut state = self.open_state()?;
        let queue = state.queues.entry(name.to_string()).or_default();
        queue.durable |= durable;
        Ok(())
    }

    async fn fetch_one(&self, queue: &str) -> Result<Option<QueueMessage>, SortError> {
        let mut state = self.open_state()?;
        let Some(payload) = state.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };
        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        state.unacked.insert(
            delivery_tag,
            Unacked {
                generation: self.generation,
                queue: queue.to_string(),
                payload: payload.clone(),
            },
        );
        Ok(Some(QueueMessage {
            delivery_tag,
            payload,
        }))
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), SortError> {
        let mut state = self.open_state()?;
        let owned = state
            .unacked
            .get(&message.delivery_tag)
            .is_some_and(|u| u.generation == self.generation);
        if !owned {
            return Err(SortError::Connection(format!(
                "unknown delivery tag {}",
                message.delivery_tag
            )));
        }
        state.unacked.remove(&message.delivery_tag);
        state.acked += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "fila_deteccao";

    #[tokio::test]
    async fn fetch_is_fifo_and_non_blocking() {
        let broker = MemoryBroker::new();
        let channel = broker.connect("memory://").await.unwrap();
        channel.declare_queue(QUEUE, true).await.unwrap();
        assert!(broker.is_durable(QUEUE));

        assert!(channel.fetch_one(QUEUE).await.unwrap().is_none());

        broker.publish(QUEUE, b"first".to_vec());
        broker.publish(QUEUE, b"second".to_vec());
        let first = channel.fetch_one(QUEUE).await.unwrap().unwrap();
        assert_eq!(first.payload, b"first");
        assert_eq!(broker.ready_count(QUEUE), 1);
        assert_eq!(broker.unacked_count(), 1);
    }

    #[tokio::test]
    async fn double_ack_is_rejected() {
        let broker = MemoryBroker::new();
        broker.publish(QUEUE, b"x".to_vec());
        let channel = broker.connect("memory://").await.unwrap();
        let msg = channel.fetch_one(QUEUE).await.unwrap().unwrap();

        channel.acknowledge(&msg).await.unwrap();
        assert!(channel.acknowledge(&msg).await.is_err());
        assert_eq!(broker.acked_count(), 1);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn simulated_connect_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        assert!(broker.connect("memory://").await.is_err());
        assert!(broker.connect("memory://").await.is_err());
        assert!(broker.connect("memory://").await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn dropped_connection_requeues_unacked_in_order() {
        let broker = MemoryBroker::new();
        broker.publish(QUEUE, b"a".to_vec());
        broker.publish(QUEUE, b"b".to_vec());
        broker.publish(QUEUE, b"c".to_vec());
        let channel = broker.connect("memory://").await.unwrap();
        let _a = channel.fetch_one(QUEUE).await.unwrap().unwrap();
        let _b = channel.fetch_one(QUEUE).await.unwrap().unwrap();

        broker.drop_connections();
        assert!(channel.fetch_one(QUEUE).await.is_err());
        assert_eq!(broker.unacked_count(), 0);

        let fresh = broker.connect("memory://").await.unwrap();
        let order: Vec<Vec<u8>> = [
            fresh.fetch_one(QUEUE).await.unwrap().unwrap().payload,
            fresh.fetch_one(QUEUE).await.unwrap().unwrap().payload,
            fresh.fetch_one(QUEUE).await.unwrap().unwrap().payload,
        ]
        .into();
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
