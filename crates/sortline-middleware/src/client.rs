//! [`QueueClient`] – the single swappable broker handle.
//!
//! The client owns at most one open [`QueueChannel`].  It starts empty; the
//! connect supervisor ([`QueueClient::supervise`]) installs a channel once the
//! broker is reachable and installs a new one whenever the current channel is
//! invalidated after a transport failure.  Callers that fetch while no channel
//! is installed get [`SortError::QueueOffline`].
//!
//! ```text
//!   supervise ──connect_once──▶ [ channel slot ] ◀──fetch_one── bridge
//!       ▲                              │
//!       └────────── invalidate ◀───────┘ (transport error)
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sortline_types::{Event, EventPayload, SortError};
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

use crate::amqp::redact_amqp_url;
use crate::bus::EventBus;
use crate::queue::{Delivery, QueueChannel, QueueConnector};

const EVENT_SOURCE: &str = "sortline-middleware::queue";

/// Delay schedule between failed connect attempts.  Retries never stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Wait the same delay after every failure.
    Fixed { delay_ms: u64 },
    /// Start at `initial_ms`, multiply by `factor` per failure, cap at
    /// `max_ms`.
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        factor: f64,
    },
}

impl RetryPolicy {
    /// Delay to wait after the `failures`-th consecutive failure (0-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            RetryPolicy::Exponential {
                initial_ms,
                max_ms,
                factor,
            } => {
                let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
                let scaled = initial_ms as f64 * factor.max(1.0).powi(exponent);
                let capped = scaled.min(max_ms as f64);
                Duration::from_millis(capped as u64)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed { delay_ms: 5000 }
    }
}

/// Swappable handle to the broker.
pub struct QueueClient {
    connector: Arc<dyn QueueConnector>,
    url: String,
    queue: String,
    channel: RwLock<Option<Arc<dyn QueueChannel>>>,
    invalidated: Notify,
    bus: Option<Arc<EventBus>>,
}

impl QueueClient {
    /// Create a disconnected client for `queue` on the broker at `url`.
    pub fn new(
        connector: Arc<dyn QueueConnector>,
        url: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            url: url.into(),
            queue: queue.into(),
            channel: RwLock::new(None),
            invalidated: Notify::new(),
            bus: None,
        }
    }

    /// Announce connectivity changes on
    /// [`Topic::SystemAlerts`][crate::bus::Topic::SystemAlerts].
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// `true` while a channel is installed.
    pub async fn is_connected(&self) -> bool {
        self.channel.read().await.is_some()
    }

    /// Connect, declare the durable queue, and install the channel.
    ///
    /// # Errors
    ///
    /// Returns [`SortError::Connection`] if either step fails; the slot is
    /// left untouched.
    pub async fn connect_once(&self) -> Result<(), SortError> {
        let channel = self.connector.connect(&self.url).await?;
        channel.declare_queue(&self.queue, true).await?;
        *self.channel.write().await = Some(channel);
        info!(url = %redact_amqp_url(&self.url), queue = %self.queue, "broker connected");
        self.announce(true);
        Ok(())
    }

    /// Non-blocking pull from the configured queue.
    ///
    /// # Errors
    ///
    /// [`SortError::QueueOffline`] when no channel is installed, or the
    /// driver's error when the pull itself fails.
    pub async fn fetch_one(&self) -> Result<Option<Delivery>, SortError> {
        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or(SortError::QueueOffline)?;
        let message = channel.fetch_one(&self.queue).await?;
        Ok(message.map(|m| Delivery::new(m, channel)))
    }

    /// Drop the current channel and wake the supervisor to reconnect.
    pub async fn invalidate(&self) {
        let previous = self.channel.write().await.take();
        if previous.is_some() {
            warn!(queue = %self.queue, "broker channel invalidated; reconnecting");
            self.announce(false);
            self.invalidated.notify_one();
        }
    }

    /// Keep a channel installed forever.
    ///
    /// Retries [`connect_once`][Self::connect_once] with `policy` delays until
    /// it succeeds, then parks until [`invalidate`][Self::invalidate] is
    /// called, and repeats.  Spawn this on its own task.
    pub async fn supervise(self: Arc<Self>, policy: RetryPolicy) {
        loop {
            let mut failures: u32 = 0;
            loop {
                match self.connect_once().await {
                    Ok(()) => break,
                    Err(e) => {
                        let delay = policy.delay_for(failures);
                        warn!(
                            error = %e,
                            failures = failures + 1,
                            retry_in_ms = delay.as_millis() as u64,
                            "broker connect failed"
                        );
                        failures = failures.saturating_add(1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            self.invalidated.notified().await;
        }
    }

    fn announce(&self, connected: bool) {
        if let Some(bus) = &self.bus {
            let event = Event::new(EVENT_SOURCE, EventPayload::QueueConnectivity { connected });
            let _ = bus.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::memory::MemoryBroker;

    const QUEUE: &str = "fila_deteccao";

    fn client(broker: &MemoryBroker) -> Arc<QueueClient> {
        Arc::new(QueueClient::new(Arc::new(broker.clone()), "memory://", QUEUE))
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(99), Duration::from_millis(5000));
    }

    #[test]
    fn exponential_policy_grows_and_caps() {
        let policy = RetryPolicy::Exponential {
            initial_ms: 500,
            max_ms: 4000,
            factor: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(4000));
    }

    #[test]
    fn retry_policy_deserializes_from_tagged_json() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"policy":"fixed","delay_ms":250}"#).unwrap();
        assert_eq!(policy, RetryPolicy::Fixed { delay_ms: 250 });
    }

    #[tokio::test]
    async fn fetch_before_connect_is_queue_offline() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        assert!(!client.is_connected().await);
        assert!(matches!(client.fetch_one().await, Err(SortError::QueueOffline)));
    }

    #[tokio::test]
    async fn connect_declares_durable_queue_and_fetches() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        client.connect_once().await.unwrap();
        assert!(broker.is_durable(QUEUE));

        assert!(client.fetch_one().await.unwrap().is_none());
        broker.publish(QUEUE, br#"{"category":"metal"}"#.to_vec());
        let delivery = client.fetch_one().await.unwrap().unwrap();
        assert_eq!(delivery.payload(), br#"{"category":"metal"}"#);
        delivery.acknowledge().await.unwrap();
        assert_eq!(broker.acked_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_retries_with_fixed_delay_until_connected() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(3);
        let client = client(&broker);
        let started = tokio::time::Instant::now();

        let task = tokio::spawn(Arc::clone(&client).supervise(RetryPolicy::default()));
        while !client.is_connected().await {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(broker.connect_attempts(), 4);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(15_000), "waited {waited:?}");
        assert!(waited < Duration::from_millis(15_200), "waited {waited:?}");
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_reconnects_after_invalidate() {
        let broker = MemoryBroker::new();
        let bus = Arc::new(EventBus::default());
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let client = Arc::new(
            QueueClient::new(Arc::new(broker.clone()), "memory://", QUEUE).with_bus(Arc::clone(&bus)),
        );

        let task = tokio::spawn(Arc::clone(&client).supervise(RetryPolicy::Fixed { delay_ms: 10 }));
        while !client.is_connected().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        broker.drop_connections();
        client.invalidate().await;
        assert!(!client.is_connected().await);

        while !client.is_connected().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(broker.connect_attempts(), 2);

        let mut seen = Vec::new();
        while let Ok(event) = alerts.try_recv() {
            if let EventPayload::QueueConnectivity { connected } = event.payload {
                seen.push(connected);
            }
        }
        assert_eq!(seen, vec![true, false, true]);
        task.abort();
    }

    #[tokio::test]
    async fn invalidate_when_disconnected_is_noop() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        client.invalidate().await;
        assert!(!client.is_connected().await);
    }
}
