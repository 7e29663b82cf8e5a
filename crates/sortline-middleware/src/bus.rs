//! In-process event bus shared by the bridge, the queue client, and any
//! observers (reporter, CLI).
//!
//! One `tokio::sync::broadcast` channel per [`Topic`].  A slow observer lags
//! and loses old events; it never holds up the bridge.
//!
//! | Topic | Carries |
//! |---|---|
//! | [`Topic::Hardware`] | `HardwareLine` – every controller line |
//! | [`Topic::Decisions`] | `CycleCompleted` – one per detection cycle |
//! | [`Topic::SystemAlerts`] | `QueueConnectivity`, `Fault` |

use sortline_types::{Event, EventPayload, SortError};
use tokio::sync::broadcast;
use tracing::warn;

/// Events buffered per topic before a lagging observer starts losing them.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Hardware,
    Decisions,
    SystemAlerts,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Hardware, Topic::Decisions, Topic::SystemAlerts];

    /// The topic a payload kind is routed to.
    pub fn for_payload(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::HardwareLine(_) => Topic::Hardware,
            EventPayload::CycleCompleted { .. } => Topic::Decisions,
            EventPayload::QueueConnectivity { .. } | EventPayload::Fault { .. } => {
                Topic::SystemAlerts
            }
        }
    }

    fn index(self) -> usize {
        match self {
            Topic::Hardware => 0,
            Topic::Decisions => 1,
            Topic::SystemAlerts => 2,
        }
    }
}

/// Cloneable handle; clones publish into the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    lanes: [broadcast::Sender<Event>; 3],
}

impl EventBus {
    /// `capacity` applies to each topic separately.
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Topic::ALL.map(|_| broadcast::channel(capacity).0),
        }
    }

    /// Publish on the topic chosen by [`Topic::for_payload`].
    pub fn publish(&self, event: Event) -> Result<usize, SortError> {
        self.publish_to(Topic::for_payload(&event.payload), event)
    }

    /// Publish `event` on `topic` and return how many observers got it.
    ///
    /// [`SortError::Channel`] means nobody is subscribed to `topic`; callers
    /// that publish for whoever happens to listen discard it.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, SortError> {
        self.lanes[topic.index()]
            .send(event)
            .map_err(|_| SortError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.lanes[topic.index()].subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Subscription to one [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Next event, or `Lagged(n)` when `n` events were lost, or `Closed` once
    /// every [`EventBus`] clone is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Like [`recv`][Self::recv], but lost events are logged and skipped.
    /// `None` once the bus is gone.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, skipped = n, "bus observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
