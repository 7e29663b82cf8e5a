//! [`DetectionBridge`] – couples belt triggers to queued classifications.
//!
//! The bridge is an explicit state machine:
//!
//! ```text
//!            trigger line                 message fetched
//!   Idle ───────────────────▶ Polling ───────────────────▶ Deciding
//!    ▲                          │  ▲ empty: wait interval      │
//!    │   attempts exhausted:    │  └───────────┘               │ send command,
//!    └──── send pass-through ◀──┘                              │ acknowledge
//!    ▲                                                         │
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Every cycle that reaches `Polling` sends exactly one actuator command, and
//! every message it fetches is acknowledged exactly once, whether or not its
//! payload decodes.  When the queue is offline at trigger time the cycle
//! aborts before polling and, unless `offline_pass_through` is set, sends
//! nothing.
//!
//! Triggers that arrive mid-cycle are handled by the configured
//! [`RetriggerPolicy`]; cycles never overlap.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sortline_hal::SerialLink;
use sortline_middleware::{Delivery, EventBus, QueueClient};
use sortline_types::{
    ActuatorCommand, CommandCodes, CycleOutcome, Event, EventPayload, HardwareEvent, SortError,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::payload::decode_payload;
use crate::policy::RetriggerPolicy;
use crate::rules::RuleTable;

const EVENT_SOURCE: &str = "sortline-runtime::bridge";

/// Tunables for [`DetectionBridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Controller line that starts a cycle.
    pub trigger: String,
    /// Fetch attempts per cycle before giving up.
    pub max_attempts: u32,
    /// Delay after each empty attempt.
    pub interval: Duration,
    /// Send pass-through when a trigger finds the queue offline.
    pub offline_pass_through: bool,
    /// Label used when a payload carries no label field.
    pub fallback_label: String,
    pub codes: CommandCodes,
    pub rules: RuleTable,
    pub retrigger: RetriggerPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            trigger: "DETECTADO".to_string(),
            max_attempts: 40,
            interval: Duration::from_millis(500),
            offline_pass_through: false,
            fallback_label: "desc".to_string(),
            codes: CommandCodes::default(),
            rules: RuleTable::default(),
            retrigger: RetriggerPolicy::default(),
        }
    }
}

/// Observable bridge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    /// Polling the queue; `attempt` is 1-based.
    Polling { attempt: u32 },
    Deciding,
}

/// The detection-to-actuation orchestrator.
pub struct DetectionBridge {
    config: BridgeConfig,
    queue: Arc<QueueClient>,
    link: Arc<dyn SerialLink>,
    bus: Option<Arc<EventBus>>,
    state: watch::Sender<BridgeState>,
    cycles: AtomicU64,
}

impl DetectionBridge {
    pub fn new(config: BridgeConfig, queue: Arc<QueueClient>, link: Arc<dyn SerialLink>) -> Self {
        let (state, _) = watch::channel(BridgeState::Idle);
        Self {
            config,
            queue,
            link,
            bus: None,
            state,
            cycles: AtomicU64::new(0),
        }
    }

    /// Publish controller lines and cycle outcomes on `bus`.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Consume controller lines until the stream ends.
    ///
    /// Runs one cycle per trigger.  While a cycle is in flight, further lines
    /// are still read so that extra triggers can be handled per the
    /// [`RetriggerPolicy`].
    pub async fn run(&self, mut events: BoxStream<'static, HardwareEvent>) {
        let mut backlog: usize = 0;
        let mut stream_open = true;

        loop {
            if !stream_open {
                if backlog > 0 {
                    warn!(dropped = backlog, "line stream ended with queued triggers pending");
                }
                break;
            }
            if backlog > 0 {
                backlog -= 1;
                info!(remaining = backlog, "starting queued detection cycle");
            } else {
                match events.next().await {
                    Some(event) => {
                        if !self.observe(&event) {
                            continue;
                        }
                    }
                    None => break,
                }
            }

            let cycle = self.run_cycle();
            tokio::pin!(cycle);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cycle => break,
                    next = events.next(), if stream_open => match next {
                        Some(event) => {
                            if self.observe(&event) {
                                self.on_retrigger(&mut backlog).await;
                            }
                        }
                        None => stream_open = false,
                    },
                }
            }
        }
        info!("controller line stream ended; bridge stopped");
    }

    /// Run one complete detection cycle as if a trigger had just arrived.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let outcome = self
            .cycle_inner()
            .instrument(info_span!("detection_cycle", cycle))
            .await;
        self.state.send_replace(BridgeState::Idle);

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            cycle,
            elapsed_ms,
            command = outcome.command().map(ActuatorCommand::name),
            consumed = outcome.consumed_message(),
            "detection cycle finished"
        );
        self.publish(EventPayload::CycleCompleted {
            cycle,
            outcome: outcome.clone(),
            elapsed_ms,
        });
        outcome
    }

    /// Number of cycles started so far.
    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    // ── Internals ──────────────────────────────────────────────────────────

    /// Log and publish a controller line; `true` when it is a trigger.
    fn observe(&self, event: &HardwareEvent) -> bool {
        info!(line = %event.line, "controller line");
        self.publish(EventPayload::HardwareLine(event.line.clone()));
        let trigger = event.is_trigger(&self.config.trigger);
        if trigger {
            info!("object detected; searching queue for a classification");
        }
        trigger
    }

    async fn on_retrigger(&self, backlog: &mut usize) {
        match self.config.retrigger {
            RetriggerPolicy::Drop => {
                warn!(state = ?self.state(), "trigger dropped: a cycle is already running");
            }
            RetriggerPolicy::Queue { capacity } => {
                if *backlog < capacity {
                    *backlog += 1;
                    info!(queued = *backlog, "trigger queued behind the running cycle");
                } else {
                    warn!(capacity, "trigger dropped: retrigger backlog full");
                }
            }
            RetriggerPolicy::PassThrough => {
                warn!("trigger during running cycle; releasing extra object");
                self.send(ActuatorCommand::PassThrough).await;
            }
        }
    }

    async fn cycle_inner(&self) -> CycleOutcome {
        if !self.queue.is_connected().await {
            warn!(queue = %self.queue.queue_name(), "queue offline; detection cycle aborted");
            let pass_through_sent = self.config.offline_pass_through;
            if pass_through_sent {
                self.send(ActuatorCommand::PassThrough).await;
            }
            return CycleOutcome::QueueOffline { pass_through_sent };
        }

        let max_attempts = self.config.max_attempts;
        for attempt in 1..=max_attempts {
            self.state.send_replace(BridgeState::Polling { attempt });
            match self.queue.fetch_one().await {
                Ok(Some(delivery)) => {
                    info!(attempt, "classification message found");
                    self.state.send_replace(BridgeState::Deciding);
                    return self.decide(delivery).await;
                }
                Ok(None) => debug!(attempt, "queue empty"),
                Err(SortError::QueueOffline) => {
                    debug!(attempt, "queue went offline; attempt counted as empty");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "queue fetch failed; attempt counted as empty");
                    self.queue.invalidate().await;
                }
            }
            tokio::time::sleep(self.config.interval).await;
        }

        info!(attempts = max_attempts, "no classification arrived; releasing belt");
        self.send(ActuatorCommand::PassThrough).await;
        CycleOutcome::TimedOut {
            attempts: max_attempts,
        }
    }

    async fn decide(&self, delivery: Delivery) -> CycleOutcome {
        match decode_payload(delivery.payload(), &self.config.fallback_label) {
            Ok(result) => {
                info!(label = %result.label, source = ?result.source, "classification decoded");
                let outcome = match self.config.rules.classify(&result.label) {
                    Some(rule) => CycleOutcome::Routed {
                        label: result.label,
                        command: rule.command,
                        confidence: result.confidence,
                    },
                    None => {
                        info!(label = %result.label, "no rule for label; releasing belt");
                        CycleOutcome::Unmatched {
                            label: result.label,
                            confidence: result.confidence,
                        }
                    }
                };
                if let Some(command) = outcome.command() {
                    self.send(command).await;
                }
                self.acknowledge(delivery).await;
                outcome
            }
            Err(e) => {
                warn!(error = %e, "malformed classification payload; acknowledging and releasing belt");
                self.acknowledge(delivery).await;
                self.send(ActuatorCommand::PassThrough).await;
                CycleOutcome::Malformed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn acknowledge(&self, delivery: Delivery) {
        let tag = delivery.message().delivery_tag;
        if let Err(e) = delivery.acknowledge().await {
            error!(delivery_tag = tag, error = %e, "acknowledge failed");
            self.fault("queue", e.to_string());
            self.queue.invalidate().await;
        }
    }

    async fn send(&self, command: ActuatorCommand) {
        let code = self.config.codes.code_for(command);
        match self.link.send_command(code).await {
            Ok(()) => {
                info!(command = %command, code = %char::from(code), port = %self.link.port(), "actuator command sent");
            }
            Err(e) => {
                error!(command = %command, error = %e, "actuator command failed");
                self.fault("serial", e.to_string());
            }
        }
    }

    fn fault(&self, component: &str, message: String) {
        self.publish(EventPayload::Fault {
            component: component.to_string(),
            message,
        });
    }

    fn publish(&self, payload: EventPayload) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish(Event::new(EVENT_SOURCE, payload));
        }
    }
}
