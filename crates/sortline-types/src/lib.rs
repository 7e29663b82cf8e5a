use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One decoded line received from the belt controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareEvent {
    pub line: String,
}

impl HardwareEvent {
    /// Build an event from a raw serial line, stripping line terminators and
    /// surrounding whitespace.
    pub fn from_raw(raw: &str) -> Self {
        Self {
            line: raw.trim().to_string(),
        }
    }

    /// `true` when this line is exactly the detection trigger literal.
    pub fn is_trigger(&self, literal: &str) -> bool {
        self.line == literal
    }
}

/// A message pulled from the broker, still owned by it until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Broker-assigned handle used for acknowledgment.
    pub delivery_tag: u64,
    /// Raw message body.
    pub payload: Vec<u8>,
}

/// Which payload field a classification label was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    /// A direction decision made by the producer (e.g. `"direita"`).
    Decision,
    /// A material / object class (e.g. `"metal"`).
    Category,
    /// Neither field was present; the configured fallback label was used.
    Fallback,
}

/// Decoded form of a [`QueueMessage`] payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Lower-cased classification label.
    pub label: String,
    pub source: LabelSource,
    /// Producer confidence, when the payload carried one.
    pub confidence: Option<f64>,
}

/// The fixed actuator alphabet understood by the belt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorCommand {
    RouteLeft,
    RouteRight,
    /// Fail-safe: let the object continue without diversion.
    PassThrough,
}

impl ActuatorCommand {
    /// Stable, human-readable command name used in logs and reports.
    pub fn name(self) -> &'static str {
        match self {
            ActuatorCommand::RouteLeft => "route-left",
            ActuatorCommand::RouteRight => "route-right",
            ActuatorCommand::PassThrough => "pass-through",
        }
    }
}

impl std::fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Deployment-specific mapping from [`ActuatorCommand`] to the single ASCII
/// byte written to the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCodes {
    pub route_left: u8,
    pub route_right: u8,
    pub pass_through: u8,
}

impl CommandCodes {
    /// Return the wire byte for `command`.
    pub fn code_for(&self, command: ActuatorCommand) -> u8 {
        match command {
            ActuatorCommand::RouteLeft => self.route_left,
            ActuatorCommand::RouteRight => self.route_right,
            ActuatorCommand::PassThrough => self.pass_through,
        }
    }

    /// Reverse lookup, used by simulated links to describe what they received.
    pub fn command_for(&self, code: u8) -> Option<ActuatorCommand> {
        if code == self.route_left {
            Some(ActuatorCommand::RouteLeft)
        } else if code == self.route_right {
            Some(ActuatorCommand::RouteRight)
        } else if code == self.pass_through {
            Some(ActuatorCommand::PassThrough)
        } else {
            None
        }
    }
}

impl Default for CommandCodes {
    fn default() -> Self {
        Self {
            route_left: b'E',
            route_right: b'D',
            pass_through: b'C',
        }
    }
}

/// Terminal result of one detection-to-actuation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// A rule matched the label and its command was sent.
    Routed {
        label: String,
        command: ActuatorCommand,
        confidence: Option<f64>,
    },
    /// The message decoded but no rule matched; pass-through was sent.
    Unmatched {
        label: String,
        confidence: Option<f64>,
    },
    /// The payload could not be decoded; it was acknowledged and pass-through
    /// was sent.
    Malformed { reason: String },
    /// Every poll attempt came back empty; pass-through was sent.
    TimedOut { attempts: u32 },
    /// The queue was not connected when the cycle started.
    QueueOffline {
        /// Whether pass-through was sent anyway.
        pass_through_sent: bool,
    },
}

impl CycleOutcome {
    /// The command this cycle sent to the belt, if any.
    pub fn command(&self) -> Option<ActuatorCommand> {
        match self {
            CycleOutcome::Routed { command, .. } => Some(*command),
            CycleOutcome::Unmatched { .. }
            | CycleOutcome::Malformed { .. }
            | CycleOutcome::TimedOut { .. } => Some(ActuatorCommand::PassThrough),
            CycleOutcome::QueueOffline { pass_through_sent } => {
                pass_through_sent.then_some(ActuatorCommand::PassThrough)
            }
        }
    }

    /// `true` when this cycle fetched (and therefore acknowledged) a message.
    pub fn consumed_message(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Routed { .. }
                | CycleOutcome::Unmatched { .. }
                | CycleOutcome::Malformed { .. }
        )
    }
}

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "sortline-runtime::bridge"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current UTC time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A raw line received from the belt controller.
    HardwareLine(String),
    /// A detection cycle finished.
    CycleCompleted {
        cycle: u64,
        outcome: CycleOutcome,
        elapsed_ms: u64,
    },
    /// The queue client gained or lost its broker channel.
    QueueConnectivity { connected: bool },
    /// A component reported a fault that did not stop the belt.
    Fault { component: String, message: String },
}

/// Global error type spanning the serial link, the broker, and payloads.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SortError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Queue offline: no broker channel is installed")]
    QueueOffline,

    #[error("Payload parse error: {0}")]
    PayloadParse(String),

    #[error("Serial fault on {port}: {details}")]
    Serial { port: String, details: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Detection report failed: {0}")]
    Report(String),

    #[error("Event bus error: {0}")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_event_trims_crlf() {
        let ev = HardwareEvent::from_raw("DETECTADO\r\n");
        assert_eq!(ev.line, "DETECTADO");
        assert!(ev.is_trigger("DETECTADO"));
        assert!(!HardwareEvent::from_raw("DETECTADO_2").is_trigger("DETECTADO"));
    }

    #[test]
    fn default_codes_match_controller_firmware() {
        let codes = CommandCodes::default();
        assert_eq!(codes.code_for(ActuatorCommand::RouteLeft), b'E');
        assert_eq!(codes.code_for(ActuatorCommand::RouteRight), b'D');
        assert_eq!(codes.code_for(ActuatorCommand::PassThrough), b'C');
        assert_eq!(codes.command_for(b'D'), Some(ActuatorCommand::RouteRight));
        assert_eq!(codes.command_for(b'X'), None);
    }

    #[test]
    fn outcome_commands() {
        let timed_out = CycleOutcome::TimedOut { attempts: 40 };
        assert_eq!(timed_out.command(), Some(ActuatorCommand::PassThrough));
        assert!(!timed_out.consumed_message());

        let offline = CycleOutcome::QueueOffline {
            pass_through_sent: false,
        };
        assert_eq!(offline.command(), None);

        let malformed = CycleOutcome::Malformed {
            reason: "eof".into(),
        };
        assert!(malformed.consumed_message());
    }

    #[test]
    fn cycle_event_serializes_with_tag() {
        let event = Event::new(
            "sortline-runtime::bridge",
            EventPayload::CycleCompleted {
                cycle: 3,
                outcome: CycleOutcome::Routed {
                    label: "metal".into(),
                    command: ActuatorCommand::RouteRight,
                    confidence: Some(0.91),
                },
                elapsed_ms: 420,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"outcome\":\"routed\""));
        assert!(json.contains("route_right"));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
    }

    #[test]
    fn sort_error_display() {
        let err = SortError::Serial {
            port: "/dev/ttyUSB0".into(),
            details: "device unplugged".into(),
        };
        assert!(err.to_string().contains("/dev/ttyUSB0"));
        assert!(SortError::QueueOffline.to_string().contains("offline"));
    }
}
