//! `sortline-runtime` – the detection bridge.
//!
//! Turns "object detected" lines from the belt controller into actuator
//! commands, using classifications pulled from the broker.
//!
//! # Modules
//!
//! - [`bridge`] – [`DetectionBridge`][bridge::DetectionBridge]: the
//!   `Idle → Polling → Deciding` state machine with bounded polling and a
//!   pass-through fail-safe.
//! - [`payload`] – tagged decoding of classification message bodies.
//! - [`rules`] – [`RuleTable`][rules::RuleTable]: the ordered,
//!   first-match-wins label → command table.
//! - [`policy`] – [`RetriggerPolicy`][policy::RetriggerPolicy]: handling of
//!   triggers that arrive mid-cycle.
//! - [`reporter`] – [`DetectionReporter`][reporter::DetectionReporter]: optional
//!   forwarding of finished cycles to the dashboard backend.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: log and OTLP
//!   trace setup.

pub mod bridge;
pub mod payload;
pub mod policy;
pub mod reporter;
pub mod rules;
pub mod telemetry;

pub use bridge::{BridgeConfig, BridgeState, DetectionBridge};
pub use payload::decode_payload;
pub use policy::RetriggerPolicy;
pub use reporter::{DetectionReport, DetectionReporter};
pub use rules::{LabelRule, RuleTable};
pub use telemetry::{LogFormat, TelemetryGuard, init_tracing};
