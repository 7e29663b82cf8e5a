//! `sortline-hal` – the Serial Link Adapter.
//!
//! Owns the byte-level channel to the belt controller: line-delimited
//! [`HardwareEvent`][sortline_types::HardwareEvent]s inbound, single-byte
//! actuator codes outbound.
//!
//! # Modules
//!
//! - [`link`] – the [`SerialLink`] trait every driver implements.
//! - [`serial`] – [`TokioSerialLink`], the `tokio-serial` driver for a real
//!   USB/UART device.
//! - [`sim`] – [`SimSerialLink`], an in-process stand-in that records
//!   commands and lets callers inject lines.

pub mod link;
pub mod serial;
pub mod sim;

pub use link::{SerialLink, broadcast_lines};
pub use serial::TokioSerialLink;
pub use sim::SimSerialLink;
