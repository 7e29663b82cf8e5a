//! In-process simulated serial link for tests and dry runs without a belt.
//!
//! [`SimSerialLink`] records every command byte it is asked to send and lets
//! the caller inject controller lines as if they had arrived over the wire.
//!
//! # Example
//!
//! ```rust
//! use sortline_hal::{SerialLink, SimSerialLink};
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let link = SimSerialLink::new("sim0");
//!     link.send_command(b'C').await.unwrap();
//!     assert_eq!(link.sent_codes(), vec![b'C']);
//! });
//! ```

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use sortline_types::{ActuatorCommand, CommandCodes, HardwareEvent, SortError};
use tokio::sync::{broadcast, watch};

use crate::link::{SerialLink, broadcast_lines};

const LINE_BUFFER: usize = 64;

/// A simulated belt controller link.  Always accepts writes unless told to
/// fail with [`SimSerialLink::fail_writes`].
pub struct SimSerialLink {
    port: String,
    sent: Mutex<Vec<u8>>,
    sent_count: watch::Sender<usize>,
    lines: broadcast::Sender<HardwareEvent>,
    failing: AtomicBool,
}

impl SimSerialLink {
    /// Create a new simulated link with the given identifier.
    pub fn new(port: impl Into<String>) -> Self {
        let (lines, _) = broadcast::channel(LINE_BUFFER);
        let (sent_count, _) = watch::channel(0);
        Self {
            port: port.into(),
            sent: Mutex::new(Vec::new()),
            sent_count,
            lines,
            failing: AtomicBool::new(false),
        }
    }

    /// Deliver `raw` to every current line subscriber as though the controller
    /// had printed it.  Returns the number of subscribers reached.
    pub fn inject(&self, raw: &str) -> usize {
        self.lines.send(HardwareEvent::from_raw(raw)).unwrap_or(0)
    }

    /// Every byte written so far, in order.
    pub fn sent_codes(&self) -> Vec<u8> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    /// Written bytes decoded back into commands using `codes`; unknown bytes
    /// are skipped.
    pub fn sent_commands(&self, codes: &CommandCodes) -> Vec<ActuatorCommand> {
        self.sent_codes()
            .into_iter()
            .filter_map(|code| codes.command_for(code))
            .collect()
    }

    /// Wait until at least `count` bytes have been written.
    pub async fn wait_for_sends(&self, count: usize) {
        let mut rx = self.sent_count.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed
        // channel while borrowed.
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// Make subsequent writes fail (`true`) or succeed again (`false`).
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Simulate the device going away: every line stream ends.
    pub fn disconnect(self) {
        drop(self);
    }
}

#[async_trait]
impl SerialLink for SimSerialLink {
    fn port(&self) -> &str {
        &self.port
    }

    async fn send_command(&self, code: u8) -> Result<(), SortError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SortError::Serial {
                port: self.port.clone(),
                details: "simulated write failure".to_string(),
            });
        }
        let count = {
            let mut sent = self.sent.lock().map_err(|_| SortError::Serial {
                port: self.port.clone(),
                details: "sent-log lock poisoned".to_string(),
            })?;
            sent.push(code);
            sent.len()
        };
        self.sent_count.send_replace(count);
        Ok(())
    }

    fn lines(&self) -> BoxStream<'static, HardwareEvent> {
        broadcast_lines(self.port.clone(), self.lines.subscribe())
    }
}
