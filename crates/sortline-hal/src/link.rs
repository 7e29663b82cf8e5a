//! Generic `SerialLink` trait for the belt controller connection.
//!
//! The bridge only ever talks to this trait, so the physical driver and the
//! simulated one are interchangeable.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use sortline_types::{HardwareEvent, SortError};
use tokio::sync::broadcast;
use tracing::warn;

/// A bidirectional channel to the hardware controller.
#[async_trait]
pub trait SerialLink: Send + Sync {
    /// Device path or identifier, e.g. `"/dev/ttyUSB0"`.
    fn port(&self) -> &str;

    /// Write a single command byte.  Fire-and-forget: the controller sends no
    /// acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`SortError::Serial`] if the byte could not be written.
    async fn send_command(&self, code: u8) -> Result<(), SortError>;

    /// A fresh stream of inbound lines.  Each call subscribes anew; the stream
    /// ends when the link closes.
    fn lines(&self) -> BoxStream<'static, HardwareEvent>;
}

/// Adapt a broadcast receiver into a line stream.
///
/// Lagged receivers skip the lost lines with a warning rather than ending
/// the stream.
pub fn broadcast_lines(
    port: String,
    receiver: broadcast::Receiver<HardwareEvent>,
) -> BoxStream<'static, HardwareEvent> {
    Box::pin(stream::unfold(receiver, move |mut rx| {
        let port = port.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(port = %port, lagged_by = n, "serial line subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    }))
}
