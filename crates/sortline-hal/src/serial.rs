//! [`TokioSerialLink`] – serial driver for the physical belt controller.
//!
//! Opens the device with `tokio-serial`, splits it into read and write
//! halves, and spawns a reader task that decodes `\r\n`-delimited lines into
//! [`HardwareEvent`]s and fans them out over a broadcast channel.
//!
//! Link loss is not recovered: the reader logs the error and exits, which
//! ends every stream returned by [`SerialLink::lines`].

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use sortline_types::{HardwareEvent, SortError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use crate::link::{SerialLink, broadcast_lines};

/// Number of decoded lines buffered for slow subscribers.
const LINE_BUFFER: usize = 64;

/// A [`SerialLink`] backed by a real serial device.
pub struct TokioSerialLink {
    port: String,
    writer: Mutex<WriteHalf<SerialStream>>,
    lines: broadcast::Sender<HardwareEvent>,
    reader: JoinHandle<()>,
}

impl TokioSerialLink {
    /// Open `path` at `baud_rate` and start the reader task.
    ///
    /// Must be called from within a Tokio runtime.  The controller announces
    /// readiness on its own schedule; commands may be sent immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SortError::Serial`] if the device cannot be opened.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, SortError> {
        let stream = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|e| SortError::Serial {
                port: path.to_string(),
                details: e.to_string(),
            })?;
        let (read_half, write_half) = tokio::io::split(stream);
        let (lines, _) = broadcast::channel(LINE_BUFFER);
        let reader = tokio::spawn(read_lines(path.to_string(), read_half, lines.clone()));

        info!(port = %path, baud_rate, "serial link open");

        Ok(Self {
            port: path.to_string(),
            writer: Mutex::new(write_half),
            lines,
            reader,
        })
    }
}

impl Drop for TokioSerialLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl SerialLink for TokioSerialLink {
    fn port(&self) -> &str {
        &self.port
    }

    async fn send_command(&self, code: u8) -> Result<(), SortError> {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&[code]).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| SortError::Serial {
            port: self.port.clone(),
            details: e.to_string(),
        })
    }

    fn lines(&self) -> BoxStream<'static, HardwareEvent> {
        broadcast_lines(self.port.clone(), self.lines.subscribe())
    }
}

/// Decode lines from `reader` until EOF or an I/O error, publishing each
/// non-empty one on `tx`.
///
/// Bytes that are not valid UTF-8 become U+FFFD; line noise never ends the
/// stream.
pub(crate) async fn read_lines<R>(port: String, reader: R, tx: broadcast::Sender<HardwareEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                warn!(port = %port, "serial link closed by device");
                break;
            }
            Ok(_) => {
                let event = HardwareEvent::from_raw(&String::from_utf8_lossy(&buf));
                if event.line.is_empty() {
                    continue;
                }
                debug!(port = %port, line = %event.line, "serial line");
                // No subscriber yet is fine; the line is simply not observed.
                let _ = tx.send(event);
            }
            Err(e) => {
                error!(port = %port, error = %e, "serial link read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reader_splits_crlf_and_skips_blank_lines() {
        let (mut device, host) = tokio::io::duplex(256);
        let (tx, rx) = broadcast::channel(16);
        let mut stream = broadcast_lines("duplex".into(), rx);
        let reader = tokio::spawn(read_lines("duplex".into(), host, tx));

        device
            .write_all(b"Arduino pronto\r\n\r\n  DETECTADO \r\nno-crlf\n")
            .await
            .unwrap();
        drop(device);

        assert_eq!(stream.next().await.unwrap().line, "Arduino pronto");
        assert_eq!(stream.next().await.unwrap().line, "DETECTADO");
        assert_eq!(stream.next().await.unwrap().line, "no-crlf");
        reader.await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_stream() {
        let (mut device, host) = tokio::io::duplex(256);
        let (tx, rx) = broadcast::channel(16);
        let mut stream = broadcast_lines("duplex".into(), rx);
        let reader = tokio::spawn(read_lines("duplex".into(), host, tx));

        device.write_all(b"\xff\xfe\r\nDETECTADO\r\n").await.unwrap();

        assert_eq!(stream.next().await.unwrap().line, "\u{fffd}\u{fffd}");
        assert_eq!(stream.next().await.unwrap().line, "DETECTADO");
        assert!(!reader.is_finished());

        drop(device);
        reader.await.unwrap();
    }

    #[test]
    fn open_missing_device_is_serial_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(async { TokioSerialLink::open("/dev/sortline-does-not-exist", 9600) });
        match result {
            Err(SortError::Serial { port, .. }) => assert_eq!(port, "/dev/sortline-does-not-exist"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opening a missing device must fail"),
        }
    }
}
