//! Local serial port transport
//!
//! This module drives a real device through tokio-serial. The stream is split
//! into independently locked read and write halves, and a cloned native handle
//! serves buffer counts, line control and modem status.

use crate::config::DEFAULT_BAUD_RATE;
use crate::error::{Result, SerialProxyError};
use crate::transport::{
    CloseSignal, EventMask, FlowControlMode, LineStatus, Parity, PurgeFlags, RawEvent, SerialParams,
    SerialTransport, StopBits,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

/// Handles of an open device
struct OpenPort {
    reader: tokio::sync::Mutex<ReadHalf<SerialStream>>,
    writer: tokio::sync::Mutex<WriteHalf<SerialStream>>,
    control: Mutex<Box<dyn SerialPort>>,
    closed: CloseSignal,
}

/// Port state guarded by the state lock
#[derive(Default)]
struct PortState {
    open: Option<Arc<OpenPort>>,
    mask: EventMask,
    flow: FlowControlMode,
    last_lines: LineStatus,
    last_output: usize,
}

/// Serial transport for a local device
pub struct LocalSerialPort {
    /// Serial port path
    port_path: PathBuf,

    /// Port name for logging and errors
    name: String,

    /// Baud rate used to open the device
    baud_rate: u32,

    /// Sampling period of `wait_events`
    event_poll_interval: Duration,

    /// Open handles, event mask and last sampled line state
    state: Mutex<PortState>,
}

impl LocalSerialPort {
    /// Create a new, closed local port
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = port_path.display().to_string();

        Self {
            port_path,
            name,
            baud_rate: DEFAULT_BAUD_RATE,
            event_poll_interval: Duration::from_millis(10),
            state: Mutex::new(PortState::default()),
        }
    }

    /// Create with custom opening baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Create with custom event sampling period
    pub fn with_event_poll_interval(mut self, interval: Duration) -> Self {
        self.event_poll_interval = interval;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Take ownership of an already opened stream
    fn attach(&self, stream: SerialStream) -> Result<()> {
        let control = stream.try_clone().map_err(|e| self.fail(e))?;
        let (reader, writer) = tokio::io::split(stream);

        let mut state = self.state.lock();
        if state.open.is_some() {
            return Err(SerialProxyError::PortAlreadyOpened(self.name.clone()));
        }
        *state = PortState {
            open: Some(Arc::new(OpenPort {
                reader: tokio::sync::Mutex::new(reader),
                writer: tokio::sync::Mutex::new(writer),
                control: Mutex::new(control),
                closed: CloseSignal::new(),
            })),
            ..PortState::default()
        };
        Ok(())
    }

    fn handles(&self, operation: &'static str) -> Result<Arc<OpenPort>> {
        self.state
            .lock()
            .open
            .clone()
            .ok_or_else(|| SerialProxyError::PortNotOpened {
                port: self.name.clone(),
                operation,
            })
    }

    fn fail(&self, err: impl ToString) -> SerialProxyError {
        SerialProxyError::transport(self.name.clone(), err)
    }

    fn timeout_error(&self, operation: &'static str, timeout: Duration) -> SerialProxyError {
        SerialProxyError::OperationTimeout {
            port: self.name.clone(),
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

#[async_trait]
impl SerialTransport for LocalSerialPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.state.lock().open.is_some()
    }

    async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Err(SerialProxyError::PortAlreadyOpened(self.name.clone()));
        }

        info!(port = %self.name, baud = self.baud_rate, "Opening serial port");

        if !self.port_path.exists() {
            return Err(SerialProxyError::PortNotFound(self.name.clone()));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .open_native_async()
            .map_err(|e| SerialProxyError::PortNotFound(format!("{}: {}", self.name, e)))?;
        self.attach(stream)?;

        info!(port = %self.name, "Opened serial port");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let handles = {
            let mut state = self.state.lock();
            let handles = state.open.take();
            state.mask = EventMask::NONE;
            handles
        };

        match handles {
            Some(handles) => {
                // pending reads and writes drop their references on wake
                handles.closed.fire();
                drop(handles);
                info!(port = %self.name, "Closed serial port");
                Ok(())
            }
            None => Err(SerialProxyError::PortNotOpened {
                port: self.name.clone(),
                operation: "close",
            }),
        }
    }

    async fn set_params(&self, params: SerialParams) -> Result<()> {
        let handles = self.handles("set_params")?;
        let mut control = handles.control.lock();

        let data_bits = match u8::from(params.data_bits) {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match params.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
            StopBits::OnePointFive => {
                warn!(port = %self.name, "1.5 stop bits unsupported, using 2");
                tokio_serial::StopBits::Two
            }
        };
        let parity = match params.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Mark | Parity::Space => {
                return Err(SerialProxyError::InvalidConfig(format!(
                    "{:?} parity is not supported on {}",
                    params.parity, self.name
                )))
            }
        };

        control
            .set_baud_rate(params.baud_rate)
            .map_err(|e| self.fail(e))?;
        control.set_data_bits(data_bits).map_err(|e| self.fail(e))?;
        control.set_stop_bits(stop_bits).map_err(|e| self.fail(e))?;
        control.set_parity(parity).map_err(|e| self.fail(e))?;
        control
            .write_request_to_send(params.rts)
            .map_err(|e| self.fail(e))?;
        control
            .write_data_terminal_ready(params.dtr)
            .map_err(|e| self.fail(e))?;

        debug!(port = %self.name, ?params, "Applied serial parameters");
        Ok(())
    }

    async fn purge(&self, flags: PurgeFlags) -> Result<()> {
        let handles = self.handles("purge")?;
        let buffer = match (flags.clears_input(), flags.clears_output()) {
            (true, true) => tokio_serial::ClearBuffer::All,
            (true, false) => tokio_serial::ClearBuffer::Input,
            (false, true) => tokio_serial::ClearBuffer::Output,
            (false, false) => return Ok(()),
        };
        let control = handles.control.lock();
        control.clear(buffer).map_err(|e| self.fail(e))
    }

    async fn set_rts(&self, level: bool) -> Result<()> {
        let handles = self.handles("set_rts")?;
        let mut control = handles.control.lock();
        control
            .write_request_to_send(level)
            .map_err(|e| self.fail(e))
    }

    async fn set_dtr(&self, level: bool) -> Result<()> {
        let handles = self.handles("set_dtr")?;
        let mut control = handles.control.lock();
        control
            .write_data_terminal_ready(level)
            .map_err(|e| self.fail(e))
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let handles = self.handles("write_bytes")?;
        handles
            .closed
            .guard(&self.name, "write_bytes", async {
                let mut writer = handles.writer.lock().await;
                writer.write_all(data).await.map_err(|e| self.fail(e))?;
                writer.flush().await.map_err(|e| self.fail(e))
            })
            .await?;

        trace!(port = %self.name, "<({})", data.len());
        Ok(())
    }

    async fn read_bytes(&self, count: usize) -> Result<Bytes> {
        let handles = self.handles("read_bytes")?;
        let data = handles
            .closed
            .guard(&self.name, "read_bytes", async {
                let mut buf = vec![0u8; count];
                let mut reader = handles.reader.lock().await;
                reader.read_exact(&mut buf).await.map_err(|e| self.fail(e))?;
                Ok(Bytes::from(buf))
            })
            .await?;

        trace!(port = %self.name, ">({})", count);
        Ok(data)
    }

    async fn read_bytes_timeout(&self, count: usize, timeout: Duration) -> Result<Bytes> {
        let handles = self.handles("read_bytes")?;

        if count == 1 {
            // single-byte reads are cancel-safe
            return handles
                .closed
                .guard(&self.name, "read_bytes", async {
                    let mut byte = [0u8; 1];
                    let mut reader = handles.reader.lock().await;
                    match tokio::time::timeout(timeout, reader.read_exact(&mut byte)).await {
                        Ok(Ok(_)) => Ok(Bytes::copy_from_slice(&byte)),
                        Ok(Err(e)) => Err(self.fail(e)),
                        Err(_) => Err(self.timeout_error("read_bytes", timeout)),
                    }
                })
                .await;
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.input_buffer_count().await? >= count {
                return self.read_bytes(count).await;
            }
            if Instant::now() >= deadline {
                return Err(self.timeout_error("read_bytes", timeout));
            }
            tokio::time::sleep(self.event_poll_interval).await;
        }
    }

    async fn input_buffer_count(&self) -> Result<usize> {
        let handles = self.handles("input_buffer_count")?;
        let control = handles.control.lock();
        let count = control.bytes_to_read().map_err(|e| self.fail(e))?;
        Ok(count as usize)
    }

    async fn output_buffer_count(&self) -> Result<usize> {
        let handles = self.handles("output_buffer_count")?;
        let control = handles.control.lock();
        let count = control.bytes_to_write().map_err(|e| self.fail(e))?;
        Ok(count as usize)
    }

    async fn set_flow_control(&self, mode: FlowControlMode) -> Result<()> {
        let handles = self.handles("set_flow_control")?;
        let flow = if mode.is_hardware() {
            tokio_serial::FlowControl::Hardware
        } else if mode.is_software() {
            tokio_serial::FlowControl::Software
        } else {
            tokio_serial::FlowControl::None
        };
        handles
            .control
            .lock()
            .set_flow_control(flow)
            .map_err(|e| self.fail(e))?;
        self.state.lock().flow = mode;
        Ok(())
    }

    async fn flow_control(&self) -> Result<FlowControlMode> {
        let _ = self.handles("flow_control")?;
        Ok(self.state.lock().flow)
    }

    async fn send_break(&self, duration: Duration) -> Result<()> {
        let handles = self.handles("send_break")?;
        handles.control.lock().set_break().map_err(|e| self.fail(e))?;
        tokio::time::sleep(duration).await;
        let result = handles.control.lock().clear_break().map_err(|e| self.fail(e));
        result
    }

    async fn lines_status(&self) -> Result<LineStatus> {
        let handles = self.handles("lines_status")?;
        let mut control = handles.control.lock();
        Ok(LineStatus {
            cts: control.read_clear_to_send().map_err(|e| self.fail(e))?,
            dsr: control.read_data_set_ready().map_err(|e| self.fail(e))?,
            ring: control.read_ring_indicator().map_err(|e| self.fail(e))?,
            rlsd: control.read_carrier_detect().map_err(|e| self.fail(e))?,
        })
    }

    fn set_events_mask(&self, mask: EventMask) -> Result<()> {
        let mut state = self.state.lock();
        if state.open.is_none() {
            return Err(SerialProxyError::PortNotOpened {
                port: self.name.clone(),
                operation: "set_events_mask",
            });
        }
        state.mask = mask;
        Ok(())
    }

    fn events_mask(&self) -> Result<EventMask> {
        let state = self.state.lock();
        if state.open.is_none() {
            return Err(SerialProxyError::PortNotOpened {
                port: self.name.clone(),
                operation: "events_mask",
            });
        }
        Ok(state.mask)
    }

    async fn wait_events(&self) -> Result<Vec<RawEvent>> {
        tokio::time::sleep(self.event_poll_interval).await;

        let mask = self.events_mask()?;
        if mask.is_empty() {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        if mask.contains(EventMask::RXCHAR) {
            let count = self.input_buffer_count().await?;
            if count > 0 {
                events.push(RawEvent::new(EventMask::RXCHAR, count as u32));
            }
        }

        let output = self.output_buffer_count().await?;
        let lines = self.lines_status().await?;

        let mut state = self.state.lock();
        if mask.contains(EventMask::TXEMPTY) && output == 0 && state.last_output > 0 {
            events.push(RawEvent::new(EventMask::TXEMPTY, 1));
        }
        for (kind, now, before) in [
            (EventMask::CTS, lines.cts, state.last_lines.cts),
            (EventMask::DSR, lines.dsr, state.last_lines.dsr),
            (EventMask::RLSD, lines.rlsd, state.last_lines.rlsd),
            (EventMask::RING, lines.ring, state.last_lines.ring),
        ] {
            if mask.contains(kind) && now != before {
                events.push(RawEvent::new(kind, now as u32));
            }
        }
        state.last_output = output;
        state.last_lines = lines;

        Ok(events)
    }
}

impl std::fmt::Debug for LocalSerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalSerialPort")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("open", &state.open.is_some())
            .field("mask", &state.mask)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_name() {
        let port = LocalSerialPort::new("/dev/ttyUSB0");
        assert_eq!(port.name(), "/dev/ttyUSB0");
        assert_eq!(port.port_path(), Path::new("/dev/ttyUSB0"));
        assert!(!port.is_open());
    }

    #[tokio::test]
    async fn test_open_missing_device() {
        let port = LocalSerialPort::new("/dev/this-device-does-not-exist");
        let err = port.open().await.unwrap_err();
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert!(!port.is_open());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_releases_pending_read() {
        let (device, _peer) = SerialStream::pair().unwrap();
        let port = Arc::new(LocalSerialPort::new("/dev/pts-test"));
        port.attach(device).unwrap();

        let reader = {
            let port = port.clone();
            tokio::spawn(async move { port.read_bytes(4).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        port.close().await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.error_code(), "PORT_NOT_OPENED");
        assert!(!port.is_open());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attached_stream_reads_peer_bytes() {
        let (device, mut peer) = SerialStream::pair().unwrap();
        let port = LocalSerialPort::new("/dev/pts-test");
        port.attach(device).unwrap();

        peer.write_all(b"ok").await.unwrap();
        let data = port
            .read_bytes_timeout(1, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"o");
        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_on_closed_port() {
        let port = LocalSerialPort::new("/dev/ttyUSB0");
        assert_eq!(
            port.write_bytes(b"x").await.unwrap_err().error_code(),
            "PORT_NOT_OPENED"
        );
        assert_eq!(
            port.input_buffer_count().await.unwrap_err().error_code(),
            "PORT_NOT_OPENED"
        );
        assert!(port.set_events_mask(EventMask::RXCHAR).is_err());
        assert!(port.close().await.is_err());
    }
}
