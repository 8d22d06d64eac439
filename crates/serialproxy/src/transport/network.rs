//! Network transport for `serialproxy://host:port` addresses
//!
//! The consumer dials a running proxy as a plain TCP client and sees the remote
//! device's byte stream. There is no control channel, so line-control calls are
//! accepted but have no effect and line status always reads low.

use crate::config::SERIALPROXY_SCHEME;
use crate::error::{Result, SerialProxyError};
use crate::transport::{
    CloseSignal, EventMask, FlowControlMode, LineStatus, PortAddress, PurgeFlags, RawEvent, SerialParams,
    SerialTransport,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Buffer size for reading from the socket
const READ_BUFFER_SIZE: usize = 512;

/// Read side with bytes received but not yet consumed
struct NetReader {
    half: OwnedReadHalf,
    buffer: BytesMut,
}

impl NetReader {
    /// Move whatever the socket holds right now into the buffer
    fn drain_ready(&mut self) -> std::io::Result<()> {
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        loop {
            match self.half.try_read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Read until at least `count` bytes are buffered
    ///
    /// Bytes read before a cancellation stay buffered.
    async fn fill(&mut self, count: usize) -> std::io::Result<()> {
        while self.buffer.len() < count {
            self.buffer.reserve(READ_BUFFER_SIZE);
            let n = self.half.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("socket closed with {} of {} bytes", self.buffer.len(), count),
                ));
            }
        }
        Ok(())
    }
}

struct Connection {
    reader: tokio::sync::Mutex<NetReader>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: CloseSignal,
}

#[derive(Default)]
struct NetState {
    conn: Option<Arc<Connection>>,
    mask: EventMask,
    flow: FlowControlMode,
}

/// Serial transport that dials a remote proxy
pub struct NetworkSerialPort {
    name: String,
    host: String,
    port: u16,
    event_poll_interval: Duration,
    state: Mutex<NetState>,
}

impl NetworkSerialPort {
    /// Create a closed network port from a `serialproxy://host:port` name
    pub fn new(name: &str) -> Result<Self> {
        match PortAddress::parse(name)? {
            PortAddress::Network { host, port } => Ok(Self {
                name: name.to_string(),
                host,
                port,
                event_poll_interval: Duration::from_millis(10),
                state: Mutex::new(NetState::default()),
            }),
            PortAddress::Local(_) => Err(SerialProxyError::InvalidAddress(format!(
                "{} does not start with {}",
                name, SERIALPROXY_SCHEME
            ))),
        }
    }

    /// Create with custom event sampling period
    pub fn with_event_poll_interval(mut self, interval: Duration) -> Self {
        self.event_poll_interval = interval;
        self
    }

    /// Remote `host:port`
    pub fn remote(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connection(&self, operation: &'static str) -> Result<Arc<Connection>> {
        self.state
            .lock()
            .conn
            .clone()
            .ok_or_else(|| SerialProxyError::PortNotOpened {
                port: self.name.clone(),
                operation,
            })
    }

    fn fail(&self, err: impl ToString) -> SerialProxyError {
        SerialProxyError::transport(self.name.clone(), err)
    }
}

#[async_trait]
impl SerialTransport for NetworkSerialPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.state.lock().conn.is_some()
    }

    async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Err(SerialProxyError::PortAlreadyOpened(self.name.clone()));
        }

        debug!(remote = %self.remote(), "Opening socket");
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                warn!(remote = %self.remote(), error = %e, "Cannot reach proxy");
                SerialProxyError::PortNotFound(format!("{}: {}", self.name, e))
            })?;
        stream.set_nodelay(true)?;
        let (half, writer) = stream.into_split();

        let mut state = self.state.lock();
        if state.conn.is_some() {
            return Err(SerialProxyError::PortAlreadyOpened(self.name.clone()));
        }
        *state = NetState {
            conn: Some(Arc::new(Connection {
                reader: tokio::sync::Mutex::new(NetReader {
                    half,
                    buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
                }),
                writer: tokio::sync::Mutex::new(writer),
                closed: CloseSignal::new(),
            })),
            ..NetState::default()
        };

        debug!(remote = %self.remote(), "Opened socket");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let conn = {
            let mut state = self.state.lock();
            state.mask = EventMask::NONE;
            state.conn.take()
        };
        let conn = conn.ok_or_else(|| SerialProxyError::PortNotOpened {
            port: self.name.clone(),
            operation: "close",
        })?;

        conn.closed.fire();
        if let Err(e) = conn.writer.lock().await.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
        debug!(remote = %self.remote(), "Closed socket");
        Ok(())
    }

    async fn set_params(&self, params: SerialParams) -> Result<()> {
        self.connection("set_params")?;
        trace!(?params, "Line parameters are owned by the remote proxy");
        Ok(())
    }

    async fn purge(&self, flags: PurgeFlags) -> Result<()> {
        let conn = self.connection("purge")?;
        conn.closed
            .guard(&self.name, "purge", async {
                if flags.clears_input() {
                    let mut reader = conn.reader.lock().await;
                    reader.drain_ready().map_err(|e| self.fail(e))?;
                    reader.buffer.clear();
                }
                if flags.clears_output() {
                    conn.writer.lock().await.flush().await.map_err(|e| self.fail(e))?;
                }
                Ok(())
            })
            .await
    }

    async fn set_rts(&self, _level: bool) -> Result<()> {
        self.connection("set_rts")?;
        Ok(())
    }

    async fn set_dtr(&self, _level: bool) -> Result<()> {
        self.connection("set_dtr")?;
        Ok(())
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let conn = self.connection("write_bytes")?;
        conn.closed
            .guard(&self.name, "write_bytes", async {
                let mut writer = conn.writer.lock().await;
                writer.write_all(data).await.map_err(|e| self.fail(e))
            })
            .await?;
        trace!("<({})", data.len());
        Ok(())
    }

    async fn read_bytes(&self, count: usize) -> Result<Bytes> {
        let conn = self.connection("read_bytes")?;
        let data = conn
            .closed
            .guard(&self.name, "read_bytes", async {
                let mut reader = conn.reader.lock().await;
                reader.fill(count).await.map_err(|e| self.fail(e))?;
                Ok(reader.buffer.split_to(count).freeze())
            })
            .await?;
        trace!(">({})", count);
        Ok(data)
    }

    async fn read_bytes_timeout(&self, count: usize, timeout: Duration) -> Result<Bytes> {
        let conn = self.connection("read_bytes")?;
        conn.closed
            .guard(&self.name, "read_bytes", async {
                let mut reader = conn.reader.lock().await;
                match tokio::time::timeout(timeout, reader.fill(count)).await {
                    Ok(Ok(())) => Ok(reader.buffer.split_to(count).freeze()),
                    Ok(Err(e)) => Err(self.fail(e)),
                    Err(_) => Err(SerialProxyError::OperationTimeout {
                        port: self.name.clone(),
                        operation: "read_bytes",
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            })
            .await
    }

    async fn input_buffer_count(&self) -> Result<usize> {
        let conn = self.connection("input_buffer_count")?;
        conn.closed
            .guard(&self.name, "input_buffer_count", async {
                let mut reader = conn.reader.lock().await;
                reader.drain_ready().map_err(|e| self.fail(e))?;
                trace!("?>({})", reader.buffer.len());
                Ok(reader.buffer.len())
            })
            .await
    }

    async fn output_buffer_count(&self) -> Result<usize> {
        self.connection("output_buffer_count")?;
        Ok(0)
    }

    async fn set_flow_control(&self, mode: FlowControlMode) -> Result<()> {
        self.connection("set_flow_control")?;
        self.state.lock().flow = mode;
        Ok(())
    }

    async fn flow_control(&self) -> Result<FlowControlMode> {
        self.connection("flow_control")?;
        Ok(self.state.lock().flow)
    }

    async fn send_break(&self, _duration: Duration) -> Result<()> {
        self.connection("send_break")?;
        Ok(())
    }

    async fn lines_status(&self) -> Result<LineStatus> {
        self.connection("lines_status")?;
        Ok(LineStatus::default())
    }

    fn set_events_mask(&self, mask: EventMask) -> Result<()> {
        let mut state = self.state.lock();
        if state.conn.is_none() {
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
        if state.conn.is_none() {
            return Err(SerialProxyError::PortNotOpened {
                port: self.name.clone(),
                operation: "events_mask",
            });
        }
        Ok(state.mask)
    }

    async fn wait_events(&self) -> Result<Vec<RawEvent>> {
        tokio::time::sleep(self.event_poll_interval).await;

        if !self.events_mask()?.contains(EventMask::RXCHAR) {
            return Ok(Vec::new());
        }
        let count = self.input_buffer_count().await?;
        if count == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![RawEvent::new(EventMask::RXCHAR, count as u32)])
    }
}

impl std::fmt::Debug for NetworkSerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSerialPort")
            .field("remote", &self.remote())
            .field("open", &self.is_open())
            .finish()
    }
}
