//! Serial transport implementations
//!
//! The proxy core never touches a device directly. It consumes the
//! [`SerialTransport`] trait, which has two implementations:
//!
//! - [`local::LocalSerialPort`] - a real device through tokio-serial (requires `serial` feature)
//! - [`network::NetworkSerialPort`] - a remote proxy reached as `serialproxy://host:port`
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod local;
#[cfg(feature = "serial")]
pub use local::LocalSerialPort;

mod network;
pub use network::NetworkSerialPort;

mod signal;
pub(crate) use signal::CloseSignal;

mod types;
pub use types::{
    DataBits, EventMask, FlowControlMode, LineStatus, Parity, PurgeFlags, RawEvent, SerialEvent,
    SerialParams, StopBits,
};

use crate::config::{SerialConfig, SERIALPROXY_SCHEME};
use crate::error::{Result, SerialProxyError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Trait for serial transports
///
/// All methods take `&self` so one transport can be shared by every client
/// session. Implementations serialize access internally; reads and writes use
/// separate locks so a pending read never delays a write.
///
/// Every operation other than `name`, `is_open` and `open` fails with
/// [`SerialProxyError::PortNotOpened`] while the port is closed. `close`
/// releases reads and writes already in flight with the same error.
#[async_trait]
pub trait SerialTransport: Send + Sync {
    /// Port name as given by the user
    fn name(&self) -> &str;

    /// Check if the port is currently open
    fn is_open(&self) -> bool;

    /// Open the port
    ///
    /// Fails with `PortAlreadyOpened` if open and `PortNotFound` if the device
    /// is missing or busy.
    async fn open(&self) -> Result<()>;

    /// Close the port, releasing the device
    async fn close(&self) -> Result<()>;

    /// Apply line parameters
    async fn set_params(&self, params: SerialParams) -> Result<()>;

    /// Discard buffered input and/or output
    async fn purge(&self, flags: PurgeFlags) -> Result<()>;

    /// Drive the RTS line
    async fn set_rts(&self, level: bool) -> Result<()>;

    /// Drive the DTR line
    async fn set_dtr(&self, level: bool) -> Result<()>;

    /// Write all bytes to the port
    async fn write_bytes(&self, data: &[u8]) -> Result<()>;

    /// Read exactly `count` bytes, waiting as long as it takes
    ///
    /// Callers size `count` to data they know is available.
    async fn read_bytes(&self, count: usize) -> Result<Bytes>;

    /// Read exactly `count` bytes or fail with `OperationTimeout`
    async fn read_bytes_timeout(&self, count: usize, timeout: Duration) -> Result<Bytes>;

    /// Bytes waiting in the input buffer
    async fn input_buffer_count(&self) -> Result<usize>;

    /// Bytes waiting in the output buffer
    async fn output_buffer_count(&self) -> Result<usize>;

    /// Set the flow control mode
    async fn set_flow_control(&self, mode: FlowControlMode) -> Result<()>;

    /// Current flow control mode
    async fn flow_control(&self) -> Result<FlowControlMode>;

    /// Hold a break condition for `duration`
    async fn send_break(&self, duration: Duration) -> Result<()>;

    /// Snapshot of the modem input lines
    async fn lines_status(&self) -> Result<LineStatus>;

    /// Replace the assigned event mask
    fn set_events_mask(&self, mask: EventMask) -> Result<()>;

    /// Currently assigned event mask
    fn events_mask(&self) -> Result<EventMask>;

    /// Wait for the next batch of events matching the assigned mask
    ///
    /// Returns after a bounded wait; an empty batch means "poll again".
    async fn wait_events(&self) -> Result<Vec<RawEvent>>;
}

/// Where a port name points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAddress {
    /// Local device path
    Local(PathBuf),
    /// Remote proxy reached over TCP
    Network {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
}

impl PortAddress {
    /// Parse a port name; `serialproxy://host:port` selects the network form
    pub fn parse(name: &str) -> Result<Self> {
        let Some(rest) = name.strip_prefix(SERIALPROXY_SCHEME) else {
            return Ok(PortAddress::Local(PathBuf::from(name)));
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| SerialProxyError::InvalidAddress(name.to_string()))?;
        if host.is_empty() {
            return Err(SerialProxyError::InvalidAddress(name.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| SerialProxyError::InvalidAddress(name.to_string()))?;

        Ok(PortAddress::Network {
            host: host.to_string(),
            port,
        })
    }

    /// True for `serialproxy://` addresses
    pub fn is_network(&self) -> bool {
        matches!(self, PortAddress::Network { .. })
    }

    /// Local device path, if any
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            PortAddress::Local(path) => Some(path),
            PortAddress::Network { .. } => None,
        }
    }
}

/// Create the transport a serial config points at
///
/// The transport is returned closed.
pub fn open_transport(
    config: &SerialConfig,
    event_poll_interval: Duration,
) -> Result<Arc<dyn SerialTransport>> {
    let name = config.device_name();
    match PortAddress::parse(&name)? {
        PortAddress::Network { .. } => Ok(Arc::new(
            NetworkSerialPort::new(&name)?.with_event_poll_interval(event_poll_interval),
        )),
        #[cfg(feature = "serial")]
        PortAddress::Local(path) => Ok(Arc::new(
            LocalSerialPort::new(path)
                .with_baud_rate(config.baud_rate)
                .with_event_poll_interval(event_poll_interval),
        )),
        #[cfg(not(feature = "serial"))]
        PortAddress::Local(_) => Err(SerialProxyError::InvalidConfig(format!(
            "{} is a local device but serial support is not compiled in",
            name
        ))),
    }
}
