//! Serial-to-TCP proxy
//!
//! This crate exposes one serial device to TCP clients. Bytes a client sends
//! are written to the device; bytes the device produces are forwarded to the
//! clients. The device may come and go: the proxy waits for it, opens it,
//! listens while it is present and tears everything down when it vanishes or
//! fails.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   presence    ┌───────────────────────────────┐
//! │ DevicePresence   │──────────────►│ LifecycleManager              │
//! └──────────────────┘               │  Absent → Opening →           │
//!                                    │  OpenNoListener → OpenListening│
//!                                    └──────┬──────────────┬─────────┘
//!                               accept      │              │ open/close
//!                                           ▼              ▼
//! ┌────────────┐  TCP  ┌──────────────────────┐      ┌─────────────────┐
//! │ client ... │◄─────►│ ConnectionBridge ... │◄────►│ PortHandle      │
//! └────────────┘       └──────────────────────┘      │ SerialTransport │
//!                                                    │ EventNotifier   │
//!                                                    └─────────────────┘
//! ```
//!
//! The serial side is the [`SerialTransport`] trait, implemented for local
//! devices by [`LocalSerialPort`] (`serial` feature) and for a remote proxy
//! by [`NetworkSerialPort`] (`serialproxy://host:port`).
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use serialproxy::{LifecycleManager, ProxyConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfigBuilder::new()
//!         .device("/dev/ttyUSB0")
//!         .listen_port(9990)
//!         .build();
//!
//!     let (manager, handle) = LifecycleManager::from_config(config)?;
//!     let proxy = tokio::spawn(manager.run());
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await?;
//!     proxy.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Local serial devices through tokio-serial (requires `libudev-dev` on Linux)

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod transport;

// Port and events
pub mod encoding;
pub mod notifier;
pub mod port;
pub mod presence;

// Proxy
pub mod bridge;
pub mod lifecycle;

// Testing utilities
pub mod test_utils;

pub use config::{ListenConfig, ProxyConfig, ProxyConfigBuilder, SerialConfig, TimingConfig};
pub use error::{Result, SerialProxyError};
pub use transport::{
    open_transport, DataBits, EventMask, FlowControlMode, LineStatus, NetworkSerialPort, Parity,
    PortAddress, PurgeFlags, RawEvent, SerialEvent, SerialParams, SerialTransport, StopBits,
};

#[cfg(feature = "serial")]
pub use transport::LocalSerialPort;

pub use bridge::{ConnectionBridge, PortFault, SessionStats, MAX_BATCH};
pub use encoding::{to_hex_array, to_hex_string, to_int_array, SerialTransportExt};
pub use lifecycle::{LifecycleManager, LifecycleState, ProxyCommand, ProxyHandle, ProxyStats};
pub use notifier::{EventNotifier, SerialEventListener};
pub use port::{PortHandle, PortSnapshot};
pub use presence::{presence_for, AlwaysPresent, DevicePresence, PathPresence};
pub use test_utils::{FlagPresence, MockTransport};

// Protocol constants re-exports
pub use config::{
    DEFAULT_BAUD_RATE, DEFAULT_LISTEN_PORT, OPEN_FAILURE_ESCALATION, OPEN_RETRY_CAP,
    SERIALPROXY_SCHEME,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_LISTEN_PORT, 9990);
        assert_eq!(DEFAULT_BAUD_RATE, 115200);
        assert_eq!(SERIALPROXY_SCHEME, "serialproxy://");
        assert_eq!(OPEN_RETRY_CAP, 10);
        assert!(OPEN_FAILURE_ESCALATION < OPEN_RETRY_CAP);
    }

    #[test]
    fn test_event_mask_values() {
        assert_eq!(EventMask::RXCHAR.bits(), 1);
        assert_eq!(EventMask::CTS.bits(), 8);
        assert_eq!(EventMask::RING.bits(), 256);
    }
}
