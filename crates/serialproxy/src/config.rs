//! Configuration types for the serial proxy
//!
//! This module provides configuration structures for the proxy including
//! serial line settings, the TCP listen socket, and loop timing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SerialProxyError};
use crate::transport::{DataBits, Parity, SerialParams, StopBits};

/// Default TCP port clients connect to
pub const DEFAULT_LISTEN_PORT: u16 = 9990;

/// Default baud rate applied after opening the device
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Scheme prefix selecting the network transport
pub const SERIALPROXY_SCHEME: &str = "serialproxy://";

/// Saturation point of the open-failure counter
pub const OPEN_RETRY_CAP: u32 = 10;

/// Consecutive open failures after which the failure is logged as an error
pub const OPEN_FAILURE_ESCALATION: u32 = 5;

/// Main configuration for the serial proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Serial device settings
    #[serde(default)]
    pub serial: SerialConfig,

    /// TCP listen socket settings
    #[serde(default)]
    pub listen: ListenConfig,

    /// Loop and timeout settings
    #[serde(default)]
    pub timing: TimingConfig,
}

impl ProxyConfig {
    /// Check the configuration for values the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.serial.device.as_os_str().is_empty() {
            return Err(SerialProxyError::InvalidConfig(
                "serial device path is empty".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(SerialProxyError::InvalidConfig(
                "baud rate must be positive".to_string(),
            ));
        }
        let timing = &self.timing;
        for (name, value) in [
            ("poll_interval", timing.poll_interval),
            ("accept_timeout", timing.accept_timeout),
            ("open_retry_delay", timing.open_retry_delay),
            ("read_timeout", timing.read_timeout),
            ("listener_join_timeout", timing.listener_join_timeout),
            ("event_poll_interval", timing.event_poll_interval),
        ] {
            if value.is_zero() {
                return Err(SerialProxyError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Serial device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g. /dev/ttyUSB0) or `serialproxy://host:port`
    pub device: PathBuf,

    /// Baud rate (default: 115200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: DataBits,

    /// Stop bits (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: StopBits,

    /// Parity (default: none)
    #[serde(default = "default_parity")]
    pub parity: Parity,

    /// Raise RTS after opening
    #[serde(default = "default_true")]
    pub rts: bool,

    /// Raise DTR after opening
    #[serde(default = "default_true")]
    pub dtr: bool,
}

impl SerialConfig {
    /// Line parameters to apply after opening
    pub fn params(&self) -> SerialParams {
        SerialParams {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            rts: self.rts,
            dtr: self.dtr,
        }
    }

    /// Device name as given, lossily converted to a string
    pub fn device_name(&self) -> String {
        self.device.to_string_lossy().into_owned()
    }
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_data_bits() -> DataBits {
    DataBits::Eight
}

fn default_stop_bits() -> StopBits {
    StopBits::One
}

fn default_parity() -> Parity {
    Parity::None
}

fn default_true() -> bool {
    true
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            rts: true,
            dtr: true,
        }
    }
}

/// TCP listen socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address to bind
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to bind (0 = auto-assign)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl ListenConfig {
    /// `host:port` string to bind
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: DEFAULT_LISTEN_PORT,
        }
    }
}

/// Loop and timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Presence poll interval while no listen socket is up
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Upper bound on one accept wait; presence is re-checked after each
    #[serde(with = "humantime_serde", default = "default_accept_timeout")]
    pub accept_timeout: Duration,

    /// Sleep before each open retry
    #[serde(with = "humantime_serde", default = "default_open_retry_delay")]
    pub open_retry_delay: Duration,

    /// Single-byte read timeout used by idle outbound pumps
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// How long unsubscribe waits for the notification task
    #[serde(with = "humantime_serde", default = "default_listener_join_timeout")]
    pub listener_join_timeout: Duration,

    /// Sampling period of the local port's event poller
    #[serde(with = "humantime_serde", default = "default_event_poll_interval")]
    pub event_poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_accept_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_open_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_listener_join_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_event_poll_interval() -> Duration {
    Duration::from_millis(10)
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            accept_timeout: default_accept_timeout(),
            open_retry_delay: default_open_retry_delay(),
            read_timeout: default_read_timeout(),
            listener_join_timeout: default_listener_join_timeout(),
            event_poll_interval: default_event_poll_interval(),
        }
    }
}

/// Builder for ProxyConfig
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the serial device path or `serialproxy://` address
    pub fn device(mut self, device: impl Into<PathBuf>) -> Self {
        self.config.serial.device = device.into();
        self
    }

    /// Set the baud rate
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.serial.baud_rate = baud_rate;
        self
    }

    /// Set data bits, stop bits and parity
    pub fn framing(mut self, data_bits: DataBits, stop_bits: StopBits, parity: Parity) -> Self {
        self.config.serial.data_bits = data_bits;
        self.config.serial.stop_bits = stop_bits;
        self.config.serial.parity = parity;
        self
    }

    /// Set the TCP listen port
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.listen.port = port;
        self
    }

    /// Set the bind address
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.listen.bind_address = address.into();
        self
    }

    /// Set the presence poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.timing.poll_interval = interval;
        self
    }

    /// Set the accept timeout
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.timing.accept_timeout = timeout;
        self
    }

    /// Set the delay before each open retry
    pub fn open_retry_delay(mut self, delay: Duration) -> Self {
        self.config.timing.open_retry_delay = delay;
        self
    }

    /// Set the idle read timeout of outbound pumps
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.timing.read_timeout = timeout;
        self
    }

    /// Set the unsubscribe join window
    pub fn listener_join_timeout(mut self, timeout: Duration) -> Self {
        self.config.timing.listener_join_timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ProxyConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
