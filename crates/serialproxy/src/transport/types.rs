//! Value types shared by every transport: event masks, line parameters,
//! flow control and purge flags.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitset of hardware/data event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMask(u32);

impl EventMask {
    /// No events
    pub const NONE: EventMask = EventMask(0);
    /// Bytes arrived in the input buffer
    pub const RXCHAR: EventMask = EventMask(1);
    /// Event character received
    pub const RXFLAG: EventMask = EventMask(2);
    /// Output buffer drained
    pub const TXEMPTY: EventMask = EventMask(4);
    /// Clear-to-send changed
    pub const CTS: EventMask = EventMask(8);
    /// Data-set-ready changed
    pub const DSR: EventMask = EventMask(16);
    /// Carrier detect changed
    pub const RLSD: EventMask = EventMask(32);
    /// Break condition
    pub const BREAK: EventMask = EventMask(64);
    /// Line status error
    pub const ERR: EventMask = EventMask(128);
    /// Ring indicator changed
    pub const RING: EventMask = EventMask(256);

    /// Every single-bit event category, in bit order
    pub const ALL: [EventMask; 9] = [
        Self::RXCHAR,
        Self::RXFLAG,
        Self::TXEMPTY,
        Self::CTS,
        Self::DSR,
        Self::RLSD,
        Self::BREAK,
        Self::ERR,
        Self::RING,
    ];

    /// Build a mask from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        EventMask(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when no bit is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`
    pub const fn contains(self, other: EventMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;

    fn bitand(self, rhs: Self) -> Self::Output {
        EventMask(self.0 & rhs.0)
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X}", self.0)
    }
}

/// One entry returned by a transport's event wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    /// Single-bit event category
    pub event_type: EventMask,
    /// Byte count for buffer events, line level (0/1) for line events
    pub value: u32,
}

impl RawEvent {
    /// Create a raw event
    pub fn new(event_type: EventMask, value: u32) -> Self {
        Self { event_type, value }
    }
}

/// Event delivered to a subscribed listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialEvent {
    /// Name of the port that produced the event
    pub port_name: String,
    /// Single-bit event category
    pub event_type: EventMask,
    /// Event value
    pub value: u32,
}

impl SerialEvent {
    /// True for input-buffer events
    pub fn is_rxchar(&self) -> bool {
        self.event_type == EventMask::RXCHAR
    }

    /// True for clear-to-send events
    pub fn is_cts(&self) -> bool {
        self.event_type == EventMask::CTS
    }
}

/// Snapshot of the modem control input lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineStatus {
    /// Clear to send
    pub cts: bool,
    /// Data set ready
    pub dsr: bool,
    /// Ring indicator
    pub ring: bool,
    /// Receive line signal detect (carrier)
    pub rlsd: bool,
}

impl LineStatus {
    /// Lines as `[cts, dsr, ring, rlsd]` with 1 for high
    pub fn as_array(&self) -> [u8; 4] {
        [
            self.cts as u8,
            self.dsr as u8,
            self.ring as u8,
            self.rlsd as u8,
        ]
    }
}

/// Flow control bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowControlMode(u8);

impl FlowControlMode {
    /// No flow control
    pub const NONE: FlowControlMode = FlowControlMode(0);
    /// RTS/CTS on input
    pub const RTSCTS_IN: FlowControlMode = FlowControlMode(1);
    /// RTS/CTS on output
    pub const RTSCTS_OUT: FlowControlMode = FlowControlMode(2);
    /// XON/XOFF on input
    pub const XONXOFF_IN: FlowControlMode = FlowControlMode(4);
    /// XON/XOFF on output
    pub const XONXOFF_OUT: FlowControlMode = FlowControlMode(8);

    /// Build from raw bits
    pub const fn from_bits(bits: u8) -> Self {
        FlowControlMode(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if either RTS/CTS bit is set
    pub fn is_hardware(self) -> bool {
        self.0 & (Self::RTSCTS_IN.0 | Self::RTSCTS_OUT.0) != 0
    }

    /// True if either XON/XOFF bit is set
    pub fn is_software(self) -> bool {
        self.0 & (Self::XONXOFF_IN.0 | Self::XONXOFF_OUT.0) != 0
    }
}

impl BitOr for FlowControlMode {
    type Output = FlowControlMode;

    fn bitor(self, rhs: Self) -> Self::Output {
        FlowControlMode(self.0 | rhs.0)
    }
}

/// Buffer purge bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeFlags(u8);

impl PurgeFlags {
    /// Abort pending writes
    pub const TXABORT: PurgeFlags = PurgeFlags(0x01);
    /// Abort pending reads
    pub const RXABORT: PurgeFlags = PurgeFlags(0x02);
    /// Clear output buffer
    pub const TXCLEAR: PurgeFlags = PurgeFlags(0x04);
    /// Clear input buffer
    pub const RXCLEAR: PurgeFlags = PurgeFlags(0x08);

    /// Build from raw bits
    pub const fn from_bits(bits: u8) -> Self {
        PurgeFlags(bits)
    }

    /// True if the input side should be discarded
    pub fn clears_input(self) -> bool {
        self.0 & (Self::RXCLEAR.0 | Self::RXABORT.0) != 0
    }

    /// True if the output side should be discarded
    pub fn clears_output(self) -> bool {
        self.0 & (Self::TXCLEAR.0 | Self::TXABORT.0) != 0
    }
}

impl BitOr for PurgeFlags {
    type Output = PurgeFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PurgeFlags(self.0 | rhs.0)
    }
}

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    /// 5 bits
    Five,
    /// 6 bits
    Six,
    /// 7 bits
    Seven,
    /// 8 bits
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        match bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(format!("unsupported data bits: {}", other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    /// 1 stop bit
    #[serde(rename = "1")]
    One,
    /// 1.5 stop bits
    #[serde(rename = "1.5")]
    OnePointFive,
    /// 2 stop bits
    #[serde(rename = "2")]
    Two,
}

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
    /// Parity bit always 1
    Mark,
    /// Parity bit always 0
    Space,
}

/// Line parameters applied right after a port opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: DataBits,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Parity
    pub parity: Parity,
    /// Raise RTS after configuring
    pub rts: bool,
    /// Raise DTR after configuring
    pub dtr: bool,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: crate::config::DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            rts: true,
            dtr: true,
        }
    }
}
