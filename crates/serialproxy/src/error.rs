//! Error types for serial proxy operations
//!
//! Errors fall into two propagation classes. Transport failures belong to the
//! whole port: whoever sees one must get the port closed. Socket failures belong
//! to a single client session and never leave it.

use thiserror::Error;

/// Main error type for serial proxy operations
#[derive(Error, Debug)]
pub enum SerialProxyError {
    // ===== Port lifecycle errors =====
    /// Device is missing or busy
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Open called on a port that is already open
    #[error("Serial port already opened: {0}")]
    PortAlreadyOpened(String),

    /// Operation attempted on a closed port
    #[error("Serial port {port} is not opened ({operation})")]
    PortNotOpened {
        /// Port name
        port: String,
        /// Operation that was attempted
        operation: &'static str,
    },

    // ===== Event listener errors =====
    /// A listener is already attached to the port
    #[error("Event listener already attached to {0}")]
    ListenerAlreadyAttached(String),

    /// Remove requested with no listener attached
    #[error("No event listener attached to {0}")]
    NoListenerToRemove(String),

    /// Notification task did not stop within the join window
    #[error("Event listener task on {port} did not stop within {timeout_ms}ms")]
    ListenerThreadJoinTimeout {
        /// Port name
        port: String,
        /// Join window in milliseconds
        timeout_ms: u64,
    },

    /// A listener callback returned an error
    #[error("Event listener failed: {0}")]
    Listener(String),

    // ===== I/O errors =====
    /// Bounded read did not complete in time
    #[error("Operation {operation} on {port} timed out after {timeout_ms}ms")]
    OperationTimeout {
        /// Port name
        port: String,
        /// Operation that timed out
        operation: &'static str,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Serial transport I/O failure
    #[error("Transport I/O failure on {port}: {reason}")]
    TransportIoFailure {
        /// Port name
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Client socket I/O failure
    #[error("Socket I/O failure: {0}")]
    SocketIoFailure(String),

    // ===== Configuration errors =====
    /// Malformed `serialproxy://host:port` address
    #[error("Invalid port address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General errors =====
    /// Command channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SerialProxyError {
    /// Shorthand for a [`SerialProxyError::TransportIoFailure`]
    pub fn transport(port: impl Into<String>, reason: impl ToString) -> Self {
        SerialProxyError::TransportIoFailure {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SerialProxyError::OperationTimeout { .. } | SerialProxyError::PortNotFound(_)
        )
    }

    /// Check if this failure belongs to the whole port rather than one session
    ///
    /// A bridge that sees one of these must get the port closed.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            SerialProxyError::TransportIoFailure { .. } | SerialProxyError::PortNotOpened { .. }
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            SerialProxyError::PortNotFound(_) => "PORT_NOT_FOUND",
            SerialProxyError::PortAlreadyOpened(_) => "PORT_ALREADY_OPENED",
            SerialProxyError::PortNotOpened { .. } => "PORT_NOT_OPENED",
            SerialProxyError::ListenerAlreadyAttached(_) => "LISTENER_ALREADY_ADDED",
            SerialProxyError::NoListenerToRemove(_) => "CANT_REMOVE_LISTENER",
            SerialProxyError::ListenerThreadJoinTimeout { .. } => "LISTENER_THREAD_JOIN_TIMEOUT",
            SerialProxyError::Listener(_) => "LISTENER_FAILED",
            SerialProxyError::OperationTimeout { .. } => "OPERATION_TIMEOUT",
            SerialProxyError::TransportIoFailure { .. } => "TRANSPORT_IO_FAILURE",
            SerialProxyError::SocketIoFailure(_) => "SOCKET_IO_FAILURE",
            SerialProxyError::InvalidAddress(_) => "INVALID_ADDRESS",
            SerialProxyError::InvalidConfig(_) => "INVALID_CONFIG",
            SerialProxyError::ChannelClosed => "CHANNEL_CLOSED",
            SerialProxyError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for serial proxy operations
pub type Result<T> = std::result::Result<T, SerialProxyError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for SerialProxyError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind {
            tokio_serial::ErrorKind::NoDevice => SerialProxyError::PortNotFound(err.description),
            tokio_serial::ErrorKind::InvalidInput => {
                SerialProxyError::InvalidConfig(err.description)
            }
            _ => SerialProxyError::TransportIoFailure {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SerialProxyError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SerialProxyError::ChannelClosed
    }
}
