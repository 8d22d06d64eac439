//! Serial port handle
//!
//! Pairs a shared transport with its event notifier so the lifecycle manager
//! and client sessions see one port, and closing it tears down the listener
//! before the device is released.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SerialProxyError};
use crate::notifier::{EventNotifier, SerialEventListener};
use crate::transport::{EventMask, SerialParams, SerialTransport};

/// Point-in-time view of a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSnapshot {
    /// Port name
    pub name: String,
    /// Whether the transport is open
    pub is_open: bool,
    /// Assigned event mask; empty while closed
    pub events_mask: EventMask,
    /// Whether an event listener is attached
    pub listener_attached: bool,
}

/// Handle to one serial port
pub struct PortHandle {
    transport: Arc<dyn SerialTransport>,
    notifier: EventNotifier,
}

impl PortHandle {
    /// Wrap a transport
    pub fn new(transport: Arc<dyn SerialTransport>, listener_join_timeout: Duration) -> Self {
        let notifier = EventNotifier::new(transport.clone(), listener_join_timeout);
        Self {
            transport,
            notifier,
        }
    }

    /// Port name
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Check if the port is open
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Shared transport used by client sessions
    pub fn transport(&self) -> Arc<dyn SerialTransport> {
        self.transport.clone()
    }

    /// Open the device and apply line parameters
    ///
    /// A port whose parameters cannot be applied is closed again.
    pub async fn open(&self, params: SerialParams) -> Result<()> {
        self.transport.open().await?;

        if let Err(e) = self.transport.set_params(params).await {
            warn!(port = %self.name(), error = %e, "Failed to apply port parameters");
            if let Err(close_err) = self.transport.close().await {
                debug!(port = %self.name(), error = %close_err, "Close after failed setup");
            }
            return Err(e);
        }

        debug!(
            port = %self.name(),
            baud_rate = params.baud_rate,
            "Serial port opened"
        );
        Ok(())
    }

    /// Close the port, removing any attached listener first
    ///
    /// Closing a port that is already closed is not an error.
    pub async fn close(&self) -> Result<()> {
        if self.notifier.is_attached() {
            if let Err(e) = self.notifier.unsubscribe().await {
                warn!(port = %self.name(), error = %e, "Event listener not removed cleanly");
            }
        }

        match self.transport.close().await {
            Ok(()) => {
                debug!(port = %self.name(), "Serial port closed");
                Ok(())
            }
            Err(SerialProxyError::PortNotOpened { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Attach a listener for received-data events
    ///
    /// Keeps any mask already assigned to the port.
    pub fn add_event_listener(&self, listener: Arc<dyn SerialEventListener>) -> Result<()> {
        self.notifier.subscribe(listener, EventMask::RXCHAR, false)
    }

    /// Attach a listener, replacing the port's event mask
    pub fn add_event_listener_with_mask(
        &self,
        listener: Arc<dyn SerialEventListener>,
        mask: EventMask,
    ) -> Result<()> {
        self.notifier.subscribe(listener, mask, true)
    }

    /// Attach a listener with explicit mask handling
    pub fn subscribe(
        &self,
        listener: Arc<dyn SerialEventListener>,
        mask: EventMask,
        overwrite_existing: bool,
    ) -> Result<()> {
        self.notifier.subscribe(listener, mask, overwrite_existing)
    }

    /// Detach the listener
    pub async fn remove_event_listener(&self) -> Result<()> {
        self.notifier.unsubscribe().await
    }

    /// Whether a listener is attached
    pub fn has_event_listener(&self) -> bool {
        self.notifier.is_attached()
    }

    /// Current state of the port
    pub fn snapshot(&self) -> PortSnapshot {
        PortSnapshot {
            name: self.name().to_string(),
            is_open: self.is_open(),
            events_mask: self.transport.events_mask().unwrap_or_default(),
            listener_attached: self.notifier.is_attached(),
        }
    }
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("name", &self.name())
            .field("open", &self.is_open())
            .field("listener", &self.notifier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use crate::transport::SerialEvent;

    fn handle(mock: &Arc<MockTransport>) -> PortHandle {
        PortHandle::new(mock.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_open_applies_params() {
        let mock = MockTransport::new("mock0");
        let port = handle(&mock);

        let params = SerialParams {
            baud_rate: 9600,
            ..SerialParams::default()
        };
        port.open(params).await.unwrap();

        assert!(port.is_open());
        assert_eq!(mock.applied_params().unwrap().baud_rate, 9600);
    }

    #[tokio::test]
    async fn test_close_removes_listener() {
        let mock = MockTransport::new("mock0");
        let port = handle(&mock);
        port.open(SerialParams::default()).await.unwrap();

        let listener = |_event: SerialEvent| -> Result<()> { Ok(()) };
        port.add_event_listener(Arc::new(listener)).unwrap();
        assert!(port.has_event_listener());

        port.close().await.unwrap();
        assert!(!port.has_event_listener());
        assert!(!port.is_open());
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_twice_is_harmless() {
        let mock = MockTransport::new("mock0");
        let port = handle(&mock);
        port.open(SerialParams::default()).await.unwrap();

        port.close().await.unwrap();
        port.close().await.unwrap();
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_add_listener_keeps_mask() {
        let mock = MockTransport::new("mock0");
        let port = handle(&mock);
        port.open(SerialParams::default()).await.unwrap();
        mock.set_events_mask(EventMask::CTS | EventMask::DSR).unwrap();

        let listener = |_event: SerialEvent| -> Result<()> { Ok(()) };
        port.add_event_listener(Arc::new(listener)).unwrap();
        assert_eq!(port.snapshot().events_mask, EventMask::CTS | EventMask::DSR);
        port.remove_event_listener().await.unwrap();

        port.add_event_listener_with_mask(Arc::new(listener), EventMask::RING)
            .unwrap();
        assert_eq!(port.snapshot().events_mask, EventMask::RING);
        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot() {
        let mock = MockTransport::new("mock0");
        let port = handle(&mock);

        let closed = port.snapshot();
        assert_eq!(closed.name, "mock0");
        assert!(!closed.is_open);
        assert!(closed.events_mask.is_empty());
        assert!(!closed.listener_attached);

        port.open(SerialParams::default()).await.unwrap();
        let listener = |_event: SerialEvent| -> Result<()> { Ok(()) };
        port.add_event_listener(Arc::new(listener)).unwrap();

        let open = port.snapshot();
        assert!(open.is_open);
        assert_eq!(open.events_mask, EventMask::RXCHAR);
        assert!(open.listener_attached);
        port.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_device() {
        let mock = MockTransport::new("mock0");
        mock.set_fail_open(true);
        let port = handle(&mock);

        let err = port.open(SerialParams::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert!(!port.is_open());
    }
}
