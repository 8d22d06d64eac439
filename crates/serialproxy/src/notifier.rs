//! Serial event notification
//!
//! A port carries at most one event listener. While attached, a background
//! task waits on the transport for events matching the port's event mask and
//! hands each one to the listener in arrival order.
//!
//! ```text
//! transport.wait_events() ──► [RawEvent, ...] ──► value > 0 ? ──► listener.serial_event()
//!          ▲                                                            │
//!          └────────────── until stopped or wait fails ◄────────────────┘
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{Result, SerialProxyError};
use crate::transport::{EventMask, SerialEvent, SerialTransport};

tokio::task_local! {
    /// Id of the notifier whose loop runs in the current task
    static NOTIFIER_TASK: u64;
}

static NEXT_NOTIFIER_ID: AtomicU64 = AtomicU64::new(1);

/// Receiver of serial events
///
/// Returning an error ends notification for this attachment; the listener
/// stays registered until it is removed.
#[async_trait]
pub trait SerialEventListener: Send + Sync {
    /// Handle one event
    async fn serial_event(&self, event: SerialEvent) -> Result<()>;
}

#[async_trait]
impl<F> SerialEventListener for F
where
    F: Fn(SerialEvent) -> Result<()> + Send + Sync,
{
    async fn serial_event(&self, event: SerialEvent) -> Result<()> {
        self(event)
    }
}

struct Attachment {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Owner of a port's single listener slot and its notification task
pub struct EventNotifier {
    id: u64,
    transport: Arc<dyn SerialTransport>,
    join_timeout: Duration,
    attachment: Mutex<Option<Attachment>>,
}

impl EventNotifier {
    /// Create a notifier for a transport
    pub fn new(transport: Arc<dyn SerialTransport>, join_timeout: Duration) -> Self {
        Self {
            id: NEXT_NOTIFIER_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            join_timeout,
            attachment: Mutex::new(None),
        }
    }

    /// Whether a listener is attached
    pub fn is_attached(&self) -> bool {
        self.attachment.lock().is_some()
    }

    /// Attach a listener and start notification
    ///
    /// The mask is applied when the port has no mask yet, or when
    /// `overwrite_existing` is set; otherwise the assigned mask is kept.
    pub fn subscribe(
        &self,
        listener: Arc<dyn SerialEventListener>,
        mask: EventMask,
        overwrite_existing: bool,
    ) -> Result<()> {
        let mut attachment = self.attachment.lock();
        if attachment.is_some() {
            return Err(SerialProxyError::ListenerAlreadyAttached(
                self.transport.name().to_string(),
            ));
        }

        let current = self.transport.events_mask()?;
        if current.is_empty() || overwrite_existing {
            self.transport.set_events_mask(mask)?;
        } else if current != mask {
            debug!(
                port = %self.transport.name(),
                assigned = %current,
                requested = %mask,
                "Keeping assigned event mask"
            );
        }

        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(NOTIFIER_TASK.scope(
            self.id,
            notification_loop(self.transport.clone(), listener, stop.clone()),
        ));
        *attachment = Some(Attachment { stop, task });

        debug!(port = %self.transport.name(), "Event listener attached");
        Ok(())
    }

    /// Detach the listener and stop notification
    ///
    /// Waits up to the join window for the notification task to finish. When
    /// called from the listener itself, the task stops after the current
    /// callback returns and there is nothing to wait for.
    pub async fn unsubscribe(&self) -> Result<()> {
        let Some(mut attachment) = self.attachment.lock().take() else {
            return Err(SerialProxyError::NoListenerToRemove(
                self.transport.name().to_string(),
            ));
        };

        attachment.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.transport.set_events_mask(EventMask::NONE) {
            trace!(port = %self.transport.name(), error = %e, "Mask not reset");
        }

        let from_listener = NOTIFIER_TASK
            .try_with(|id| *id == self.id)
            .unwrap_or(false);
        if from_listener {
            debug!(port = %self.transport.name(), "Event listener removed from its own callback");
            return Ok(());
        }

        match tokio::time::timeout(self.join_timeout, &mut attachment.task).await {
            Ok(_) => {
                debug!(port = %self.transport.name(), "Event listener removed");
                Ok(())
            }
            Err(_) => {
                attachment.task.abort();
                warn!(
                    port = %self.transport.name(),
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "Event listener task did not stop in time"
                );
                Err(SerialProxyError::ListenerThreadJoinTimeout {
                    port: self.transport.name().to_string(),
                    timeout_ms: self.join_timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for EventNotifier {
    fn drop(&mut self) {
        if let Some(attachment) = self.attachment.get_mut().take() {
            attachment.stop.store(true, Ordering::SeqCst);
            attachment.task.abort();
        }
    }
}

async fn notification_loop(
    transport: Arc<dyn SerialTransport>,
    listener: Arc<dyn SerialEventListener>,
    stop: Arc<AtomicBool>,
) {
    let port_name = transport.name().to_string();

    while !stop.load(Ordering::SeqCst) {
        let events = match transport.wait_events().await {
            Ok(events) => events,
            Err(e) => {
                warn!(port = %port_name, error = %e, "Waiting for serial events failed");
                break;
            }
        };

        for raw in events {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if raw.value == 0 {
                continue;
            }

            let event = SerialEvent {
                port_name: port_name.clone(),
                event_type: raw.event_type,
                value: raw.value,
            };
            trace!(port = %port_name, event = %event.event_type, value = event.value, "Dispatching event");

            if let Err(e) = listener.serial_event(event).await {
                error!(port = %port_name, error = %e, "Event listener failed; notification stopped");
                return;
            }
        }
    }

    debug!(port = %port_name, "Event notification stopped");
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("port", &self.transport.name())
            .field("attached", &self.is_attached())
            .finish()
    }
}
