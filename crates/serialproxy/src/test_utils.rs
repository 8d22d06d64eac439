//! Test doubles for exercising the proxy without hardware
//!
//! [`MockTransport`] is an in-memory serial device: bytes written by clients are
//! recorded, and bytes queued with [`MockTransport::push_incoming`] are what the
//! device "sends". Failures can be injected per operation class.
//! [`FlagPresence`] is a presence probe flipped by the test.
//!
//! # Example
//!
//! ```rust,ignore
//! use serialproxy::test_utils::{FlagPresence, MockTransport};
//!
//! let transport = MockTransport::new("mock0");
//! let presence = FlagPresence::new(false);
//! let (manager, handle) = LifecycleManager::new(config, transport.clone(), Box::new(presence.clone()));
//! tokio::spawn(manager.run());
//! presence.set(true); // device "plugged in"
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Result, SerialProxyError};
use crate::presence::DevicePresence;
use crate::transport::{
    EventMask, FlowControlMode, LineStatus, PurgeFlags, RawEvent, SerialParams, SerialTransport,
};

/// Idle wait of `wait_events` when no batch is queued
const MOCK_EVENT_POLL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct MockState {
    open: bool,
    mask: EventMask,
    flow: FlowControlMode,
    lines: LineStatus,
    params: Option<SerialParams>,
    written: Vec<u8>,
    write_calls: usize,
    largest_write: usize,
    incoming: VecDeque<u8>,
    events: VecDeque<Vec<RawEvent>>,
    fail_open: bool,
    fail_writes: bool,
    fail_reads: bool,
    open_attempts: usize,
    close_calls: usize,
    read_timeouts: usize,
}

/// In-memory serial device
pub struct MockTransport {
    name: String,
    state: Mutex<MockState>,
    data_ready: Notify,
}

impl MockTransport {
    /// Create a closed mock device
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(MockState::default()),
            data_ready: Notify::new(),
        })
    }

    /// Queue bytes the device sends to clients
    pub fn push_incoming(&self, data: &[u8]) {
        self.state.lock().incoming.extend(data.iter().copied());
        self.data_ready.notify_waiters();
    }

    /// Queue one batch returned by `wait_events`
    pub fn push_events(&self, events: Vec<RawEvent>) {
        self.state.lock().events.push_back(events);
    }

    /// Everything clients wrote to the device so far
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Number of `write_bytes` calls that succeeded
    pub fn write_calls(&self) -> usize {
        self.state.lock().write_calls
    }

    /// Size of the largest successful `write_bytes` call
    pub fn largest_write(&self) -> usize {
        self.state.lock().largest_write
    }

    /// Bytes queued but not yet read
    pub fn pending_incoming(&self) -> usize {
        self.state.lock().incoming.len()
    }

    /// Make `open` fail with `PortNotFound`
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Make writes fail with a transport error
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make reads and buffer counts fail with a transport error
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
        self.data_ready.notify_waiters();
    }

    /// Set the simulated modem input lines
    pub fn set_lines(&self, lines: LineStatus) {
        self.state.lock().lines = lines;
    }

    /// Number of `open` calls, successful or not
    pub fn open_attempts(&self) -> usize {
        self.state.lock().open_attempts
    }

    /// Number of `close` calls on an open port
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    /// Number of bounded reads that timed out
    pub fn read_timeouts(&self) -> usize {
        self.state.lock().read_timeouts
    }

    /// Parameters applied by the last `set_params`
    pub fn applied_params(&self) -> Option<SerialParams> {
        self.state.lock().params
    }

    fn not_opened(&self, operation: &'static str) -> SerialProxyError {
        SerialProxyError::PortNotOpened {
            port: self.name.clone(),
            operation,
        }
    }

    fn check_open(&self, operation: &'static str) -> Result<()> {
        if self.state.lock().open {
            Ok(())
        } else {
            Err(self.not_opened(operation))
        }
    }

    /// Take `count` bytes once available, or give up at `deadline`
    async fn take_incoming(&self, count: usize, deadline: Option<Instant>) -> Result<Bytes> {
        loop {
            let notified = self.data_ready.notified();
            {
                let mut state = self.state.lock();
                if !state.open {
                    return Err(self.not_opened("read_bytes"));
                }
                if state.fail_reads {
                    return Err(SerialProxyError::transport(&self.name, "injected read failure"));
                }
                if state.incoming.len() >= count {
                    let data: Vec<u8> = state.incoming.drain(..count).collect();
                    return Ok(Bytes::from(data));
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.state.lock().read_timeouts += 1;
                        return Err(SerialProxyError::OperationTimeout {
                            port: self.name.clone(),
                            operation: "read_bytes",
                            timeout_ms: 0,
                        });
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait]
impl SerialTransport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.open_attempts += 1;
        if state.open {
            return Err(SerialProxyError::PortAlreadyOpened(self.name.clone()));
        }
        if state.fail_open {
            return Err(SerialProxyError::PortNotFound(self.name.clone()));
        }
        state.open = true;
        state.mask = EventMask::NONE;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.open {
                return Err(self.not_opened("close"));
            }
            state.open = false;
            state.mask = EventMask::NONE;
            state.close_calls += 1;
        }
        self.data_ready.notify_waiters();
        Ok(())
    }

    async fn set_params(&self, params: SerialParams) -> Result<()> {
        self.check_open("set_params")?;
        self.state.lock().params = Some(params);
        Ok(())
    }

    async fn purge(&self, flags: PurgeFlags) -> Result<()> {
        self.check_open("purge")?;
        if flags.clears_input() {
            self.state.lock().incoming.clear();
        }
        Ok(())
    }

    async fn set_rts(&self, _level: bool) -> Result<()> {
        self.check_open("set_rts")
    }

    async fn set_dtr(&self, _level: bool) -> Result<()> {
        self.check_open("set_dtr")
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(self.not_opened("write_bytes"));
        }
        if state.fail_writes {
            return Err(SerialProxyError::transport(&self.name, "injected write failure"));
        }
        state.written.extend_from_slice(data);
        state.write_calls += 1;
        state.largest_write = state.largest_write.max(data.len());
        Ok(())
    }

    async fn read_bytes(&self, count: usize) -> Result<Bytes> {
        self.take_incoming(count, None).await
    }

    async fn read_bytes_timeout(&self, count: usize, timeout: Duration) -> Result<Bytes> {
        self.take_incoming(count, Some(Instant::now() + timeout))
            .await
            .map_err(|e| match e {
                SerialProxyError::OperationTimeout {
                    port, operation, ..
                } => SerialProxyError::OperationTimeout {
                    port,
                    operation,
                    timeout_ms: timeout.as_millis() as u64,
                },
                other => other,
            })
    }

    async fn input_buffer_count(&self) -> Result<usize> {
        let state = self.state.lock();
        if !state.open {
            return Err(self.not_opened("input_buffer_count"));
        }
        if state.fail_reads {
            return Err(SerialProxyError::transport(&self.name, "injected read failure"));
        }
        Ok(state.incoming.len())
    }

    async fn output_buffer_count(&self) -> Result<usize> {
        self.check_open("output_buffer_count")?;
        Ok(0)
    }

    async fn set_flow_control(&self, mode: FlowControlMode) -> Result<()> {
        self.check_open("set_flow_control")?;
        self.state.lock().flow = mode;
        Ok(())
    }

    async fn flow_control(&self) -> Result<FlowControlMode> {
        self.check_open("flow_control")?;
        Ok(self.state.lock().flow)
    }

    async fn send_break(&self, _duration: Duration) -> Result<()> {
        self.check_open("send_break")
    }

    async fn lines_status(&self) -> Result<LineStatus> {
        self.check_open("lines_status")?;
        Ok(self.state.lock().lines)
    }

    fn set_events_mask(&self, mask: EventMask) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(self.not_opened("set_events_mask"));
        }
        state.mask = mask;
        Ok(())
    }

    fn events_mask(&self) -> Result<EventMask> {
        let state = self.state.lock();
        if !state.open {
            return Err(self.not_opened("events_mask"));
        }
        Ok(state.mask)
    }

    async fn wait_events(&self) -> Result<Vec<RawEvent>> {
        let batch = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(self.not_opened("wait_events"));
            }
            let mask = state.mask;
            if mask.is_empty() {
                None
            } else {
                state.events.pop_front().map(|batch| {
                    batch
                        .into_iter()
                        .filter(|event| mask.contains(event.event_type))
                        .collect::<Vec<_>>()
                })
            }
        };

        match batch {
            Some(batch) => Ok(batch),
            None => {
                tokio::time::sleep(MOCK_EVENT_POLL).await;
                Ok(Vec::new())
            }
        }
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("name", &self.name)
            .field("open", &state.open)
            .field("written", &state.written.len())
            .field("incoming", &state.incoming.len())
            .finish()
    }
}

/// Presence probe controlled by the test
#[derive(Debug, Clone, Default)]
pub struct FlagPresence {
    present: Arc<AtomicBool>,
}

impl FlagPresence {
    /// Create with an initial presence
    pub fn new(present: bool) -> Self {
        Self {
            present: Arc::new(AtomicBool::new(present)),
        }
    }

    /// Plug or unplug the simulated device
    pub fn set(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }
}

impl DevicePresence for FlagPresence {
    fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }
}
