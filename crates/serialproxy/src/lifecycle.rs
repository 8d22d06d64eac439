//! Port lifecycle management
//!
//! The [`LifecycleManager`] owns the serial port and the listen socket. It
//! polls device presence and moves through four states:
//!
//! ```text
//!            present                 opened               bound
//! Absent ───────────► Opening ───────────► OpenNoListener ───────► OpenListening
//!   ▲                   │ open failed:                                 │
//!   │                   │ sleep, retry                                 │ accept clients
//!   │                   ▼                                              │
//!   └──── device gone / transport failure: close socket, sessions, port ┘
//! ```
//!
//! Each accept wait is bounded, so a vanished device is noticed within one
//! accept timeout even while clients are connected. Sessions report transport
//! failures back over a channel; any one of them closes the whole port.
//!
//! # Example
//!
//! ```rust,ignore
//! use serialproxy::{LifecycleManager, ProxyConfigBuilder};
//!
//! let config = ProxyConfigBuilder::new().device("/dev/ttyUSB0").listen_port(9990).build();
//! let (manager, handle) = LifecycleManager::from_config(config)?;
//! tokio::spawn(manager.run());
//!
//! println!("state: {}", handle.state().await?);
//! handle.shutdown().await?;
//! ```

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{ConnectionBridge, PortFault, SessionStats, SESSION_JOIN_TIMEOUT};
use crate::config::{ProxyConfig, OPEN_FAILURE_ESCALATION, OPEN_RETRY_CAP};
use crate::error::{Result, SerialProxyError};
use crate::port::{PortHandle, PortSnapshot};
use crate::presence::{presence_for, DevicePresence};
use crate::transport::{open_transport, SerialTransport};

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    /// Device not present; only presence is polled
    Absent,
    /// Device present; opening the port
    Opening,
    /// Port open; listen socket not bound yet
    OpenNoListener,
    /// Port open and accepting clients
    OpenListening,
}

impl LifecycleState {
    /// Whether the serial port is open in this state
    pub fn is_port_open(&self) -> bool {
        matches!(
            self,
            LifecycleState::OpenNoListener | LifecycleState::OpenListening
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Absent => "absent",
            LifecycleState::Opening => "opening",
            LifecycleState::OpenNoListener => "open-no-listener",
            LifecycleState::OpenListening => "open-listening",
        };
        f.write_str(name)
    }
}

/// Proxy statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyStats {
    /// Port open attempts
    pub open_attempts: u64,
    /// Port open failures
    pub open_failures: u64,
    /// Current consecutive open failures, saturating at the retry cap
    pub consecutive_open_failures: u32,
    /// Clients accepted
    pub connections_accepted: u64,
    /// Sessions currently running
    pub active_sessions: usize,
    /// Transport failures that closed the port
    pub transport_faults: u64,
    /// Bytes forwarded from clients to the port
    pub bytes_to_serial: u64,
    /// Bytes forwarded from the port to clients
    pub bytes_to_client: u64,
}

/// Commands that can be sent to the manager
#[derive(Debug)]
pub enum ProxyCommand {
    /// Current lifecycle state
    GetState(oneshot::Sender<LifecycleState>),
    /// Address of the listen socket, if bound
    GetLocalAddr(oneshot::Sender<Option<SocketAddr>>),
    /// Statistics
    GetStats(oneshot::Sender<ProxyStats>),
    /// Close everything and stop
    Shutdown,
}

/// Handle for controlling a running [`LifecycleManager`]
#[derive(Clone)]
pub struct ProxyHandle {
    command_tx: mpsc::Sender<ProxyCommand>,
    port: Arc<PortHandle>,
}

impl ProxyHandle {
    /// Current lifecycle state
    pub async fn state(&self) -> Result<LifecycleState> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(ProxyCommand::GetState(tx)).await?;
        rx.await.map_err(|_| SerialProxyError::ChannelClosed)
    }

    /// Address of the listen socket while listening
    pub async fn local_addr(&self) -> Result<Option<SocketAddr>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(ProxyCommand::GetLocalAddr(tx)).await?;
        rx.await.map_err(|_| SerialProxyError::ChannelClosed)
    }

    /// Proxy statistics
    pub async fn stats(&self) -> Result<ProxyStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(ProxyCommand::GetStats(tx)).await?;
        rx.await.map_err(|_| SerialProxyError::ChannelClosed)
    }

    /// Stop the manager, closing the socket, sessions and port
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx.send(ProxyCommand::Shutdown).await?;
        Ok(())
    }

    /// The managed port
    ///
    /// Event listeners may be attached while the port is open; they are
    /// removed whenever the port closes.
    pub fn port(&self) -> Arc<PortHandle> {
        self.port.clone()
    }

    /// Current state of the managed port
    pub fn port_snapshot(&self) -> PortSnapshot {
        self.port.snapshot()
    }
}

/// Owner of the serial port, the listen socket and all client sessions
pub struct LifecycleManager {
    config: ProxyConfig,
    port: Arc<PortHandle>,
    presence: Box<dyn DevicePresence>,
    state: LifecycleState,
    listener: Option<TcpListener>,
    sessions: Vec<ConnectionBridge>,
    next_session_id: u64,
    fault_tx: mpsc::UnboundedSender<PortFault>,
    fault_rx: mpsc::UnboundedReceiver<PortFault>,
    command_rx: mpsc::Receiver<ProxyCommand>,
    stats: ProxyStats,
    retired: SessionStats,
}

impl LifecycleManager {
    /// Create a manager for a transport and presence probe
    pub fn new(
        config: ProxyConfig,
        transport: Arc<dyn SerialTransport>,
        presence: Box<dyn DevicePresence>,
    ) -> (Self, ProxyHandle) {
        let port = Arc::new(PortHandle::new(
            transport,
            config.timing.listener_join_timeout,
        ));
        let (command_tx, command_rx) = mpsc::channel(64);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let handle = ProxyHandle {
            command_tx,
            port: port.clone(),
        };
        let manager = Self {
            config,
            port,
            presence,
            state: LifecycleState::Absent,
            listener: None,
            sessions: Vec::new(),
            next_session_id: 1,
            fault_tx,
            fault_rx,
            command_rx,
            stats: ProxyStats::default(),
            retired: SessionStats::default(),
        };

        (manager, handle)
    }

    /// Create a manager with the transport and presence probe the config names
    pub fn from_config(config: ProxyConfig) -> Result<(Self, ProxyHandle)> {
        config.validate()?;
        let transport = open_transport(&config.serial, config.timing.event_poll_interval)?;
        let presence = presence_for(&config.serial);
        Ok(Self::new(config, transport, presence))
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Run until shut down
    pub async fn run(mut self) -> Result<()> {
        info!(
            device = %self.port.name(),
            listen = %self.config.listen.socket_addr(),
            "Starting serial proxy"
        );

        while self.step().await {}

        if self.state != LifecycleState::Absent || self.port.is_open() {
            self.close_port("shutdown").await;
        }
        info!(device = %self.port.name(), "Serial proxy stopped");
        Ok(())
    }

    /// Advance the state machine once; false when shutdown was requested
    async fn step(&mut self) -> bool {
        let present = self.presence.is_present();

        match self.state {
            LifecycleState::Absent => {
                if present {
                    info!(device = %self.port.name(), "Device present");
                    self.set_state(LifecycleState::Opening);
                    true
                } else {
                    self.idle(self.config.timing.poll_interval).await
                }
            }
            LifecycleState::Opening => {
                if !present {
                    self.set_state(LifecycleState::Absent);
                    return true;
                }
                match self.open_port().await {
                    Ok(()) => {
                        self.set_state(LifecycleState::OpenNoListener);
                        true
                    }
                    Err(e) => {
                        self.record_open_failure(&e);
                        self.idle(self.config.timing.open_retry_delay).await
                    }
                }
            }
            LifecycleState::OpenNoListener | LifecycleState::OpenListening if !present => {
                info!(device = %self.port.name(), "Device gone");
                self.close_port("device removed").await;
                true
            }
            LifecycleState::OpenNoListener => match self.bind_listener().await {
                Ok(()) => {
                    self.set_state(LifecycleState::OpenListening);
                    true
                }
                Err(e) => {
                    warn!(
                        listen = %self.config.listen.socket_addr(),
                        error = %e,
                        "Cannot open listen socket"
                    );
                    self.idle(self.config.timing.open_retry_delay).await
                }
            },
            LifecycleState::OpenListening => self.accept_once().await,
        }
    }

    fn set_state(&mut self, next: LifecycleState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Lifecycle transition");
            self.state = next;
        }
    }

    async fn open_port(&mut self) -> Result<()> {
        self.stats.open_attempts += 1;
        self.port.open(self.config.serial.params()).await?;

        if self.stats.consecutive_open_failures > 0 {
            info!(
                device = %self.port.name(),
                failures = self.stats.consecutive_open_failures,
                "Serial port opened after failures"
            );
        } else {
            info!(device = %self.port.name(), "Serial port opened");
        }
        self.stats.consecutive_open_failures = 0;
        Ok(())
    }

    fn record_open_failure(&mut self, error: &SerialProxyError) {
        self.stats.open_failures += 1;
        let failures = (self.stats.consecutive_open_failures + 1).min(OPEN_RETRY_CAP);
        self.stats.consecutive_open_failures = failures;

        if failures > OPEN_FAILURE_ESCALATION || !error.is_retriable() {
            error!(
                device = %self.port.name(),
                failures,
                error = %error,
                "Serial port keeps failing to open"
            );
        } else {
            warn!(
                device = %self.port.name(),
                failures,
                error = %error,
                "Serial port open failed"
            );
        }
    }

    async fn bind_listener(&mut self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen.socket_addr()).await?;
        info!(
            listen = %listener.local_addr()?,
            device = %self.port.name(),
            "Listening for clients"
        );
        self.listener = Some(listener);
        Ok(())
    }

    /// Sleep, still serving faults and commands
    async fn idle(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,

            Some(fault) = self.fault_rx.recv() => {
                self.handle_fault(fault).await;
                true
            }

            Some(cmd) = self.command_rx.recv() => self.handle_command(cmd),
        }
    }

    /// One bounded accept wait
    async fn accept_once(&mut self) -> bool {
        let Some(listener) = self.listener.as_ref() else {
            self.set_state(LifecycleState::OpenNoListener);
            return true;
        };
        let accept_timeout = self.config.timing.accept_timeout;

        tokio::select! {
            accepted = tokio::time::timeout(accept_timeout, listener.accept()) => {
                match accepted {
                    Err(_) => trace!("Accept timed out"),
                    Ok(Ok((stream, peer))) => self.spawn_session(stream, peer),
                    Ok(Err(e)) => self.listener_failed(&e),
                }
                true
            }

            Some(fault) = self.fault_rx.recv() => {
                self.handle_fault(fault).await;
                true
            }

            Some(cmd) = self.command_rx.recv() => self.handle_command(cmd),
        }
    }

    /// Drop a broken listen socket; the next step binds a new one
    fn listener_failed(&mut self, error: &std::io::Error) {
        warn!(error = %error, "Accept failed; reopening listen socket");
        self.listener = None;
        self.set_state(LifecycleState::OpenNoListener);
    }

    fn spawn_session(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.prune_sessions();

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
        }

        let id = self.next_session_id;
        self.next_session_id += 1;

        let session = ConnectionBridge::new(
            id,
            stream,
            peer,
            self.port.transport(),
            self.fault_tx.clone(),
            self.config.timing.read_timeout,
        );
        session.start();
        self.sessions.push(session);
        self.stats.connections_accepted += 1;

        debug!(session = id, peer = %peer, "Got connection");
    }

    fn prune_sessions(&mut self) {
        let retired = &mut self.retired;
        self.sessions.retain(|session| {
            if session.is_closed() {
                let stats = session.stats();
                retired.bytes_to_serial += stats.bytes_to_serial;
                retired.bytes_to_client += stats.bytes_to_client;
                false
            } else {
                true
            }
        });
    }

    async fn handle_fault(&mut self, fault: PortFault) {
        if !self.state.is_port_open() {
            trace!(session = fault.session_id, "Ignoring fault for closed port");
            return;
        }

        error!(
            device = %self.port.name(),
            session = fault.session_id,
            reason = %fault.reason,
            "Transport failure; closing port"
        );
        self.stats.transport_faults += 1;
        self.close_port("transport failure").await;
    }

    fn handle_command(&mut self, cmd: ProxyCommand) -> bool {
        match cmd {
            ProxyCommand::GetState(tx) => {
                let _ = tx.send(self.state);
            }
            ProxyCommand::GetLocalAddr(tx) => {
                let addr = self
                    .listener
                    .as_ref()
                    .and_then(|listener| listener.local_addr().ok());
                let _ = tx.send(addr);
            }
            ProxyCommand::GetStats(tx) => {
                let _ = tx.send(self.current_stats());
            }
            ProxyCommand::Shutdown => {
                info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    fn current_stats(&mut self) -> ProxyStats {
        self.prune_sessions();

        let mut stats = self.stats.clone();
        stats.active_sessions = self.sessions.len();
        stats.bytes_to_serial = self.retired.bytes_to_serial;
        stats.bytes_to_client = self.retired.bytes_to_client;
        for session in &self.sessions {
            let live = session.stats();
            stats.bytes_to_serial += live.bytes_to_serial;
            stats.bytes_to_client += live.bytes_to_client;
        }
        stats
    }

    /// Tear down listen socket, sessions and port, in that order
    async fn close_port(&mut self, reason: &str) {
        if let Some(listener) = self.listener.take() {
            drop(listener);
            debug!("Listen socket closed");
        }

        for session in &self.sessions {
            session.close();
        }
        let joins = self
            .sessions
            .iter()
            .map(|session| session.join(SESSION_JOIN_TIMEOUT));
        let finished = futures::future::join_all(joins).await;
        let stuck = finished.iter().filter(|done| !**done).count();
        if stuck > 0 {
            warn!(stuck, "Sessions still running after close");
        }
        self.prune_sessions();

        if let Err(e) = self.port.close().await {
            warn!(device = %self.port.name(), error = %e, "Error closing serial port");
        }

        while self.fault_rx.try_recv().is_ok() {}

        info!(device = %self.port.name(), reason, "Serial port closed");
        self.set_state(LifecycleState::Absent);
    }
}
