//! Client session bridging
//!
//! A [`ConnectionBridge`] joins one accepted TCP client to the shared serial
//! transport with two pumps:
//!
//! ```text
//!              inbound pump
//! TCP client ─────────────────► serial transport
//!            ◄─────────────────
//!              outbound pump
//! ```
//!
//! The inbound pump starts with the session. The outbound pump starts when the
//! client sends its first byte, so a client that never speaks never competes
//! for serial input.
//!
//! Socket failures end only this session. Transport failures end the session
//! and are reported to the lifecycle manager as a [`PortFault`], which closes
//! the port and every other session with it.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::error::{Result, SerialProxyError};
use crate::transport::SerialTransport;

/// How long closing waits for a session's pumps to finish
pub const SESSION_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Scratch size for draining a readable socket
const DRAIN_CHUNK: usize = 1024;

/// Largest client batch handed to one transport write
pub const MAX_BATCH: usize = 4 * DRAIN_CHUNK;

/// Transport failure seen by a session
#[derive(Debug, Clone)]
pub struct PortFault {
    /// Session that saw the failure
    pub session_id: u64,
    /// Failure description
    pub reason: String,
}

/// Byte counters of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Bytes forwarded from the client to the port
    pub bytes_to_serial: u64,
    /// Bytes forwarded from the port to the client
    pub bytes_to_client: u64,
}

#[derive(Default)]
struct Pumps {
    stream: Option<TcpStream>,
    pending_writer: Option<OwnedWriteHalf>,
    inbound: Option<JoinHandle<()>>,
    outbound: Option<JoinHandle<()>>,
}

struct Session {
    id: u64,
    peer: SocketAddr,
    transport: Arc<dyn SerialTransport>,
    read_timeout: Duration,
    faults: mpsc::UnboundedSender<PortFault>,
    closed: AtomicBool,
    failure: Mutex<Option<&'static str>>,
    outbound_started: AtomicBool,
    bytes_to_serial: AtomicU64,
    bytes_to_client: AtomicU64,
    pumps: Mutex<Pumps>,
}

/// One client session
///
/// Cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct ConnectionBridge {
    session: Arc<Session>,
}

impl ConnectionBridge {
    /// Create a session for an accepted client
    ///
    /// Nothing runs until [`ConnectionBridge::start`].
    pub fn new(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        transport: Arc<dyn SerialTransport>,
        faults: mpsc::UnboundedSender<PortFault>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            session: Arc::new(Session {
                id,
                peer,
                transport,
                read_timeout,
                faults,
                closed: AtomicBool::new(false),
                failure: Mutex::new(None),
                outbound_started: AtomicBool::new(false),
                bytes_to_serial: AtomicU64::new(0),
                bytes_to_client: AtomicU64::new(0),
                pumps: Mutex::new(Pumps {
                    stream: Some(stream),
                    ..Pumps::default()
                }),
            }),
        }
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.session.id
    }

    /// Client address
    pub fn peer(&self) -> SocketAddr {
        self.session.peer
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Whether the outbound pump has been started
    pub fn outbound_started(&self) -> bool {
        self.session.outbound_started.load(Ordering::SeqCst)
    }

    /// Byte counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_to_serial: self.session.bytes_to_serial.load(Ordering::Relaxed),
            bytes_to_client: self.session.bytes_to_client.load(Ordering::Relaxed),
        }
    }

    /// Error code of the failure that ended the session, if any
    pub fn failure_code(&self) -> Option<&'static str> {
        *self.session.failure.lock()
    }

    /// Start the inbound pump
    pub fn start(&self) {
        let mut pumps = self.session.pumps.lock();
        if self.session.is_closed() {
            return;
        }
        let Some(stream) = pumps.stream.take() else {
            return;
        };

        let (reader, writer) = stream.into_split();
        pumps.pending_writer = Some(writer);
        pumps.inbound = Some(tokio::spawn(inbound_pump(self.session.clone(), reader)));
        debug!(session = self.session.id, peer = %self.session.peer, "Session started");
    }

    /// End the session; safe to call any number of times from anywhere
    pub fn close(&self) {
        self.session.close();
    }

    /// Wait for both pumps to finish, up to `timeout`
    ///
    /// Returns false if a pump was still running when the window elapsed.
    pub async fn join(&self, timeout: Duration) -> bool {
        let (inbound, outbound) = {
            let mut pumps = self.session.pumps.lock();
            (pumps.inbound.take(), pumps.outbound.take())
        };

        let wait = async {
            if let Some(handle) = inbound {
                let _ = handle.await;
            }
            if let Some(handle) = outbound {
                let _ = handle.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl std::fmt::Debug for ConnectionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBridge")
            .field("id", &self.session.id)
            .field("peer", &self.session.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut pumps = self.pumps.lock();
        pumps.stream.take();
        pumps.pending_writer.take();
        if let Some(handle) = &pumps.inbound {
            handle.abort();
        }
        if let Some(handle) = &pumps.outbound {
            handle.abort();
        }
        debug!(session = self.id, peer = %self.peer, "Closing connection");
    }

    fn start_outbound(self: &Arc<Self>) {
        if self.outbound_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut pumps = self.pumps.lock();
        if self.is_closed() {
            return;
        }
        if let Some(writer) = pumps.pending_writer.take() {
            pumps.outbound = Some(tokio::spawn(outbound_pump(self.clone(), writer)));
            trace!(session = self.id, "Outbound pump started");
        }
    }

    fn report_fault(&self, error: &SerialProxyError) {
        let fault = PortFault {
            session_id: self.id,
            reason: error.to_string(),
        };
        if self.faults.send(fault).is_err() {
            debug!(session = self.id, "Fault receiver gone");
        }
    }

    /// End the session on a client socket error
    fn socket_failed(&self, error: io::Error, direction: &'static str) {
        let error = SerialProxyError::SocketIoFailure(format!("{}: {}", self.peer, error));
        debug!(
            session = self.id,
            direction,
            code = error.error_code(),
            error = %error,
            "Client connection failed"
        );
        self.failure.lock().get_or_insert(error.error_code());
        self.close();
    }

    /// Fail the session on a transport error
    fn transport_failed(&self, error: &SerialProxyError, direction: &'static str) {
        self.failure.lock().get_or_insert(error.error_code());
        error!(
            session = self.id,
            port = %self.transport.name(),
            direction,
            error = %error,
            "Problem with serial port"
        );
        self.close();
        if error.is_transport_failure() {
            self.report_fault(error);
        }
    }

    /// Next chunk of serial input; `None` when the bounded wait timed out
    async fn next_serial_chunk(&self) -> Result<Option<Bytes>> {
        let available = self.transport.input_buffer_count().await?;
        if available > 0 {
            let data = self.transport.read_bytes(available).await?;
            trace!(session = self.id, ">({})", data.len());
            return Ok(Some(data));
        }

        match self
            .transport
            .read_bytes_timeout(1, self.read_timeout)
            .await
        {
            Ok(data) => {
                trace!(session = self.id, ">(1.)");
                Ok(Some(data))
            }
            Err(SerialProxyError::OperationTimeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Move what is already readable into `buffer`, up to [`MAX_BATCH`] bytes
///
/// Returns true if the client closed its side.
fn drain_readable(socket: &OwnedReadHalf, buffer: &mut BytesMut) -> io::Result<bool> {
    let mut chunk = [0u8; DRAIN_CHUNK];
    while buffer.len() < MAX_BATCH {
        let room = (MAX_BATCH - buffer.len()).min(DRAIN_CHUNK);
        match socket.try_read(&mut chunk[..room]) {
            Ok(0) => return Ok(true),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Client to serial
async fn inbound_pump(session: Arc<Session>, mut socket: OwnedReadHalf) {
    let mut first = [0u8; 1];

    while !session.is_closed() {
        match socket.read(&mut first).await {
            Ok(0) => {
                trace!(session = session.id, "<(EOF)");
                session.close();
                return;
            }
            Ok(_) => {}
            Err(e) => {
                session.socket_failed(e, "from client");
                return;
            }
        }

        session.start_outbound();

        let mut buffer = BytesMut::with_capacity(DRAIN_CHUNK);
        buffer.extend_from_slice(&first);
        let client_done = match drain_readable(&socket, &mut buffer) {
            Ok(done) => done,
            Err(e) => {
                session.socket_failed(e, "from client");
                return;
            }
        };

        trace!(session = session.id, "<({})", buffer.len());
        if let Err(e) = session.transport.write_bytes(&buffer).await {
            session.transport_failed(&e, "to serial");
            return;
        }
        session
            .bytes_to_serial
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);

        if client_done {
            trace!(session = session.id, "<(EOF)");
            session.close();
            return;
        }
    }
}

/// Serial to client
async fn outbound_pump(session: Arc<Session>, mut socket: OwnedWriteHalf) {
    while !session.is_closed() {
        let data = match session.next_serial_chunk().await {
            Ok(Some(data)) => data,
            Ok(None) => continue,
            Err(e) => {
                session.transport_failed(&e, "to client");
                return;
            }
        };

        if let Err(e) = socket.write_all(&data).await {
            session.socket_failed(e, "to client");
            return;
        }
        session
            .bytes_to_client
            .fetch_add(data.len() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, peer) = accepted.unwrap();
        (client.unwrap(), server, peer)
    }

    async fn session(
        mock: &Arc<MockTransport>,
    ) -> (
        ConnectionBridge,
        TcpStream,
        mpsc::UnboundedReceiver<PortFault>,
    ) {
        let (client, server, peer) = tcp_pair().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = ConnectionBridge::new(
            1,
            server,
            peer,
            mock.clone(),
            tx,
            Duration::from_millis(50),
        );
        bridge.start();
        (bridge, client, rx)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_client_bytes_reach_serial() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, mut client, _faults) = session(&mock).await;

        client.write_all(&[0x41, 0x42]).await.unwrap();
        assert!(wait_until(|| mock.written().len() == 2).await);
        assert_eq!(mock.written(), vec![0x41, 0x42]);
        assert!(bridge.outbound_started());

        bridge.close();
    }

    #[tokio::test]
    async fn test_zero_byte_is_data() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, mut client, _faults) = session(&mock).await;

        client.write_all(&[0x00, 0x7f]).await.unwrap();
        assert!(wait_until(|| mock.written().len() == 2).await);
        assert!(!bridge.is_closed());

        bridge.close();
    }

    #[tokio::test]
    async fn test_client_burst_split_into_batches() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, client, _faults) = session(&mock).await;

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (_read, mut write) = client.into_split();
        let sent = payload.clone();
        let writer = tokio::spawn(async move { write.write_all(&sent).await });

        assert!(wait_until(|| mock.written().len() == payload.len()).await);
        writer.await.unwrap().unwrap();
        assert_eq!(mock.written(), payload);
        assert!(mock.largest_write() <= MAX_BATCH);
        assert!(mock.write_calls() >= payload.len() / MAX_BATCH);

        bridge.close();
    }

    #[tokio::test]
    async fn test_outbound_waits_for_first_client_byte() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, mut client, _faults) = session(&mock).await;

        mock.push_incoming(b"hello");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bridge.outbound_started());
        assert_eq!(mock.pending_incoming(), 5);

        client.write_all(b"x").await.unwrap();
        let mut received = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"hello");

        bridge.close();
    }

    #[tokio::test]
    async fn test_serial_order_preserved() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, mut client, _faults) = session(&mock).await;
        client.write_all(b"go").await.unwrap();

        mock.push_incoming(b"abc");
        tokio::time::sleep(Duration::from_millis(20)).await;
        mock.push_incoming(b"def");

        let mut received = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"abcdef");
        assert!(wait_until(|| bridge.stats().bytes_to_client == 6).await);

        bridge.close();
    }

    #[tokio::test]
    async fn test_idle_pump_survives_timeouts() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, mut client, mut faults) = session(&mock).await;
        client.write_all(b"x").await.unwrap();

        assert!(wait_until(|| mock.read_timeouts() >= 3).await);
        assert!(!bridge.is_closed());
        assert!(faults.try_recv().is_err());

        bridge.close();
    }

    #[tokio::test]
    async fn test_client_eof_closes_session() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, client, mut faults) = session(&mock).await;

        drop(client);
        assert!(wait_until(|| bridge.is_closed()).await);
        assert!(bridge.join(SESSION_JOIN_TIMEOUT).await);
        assert_eq!(bridge.failure_code(), None);
        assert!(faults.try_recv().is_err());
        assert!(mock.is_open());
    }

    #[tokio::test]
    async fn test_write_failure_reports_fault() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        mock.set_fail_writes(true);
        let (bridge, mut client, mut faults) = session(&mock).await;

        client.write_all(b"x").await.unwrap();
        let fault = tokio::time::timeout(Duration::from_secs(2), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fault.session_id, 1);
        assert!(bridge.is_closed());
        assert_eq!(bridge.failure_code(), Some("TRANSPORT_IO_FAILURE"));

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_client_reset_is_socket_failure() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, client, mut faults) = session(&mock).await;

        client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);

        assert!(wait_until(|| bridge.is_closed()).await);
        assert_eq!(bridge.failure_code(), Some("SOCKET_IO_FAILURE"));
        assert!(faults.try_recv().is_err());
        assert!(mock.is_open());
    }

    #[tokio::test]
    async fn test_read_failure_reports_fault() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, mut client, mut faults) = session(&mock).await;
        client.write_all(b"x").await.unwrap();
        assert!(wait_until(|| mock.written().len() == 1).await);

        mock.set_fail_reads(true);
        let fault = tokio::time::timeout(Duration::from_secs(2), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(fault.reason.contains("injected read failure"));
        assert!(bridge.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = MockTransport::new("mock0");
        mock.open().await.unwrap();
        let (bridge, mut client, _faults) = session(&mock).await;

        bridge.close();
        bridge.close();
        assert!(bridge.join(SESSION_JOIN_TIMEOUT).await);

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
