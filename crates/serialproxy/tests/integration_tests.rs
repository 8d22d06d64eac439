//! Integration tests for the serial proxy
//!
//! These tests run the real lifecycle manager over loopback TCP against an
//! in-memory serial device:
//! - Waiting for a device and listening only while it is present
//! - Byte flow in both directions, order preserved
//! - Teardown on device removal and on transport failure
//! - Event listener rules on the managed port
//! - A network transport consuming the proxy end-to-end

use serialproxy::{
    EventMask, FlagPresence, LifecycleManager, LifecycleState, MockTransport, NetworkSerialPort,
    ProxyConfig, ProxyConfigBuilder, ProxyHandle, Result, SerialEvent, SerialTransport,
    SerialTransportExt,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

// ============================================================================
// Test Infrastructure
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

const ACCEPT_TIMEOUT: Duration = Duration::from_millis(50);

fn test_config() -> ProxyConfig {
    ProxyConfigBuilder::new()
        .device("mock0")
        .bind_address("127.0.0.1")
        .listen_port(0)
        .poll_interval(Duration::from_millis(20))
        .accept_timeout(ACCEPT_TIMEOUT)
        .open_retry_delay(Duration::from_millis(10))
        .read_timeout(Duration::from_millis(50))
        .listener_join_timeout(Duration::from_millis(500))
        .build()
}

struct Proxy {
    mock: Arc<MockTransport>,
    presence: FlagPresence,
    handle: ProxyHandle,
    task: JoinHandle<Result<()>>,
}

impl Proxy {
    fn start(present: bool) -> Self {
        let mock = MockTransport::new("mock0");
        let presence = FlagPresence::new(present);
        let (manager, handle) =
            LifecycleManager::new(test_config(), mock.clone(), Box::new(presence.clone()));
        let task = tokio::spawn(manager.run());
        Self {
            mock,
            presence,
            handle,
            task,
        }
    }

    async fn wait_for_state(&self, state: LifecycleState) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.handle.state().await.unwrap() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn listening_addr(&self) -> SocketAddr {
        assert!(self.wait_for_state(LifecycleState::OpenListening).await);
        self.handle.local_addr().await.unwrap().unwrap()
    }

    async fn connect(&self) -> TcpStream {
        let addr = self.listening_addr().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        stream
    }

    async fn stop(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap().unwrap();
        assert!(!self.mock.is_open());
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Read until the peer closes; true if that happened in time
async fn sees_eof(stream: &mut TcpStream) -> bool {
    sees_eof_within(stream, WAIT).await
}

async fn sees_eof_within(stream: &mut TcpStream, limit: Duration) -> bool {
    let mut buf = [0u8; 64];
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Err(_) => return false,
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
        }
    }
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_absent_device_never_listens() {
    let proxy = Proxy::start(false);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(proxy.handle.state().await.unwrap(), LifecycleState::Absent);
    assert!(proxy.handle.local_addr().await.unwrap().is_none());
    assert_eq!(proxy.mock.open_attempts(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_device_plugged_in_later() {
    let proxy = Proxy::start(false);
    tokio::time::sleep(Duration::from_millis(60)).await;

    proxy.presence.set(true);
    let addr = proxy.listening_addr().await;
    assert_eq!(addr.ip().to_string(), "127.0.0.1");
    assert!(proxy.mock.is_open());
    assert!(proxy.mock.applied_params().is_some());

    proxy.stop().await;
}

#[tokio::test]
async fn test_open_retried_until_device_usable() {
    let proxy = Proxy::start(true);
    proxy.mock.set_fail_open(true);

    assert!(wait_until(|| proxy.mock.open_attempts() >= 3).await);
    assert_eq!(proxy.handle.state().await.unwrap(), LifecycleState::Opening);

    proxy.mock.set_fail_open(false);
    assert!(proxy.wait_for_state(LifecycleState::OpenListening).await);

    let stats = proxy.handle.stats().await.unwrap();
    assert!(stats.open_failures >= 3);
    assert_eq!(stats.consecutive_open_failures, 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_device_removed_disconnects_clients() {
    let proxy = Proxy::start(true);
    let mut client = proxy.connect().await;
    client.write_all(b"x").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"x").await);

    // one accept wait plus teardown
    proxy.presence.set(false);
    assert!(sees_eof_within(&mut client, ACCEPT_TIMEOUT * 3).await);
    assert!(proxy.wait_for_state(LifecycleState::Absent).await);
    assert!(!proxy.mock.is_open());
    assert!(proxy.handle.local_addr().await.unwrap().is_none());

    proxy.presence.set(true);
    let mut again = proxy.connect().await;
    again.write_all(b"y").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"xy").await);

    proxy.stop().await;
}

// ============================================================================
// Data Flow Tests
// ============================================================================

#[tokio::test]
async fn test_client_bytes_forwarded_exactly() {
    let proxy = Proxy::start(true);
    let mut client = proxy.connect().await;

    client.write_all(&[0x41, 0x42]).await.unwrap();
    assert!(wait_until(|| proxy.mock.written().len() >= 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(proxy.mock.written(), vec![0x41, 0x42]);

    proxy.stop().await;
}

#[tokio::test]
async fn test_serial_bytes_reach_client_in_order() {
    let proxy = Proxy::start(true);
    let mut client = proxy.connect().await;
    client.write_all(b"?").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"?").await);

    proxy.mock.push_incoming(b"first,");
    tokio::time::sleep(Duration::from_millis(20)).await;
    proxy.mock.push_incoming(b"second,");
    proxy.mock.push_incoming(b"third");

    assert_eq!(read_exactly(&mut client, 18).await, b"first,second,third");

    let mut counted = false;
    for _ in 0..100 {
        let stats = proxy.handle.stats().await.unwrap();
        if stats.bytes_to_client == 18 {
            assert_eq!(stats.bytes_to_serial, 1);
            counted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(counted);

    proxy.stop().await;
}

#[tokio::test]
async fn test_silent_client_gets_no_serial_data() {
    let proxy = Proxy::start(true);
    let _silent = proxy.connect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    proxy.mock.push_incoming(b"unclaimed");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(proxy.mock.pending_incoming(), 9);

    proxy.stop().await;
}

#[tokio::test]
async fn test_idle_session_survives_read_timeouts() {
    let proxy = Proxy::start(true);
    let mut client = proxy.connect().await;
    client.write_all(b"hello").await.unwrap();

    assert!(wait_until(|| proxy.mock.read_timeouts() >= 4).await);
    let stats = proxy.handle.stats().await.unwrap();
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.transport_faults, 0);
    assert_eq!(
        proxy.handle.state().await.unwrap(),
        LifecycleState::OpenListening
    );

    proxy.mock.push_incoming(b"late");
    assert_eq!(read_exactly(&mut client, 4).await, b"late");

    proxy.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_leaves_port_open() {
    let proxy = Proxy::start(true);
    let mut client = proxy.connect().await;
    client.write_all(b"bye").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"bye").await);
    drop(client);

    let mut closed = false;
    for _ in 0..100 {
        if proxy.handle.stats().await.unwrap().active_sessions == 0 {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed);
    assert!(proxy.mock.is_open());
    assert_eq!(proxy.mock.close_calls(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_multiple_clients_share_port() {
    let proxy = Proxy::start(true);
    let mut first = proxy.connect().await;
    let mut second = proxy.connect().await;

    first.write_all(b"A").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"A").await);
    second.write_all(b"B").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"AB").await);

    let stats = proxy.handle.stats().await.unwrap();
    assert_eq!(stats.connections_accepted, 2);
    assert_eq!(stats.active_sessions, 2);

    proxy.stop().await;
}

// ============================================================================
// Failure Tests
// ============================================================================

#[tokio::test]
async fn test_transport_failure_closes_every_session() {
    let proxy = Proxy::start(true);
    let mut failing = proxy.connect().await;
    let mut bystander = proxy.connect().await;
    bystander.write_all(b"ok").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"ok").await);

    proxy.mock.set_fail_writes(true);
    failing.write_all(b"boom").await.unwrap();

    assert!(sees_eof(&mut failing).await);
    assert!(sees_eof(&mut bystander).await);
    assert!(wait_until(|| proxy.mock.close_calls() == 1).await);

    let stats = proxy.handle.stats().await.unwrap();
    assert_eq!(stats.transport_faults, 1);

    proxy.mock.set_fail_writes(false);
    let mut fresh = proxy.connect().await;
    fresh.write_all(b"!").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"ok!").await);

    proxy.stop().await;
}

#[tokio::test]
async fn test_read_failure_closes_port() {
    let proxy = Proxy::start(true);
    let mut client = proxy.connect().await;
    client.write_all(b"x").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"x").await);

    proxy.mock.set_fail_reads(true);
    assert!(sees_eof(&mut client).await);
    assert!(wait_until(|| proxy.mock.close_calls() == 1).await);

    proxy.mock.set_fail_reads(false);
    proxy.stop().await;
}

// ============================================================================
// Event Listener Tests
// ============================================================================

#[tokio::test]
async fn test_listener_rules_on_managed_port() {
    let proxy = Proxy::start(true);
    proxy.listening_addr().await;
    let port = proxy.handle.port();
    let listener = |_event: SerialEvent| -> Result<()> { Ok(()) };

    proxy
        .mock
        .set_events_mask(EventMask::CTS | EventMask::DSR)
        .unwrap();
    port.add_event_listener(Arc::new(listener)).unwrap();
    assert_eq!(
        proxy.handle.port_snapshot().events_mask,
        EventMask::CTS | EventMask::DSR
    );

    let err = port.add_event_listener(Arc::new(listener)).unwrap_err();
    assert_eq!(err.error_code(), "LISTENER_ALREADY_ADDED");

    port.remove_event_listener().await.unwrap();
    let err = port.remove_event_listener().await.unwrap_err();
    assert_eq!(err.error_code(), "CANT_REMOVE_LISTENER");

    proxy.stop().await;
}

#[tokio::test]
async fn test_listener_removed_when_device_goes() {
    let proxy = Proxy::start(true);
    proxy.listening_addr().await;
    let port = proxy.handle.port();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let listener = move |event: SerialEvent| -> Result<()> {
        let _ = tx.send(event);
        Ok(())
    };
    port.add_event_listener_with_mask(Arc::new(listener), EventMask::RXCHAR | EventMask::CTS)
        .unwrap();
    proxy.mock.push_events(vec![serialproxy::RawEvent::new(EventMask::CTS, 1)]);

    let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(event.is_cts());
    assert_eq!(event.port_name, "mock0");

    proxy.presence.set(false);
    assert!(proxy.wait_for_state(LifecycleState::Absent).await);
    let snapshot = proxy.handle.port_snapshot();
    assert!(!snapshot.is_open);
    assert!(!snapshot.listener_attached);

    proxy.stop().await;
}

// ============================================================================
// Network Transport Tests
// ============================================================================

#[tokio::test]
async fn test_network_port_through_proxy() {
    let proxy = Proxy::start(true);
    let addr = proxy.listening_addr().await;

    let remote = NetworkSerialPort::new(&format!("serialproxy://{}", addr)).unwrap();
    remote.open().await.unwrap();

    remote.write_string("ping").await.unwrap();
    assert!(wait_until(|| proxy.mock.written() == b"ping").await);

    proxy.mock.push_incoming(&[0xca, 0xfe]);
    let reply = remote
        .read_bytes_timeout(2, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), &[0xca, 0xfe]);

    remote.close().await.unwrap();
    proxy.stop().await;
}
