//! # Integration tests: session lifecycle over an in-memory transport
//!
//! No real network I/O: the transport records outbound datagrams and
//! serves queued inbound ones, so the full vertical stack (setup task,
//! receive pump, command processor, send cycle, session orchestration)
//! runs on real threads against a deterministic peer.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fieldlink_session::callback::{CallbackResult, RecvCallback};
use fieldlink_session::command::Command;
use fieldlink_session::config::SessionConfig;
use fieldlink_session::cycle::ClientCallback;
use fieldlink_session::datagram::{Datagram, DatagramBody};
use fieldlink_session::discovery::{PeerAnnouncement, PeerDiscovery, PeerRole};
use fieldlink_session::error::{ProtocolError, SessionError};
use fieldlink_session::session::ConnectionSession;
use fieldlink_session::transport::{Transport, TransportFactory};

// ─── Mocks ───────────────────────────────────────────────────────────────────

struct MockTransport {
    sent: Mutex<Vec<Datagram>>,
    inbound: Mutex<VecDeque<Datagram>>,
    peer: Mutex<Option<SocketAddr>>,
    fail_connect: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(VecDeque::new()),
            peer: Mutex::new(None),
            fail_connect: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn queue_inbound(&self, datagram: Datagram) {
        self.inbound.lock().unwrap().push_back(datagram);
    }

    fn sent_heartbeats(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|d| matches!(d.body, DatagramBody::Heartbeat { .. }))
            .count()
    }

    fn sent_command_names(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|d| match &d.body {
                DatagramBody::Command(c) => Some(c.name().to_string()),
                _ => None,
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "refused"));
        }
        *self.peer.lock().unwrap() = Some(addr);
        Ok(())
    }

    fn send(&self, datagram: &Datagram) -> io::Result<()> {
        if !self.closed.load(Ordering::Relaxed) {
            self.sent.lock().unwrap().push(datagram.clone());
        }
        Ok(())
    }

    fn recv(&self) -> io::Result<Option<Datagram>> {
        if let Some(datagram) = self.inbound.lock().unwrap().pop_front() {
            return Ok(Some(datagram));
        }
        std::thread::sleep(Duration::from_millis(5));
        Ok(None)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

struct MockFactory {
    transport: Arc<MockTransport>,
    opens: AtomicUsize,
}

impl TransportFactory for MockFactory {
    fn open(&self, _station: SocketAddr) -> io::Result<Arc<dyn Transport>> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(self.transport.clone())
    }
}

struct MockDiscovery;

impl PeerDiscovery for MockDiscovery {
    fn parse(&self, payload: &[u8]) -> Result<PeerAnnouncement, ProtocolError> {
        match payload.first() {
            None => Err(ProtocolError::Truncated(0)),
            Some(&1) => Ok(PeerAnnouncement {
                version: 1,
                role: PeerRole::Station,
            }),
            Some(&other) => Err(ProtocolError::VersionMismatch {
                ours: 1,
                theirs: other,
            }),
        }
    }

    fn announcement(&self) -> Bytes {
        Bytes::from_static(&[1])
    }
}

struct ClientProbe {
    connections: Mutex<Vec<bool>>,
}

impl ClientProbe {
    fn new() -> Arc<Self> {
        Arc::new(ClientProbe {
            connections: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<bool> {
        self.connections.lock().unwrap().clone()
    }
}

impl ClientCallback for ClientProbe {
    fn peer_connected(&self, is_new: bool) {
        self.connections.lock().unwrap().push(is_new);
    }
}

struct CommandSink {
    seen: Arc<Mutex<Vec<String>>>,
}

impl RecvCallback for CommandSink {
    fn name(&self) -> &str {
        "command-sink"
    }

    fn command_event(&self, command: &mut Command) -> CallbackResult {
        self.seen.lock().unwrap().push(command.name().to_string());
        CallbackResult::Handled
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn peer(n: u8) -> SocketAddr {
    format!("10.0.0.{n}:20884").parse().unwrap()
}

fn announcement_from(source: SocketAddr) -> Datagram {
    Datagram::received(
        DatagramBody::PeerDiscovery(Bytes::from_static(&[1])),
        source,
    )
}

fn new_session() -> (ConnectionSession, Arc<MockTransport>, Arc<MockFactory>) {
    // Opt-in diagnostics for debugging flaky runs: RUST_LOG=trace cargo test
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let transport = MockTransport::new();
    let factory = Arc::new(MockFactory {
        transport: transport.clone(),
        opens: AtomicUsize::new(0),
    });
    let session = ConnectionSession::new(
        SessionConfig::default(),
        factory.clone(),
        Arc::new(MockDiscovery),
    );
    (session, transport, factory)
}

/// init() and wait until the setup task has published the transport.
fn init_and_wait(session: &ConnectionSession) {
    session.init();
    assert!(
        session.await_setup(Duration::from_secs(1)),
        "setup did not publish in time"
    );
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[test]
fn init_is_idempotent_per_lifecycle() {
    let (session, _transport, factory) = new_session();

    init_and_wait(&session);
    session.init();
    assert_eq!(factory.opens.load(Ordering::Relaxed), 1, "one setup task only");

    session.shutdown();
    init_and_wait(&session);
    assert_eq!(
        factory.opens.load(Ordering::Relaxed),
        2,
        "shutdown re-arms the setup latch"
    );
}

#[test]
fn shutdown_is_idempotent_even_before_init() {
    let (session, _transport, _factory) = new_session();
    session.shutdown();
    session.shutdown();
    assert!(session.peer_address().is_none());
    assert!(!session.send_cycle_active());
}

#[test]
fn shutdown_resets_connected_session() {
    let (session, transport, _factory) = new_session();
    init_and_wait(&session);
    session
        .update_connection(&announcement_from(peer(7)), None, None)
        .unwrap();
    assert!(session.send_cycle_active());

    session.shutdown();
    assert!(session.peer_address().is_none());
    assert!(!session.send_cycle_active());
    assert!(transport.closed.load(Ordering::Relaxed));
}

// ─── Establishing Peers ──────────────────────────────────────────────────────

#[test]
fn redundant_announcement_reports_not_new() {
    let (session, _transport, _factory) = new_session();
    init_and_wait(&session);
    let client = ClientProbe::new();

    session
        .update_connection(&announcement_from(peer(7)), None, Some(client.clone()))
        .unwrap();
    session
        .update_connection(&announcement_from(peer(7)), None, Some(client.clone()))
        .unwrap();

    assert_eq!(client.seen(), vec![true, false]);
    assert_eq!(session.peer_address(), Some(peer(7)));
    assert!(session.send_cycle_active());
}

#[test]
fn new_peer_supersedes_old_and_cycle_starts_immediately() {
    let (session, transport, _factory) = new_session();
    init_and_wait(&session);
    let client = ClientProbe::new();

    session
        .update_connection(&announcement_from(peer(7)), None, Some(client.clone()))
        .unwrap();
    std::thread::sleep(Duration::from_millis(25));
    assert!(
        transport.sent_heartbeats() >= 1,
        "first tick runs with zero delay"
    );

    session
        .update_connection(&announcement_from(peer(8)), None, Some(client.clone()))
        .unwrap();
    assert_eq!(session.peer_address(), Some(peer(8)), "last seen peer wins");
    assert_eq!(transport.peer_addr(), Some(peer(8)));
    assert!(session.send_cycle_active());
    assert_eq!(client.seen(), vec![true, true]);
}

#[test]
fn malformed_announcement_leaves_state_untouched() {
    let (session, _transport, _factory) = new_session();
    init_and_wait(&session);

    session
        .update_connection(&announcement_from(peer(7)), None, None)
        .unwrap();

    let bad = Datagram::received(
        DatagramBody::PeerDiscovery(Bytes::from_static(&[9])),
        peer(8),
    );
    let err = session.update_connection(&bad, None, None).unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));

    assert_eq!(session.peer_address(), Some(peer(7)));
    assert!(session.send_cycle_active());
}

#[test]
fn non_discovery_datagram_is_a_protocol_error() {
    let (session, _transport, _factory) = new_session();
    init_and_wait(&session);

    let not_discovery = Datagram::received(DatagramBody::Empty, peer(7));
    let err = session
        .update_connection(&not_discovery, None, None)
        .unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)));
    assert!(session.peer_address().is_none());
}

#[test]
fn connect_failure_restores_prior_peer() {
    let (session, transport, _factory) = new_session();
    init_and_wait(&session);

    session
        .update_connection(&announcement_from(peer(7)), None, None)
        .unwrap();

    transport.fail_connect.store(true, Ordering::Relaxed);
    let err = session
        .update_connection(&announcement_from(peer(8)), None, None)
        .unwrap_err();
    match err {
        SessionError::Connect { addr, .. } => assert_eq!(addr, peer(8)),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(
        session.peer_address(),
        Some(peer(7)),
        "failed transition leaves the prior peer tracked"
    );
    assert!(session.send_cycle_active());
}

// ─── Commands & Acknowledgments ──────────────────────────────────────────────

#[test]
fn ack_round_trip() {
    let (session, _transport, _factory) = new_session();
    init_and_wait(&session);
    session
        .update_connection(&announcement_from(peer(7)), None, None)
        .unwrap();

    let mut command = Command::new("set-mode", 42, Bytes::from_static(b"auto"));

    // Fresh command: acknowledged, retransmitted verbatim, not handled.
    let first = session.process_acknowledgments(&mut command);
    assert_eq!(first, CallbackResult::NotHandled);
    assert!(command.is_acknowledged());

    // The peer's ack of our ack: withdraw the pending copy, handled.
    let mut echoed = command.clone();
    let second = session.process_acknowledgments(&mut echoed);
    assert_eq!(second, CallbackResult::Handled);
    assert!(
        !session.remove_command(&command),
        "pending copy was withdrawn by the ack"
    );
}

#[test]
fn queued_commands_retransmit_until_withdrawn() {
    let (session, transport, _factory) = new_session();
    init_and_wait(&session);
    session
        .update_connection(&announcement_from(peer(7)), None, None)
        .unwrap();

    let command = Command::new("arm", 3, Bytes::new());
    session.send_command(command.clone());
    std::thread::sleep(Duration::from_millis(150));

    let resends = transport
        .sent_command_names()
        .iter()
        .filter(|n| n.as_str() == "arm")
        .count();
    assert!(resends >= 2, "expected repeated resends, got {resends}");

    assert!(session.remove_command(&command));
    assert!(!session.remove_command(&command));
}

#[test]
fn send_command_without_cycle_is_noop() {
    let (session, _transport, _factory) = new_session();
    let command = Command::new("arm", 3, Bytes::new());
    session.send_command(command.clone());
    assert!(!session.remove_command(&command));
}

// ─── Reply Routing & Injection ───────────────────────────────────────────────

#[test]
fn reply_to_remote_request_is_transmitted() {
    let (session, transport, _factory) = new_session();
    init_and_wait(&session);
    session
        .update_connection(&announcement_from(peer(7)), None, None)
        .unwrap();

    let remote_request = Command::new("query", 1, Bytes::new());
    let response = Command::new("query-result", 2, Bytes::new());
    session.send_reply(&remote_request, response.clone());

    assert!(session.remove_command(&response), "response was queued for the wire");
    std::thread::sleep(Duration::from_millis(10));
    assert!(!transport
        .sent_command_names()
        .contains(&"query".to_string()));
}

#[test]
fn reply_to_injected_request_is_delivered_locally() {
    let (session, _transport, _factory) = new_session();
    let seen = Arc::new(Mutex::new(Vec::new()));
    session.register_callback(Arc::new(CommandSink { seen: seen.clone() }));
    init_and_wait(&session);
    session
        .update_connection(&announcement_from(peer(7)), None, None)
        .unwrap();

    let mut local_request = Command::new("query", 1, Bytes::new());
    local_request.set_injected(true);
    let response = Command::new("query-result", 2, Bytes::new());
    session.send_reply(&local_request, response.clone());

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*seen.lock().unwrap(), vec!["query-result".to_string()]);
    assert!(
        !session.remove_command(&response),
        "locally delivered response is never queued for the wire"
    );
}

#[test]
fn injection_without_setup_is_dropped() {
    let (session, _transport, _factory) = new_session();
    // Never initialized: nothing to receive the command; must not panic.
    session.inject_received_command(Command::new("halt", 1, Bytes::new()));
}

#[test]
fn wire_received_command_reaches_subscribers() {
    let (session, transport, _factory) = new_session();
    let seen = Arc::new(Mutex::new(Vec::new()));
    session.register_callback(Arc::new(CommandSink { seen: seen.clone() }));
    init_and_wait(&session);

    transport.queue_inbound(Datagram::received(
        DatagramBody::Command(Command::new("ping", 5, Bytes::new())),
        peer(7),
    ));

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*seen.lock().unwrap(), vec!["ping".to_string()]);
}

// ─── Misc Session Operations ─────────────────────────────────────────────────

#[test]
fn send_datagram_requires_connected_transport() {
    let (session, transport, _factory) = new_session();
    session.send_datagram(&Datagram::heartbeat()); // no transport yet: no-op

    init_and_wait(&session);
    session
        .update_connection(&announcement_from(peer(7)), None, None)
        .unwrap();
    let before = transport.sent.lock().unwrap().len();
    session.send_datagram(&Datagram::new(DatagramBody::Telemetry(Bytes::from_static(
        b"volts=12.1",
    ))));
    assert!(transport.sent.lock().unwrap().len() > before);
}

#[test]
fn client_disconnect_clears_pending_and_forgets_peer() {
    let (session, _transport, _factory) = new_session();
    init_and_wait(&session);
    session
        .update_connection(&announcement_from(peer(7)), None, None)
        .unwrap();

    let command = Command::new("arm", 3, Bytes::new());
    session.send_command(command.clone());
    session.client_disconnect();

    assert!(session.peer_address().is_none());
    assert!(!session.remove_command(&command), "pending set was cleared");
    assert!(
        session.send_cycle_active(),
        "infrastructure stays up for a returning peer"
    );
}

#[test]
fn inbound_traffic_refreshes_liveness() {
    let (session, transport, _factory) = new_session();
    init_and_wait(&session);

    std::thread::sleep(Duration::from_millis(50));
    transport.queue_inbound(Datagram::received(DatagramBody::Empty, peer(7)));
    std::thread::sleep(Duration::from_millis(50));

    assert!(session.since_last_received() < Duration::from_millis(80));
}
