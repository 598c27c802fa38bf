//! The connection session orchestrator.
//!
//! A [`ConnectionSession`] binds the setup task, the send cycle, and the
//! callback chain into one lifecycle:
//!
//! ```text
//!   Uninitialized ──init──▶ Setting Up ──announcement──▶ Connected
//!         ▲                                                 │
//!         └───────────────── shutdown ◀────────────────────┘
//! ```
//!
//! All public operations that touch the peer address, the transport, the
//! send-cycle handle, or the pending-command set share one mutex scoped to
//! the session, so lifecycle transitions are atomic with respect to each
//! other. Callback registration lives in the chain's own narrower lock and
//! is never serialized behind connection bookkeeping.
//!
//! Construct one session per connection and hand it (by `Arc`) to whatever
//! owns the connection's lifetime; there is no global instance.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::callback::{CallbackChain, CallbackResult, RecvCallback};
use crate::command::Command;
use crate::config::SessionConfig;
use crate::cycle::{ClientCallback, SendCycle, SendParameters};
use crate::datagram::{Datagram, DatagramBody};
use crate::discovery::PeerDiscovery;
use crate::error::{ProtocolError, SessionError};
use crate::liveness::RecvTimestamp;
use crate::setup::SetupTask;
use crate::transport::{Transport, TransportFactory};

// ─── Session State ───────────────────────────────────────────────────────────

struct Inner {
    /// Latch: true only before the first `init()` of a lifecycle.
    setup_needed: bool,
    /// Configured target for the setup task's initial connect.
    station_addr: SocketAddr,
    /// Active remote peer; absent means "not connected".
    peer_addr: Option<SocketAddr>,
    transport: Option<Arc<dyn Transport>>,
    cycle: Option<SendCycle>,
    setup: Option<SetupTask>,
}

/// A reliable logical connection between controller and station over an
/// unreliable datagram transport.
pub struct ConnectionSession {
    inner: Mutex<Inner>,
    chain: Arc<CallbackChain>,
    last_recv: Arc<RecvTimestamp>,
    factory: Arc<dyn TransportFactory>,
    discovery: Arc<dyn PeerDiscovery>,
    default_params: SendParameters,
}

impl ConnectionSession {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        discovery: Arc<dyn PeerDiscovery>,
    ) -> Self {
        ConnectionSession {
            inner: Mutex::new(Inner {
                setup_needed: true,
                station_addr: config.station_addr,
                peer_addr: None,
                transport: None,
                cycle: None,
                setup: None,
            }),
            chain: Arc::new(CallbackChain::new()),
            last_recv: Arc::new(RecvTimestamp::new()),
            factory,
            discovery,
            default_params: config.send,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start the one-shot setup task. No-op if setup is already in progress
    /// or has completed since the last `shutdown()`.
    pub fn init(&self) {
        let mut inner = self.lock();
        self.init_locked(&mut inner);
    }

    /// Like [`init`](Self::init), but retargets the station address first.
    pub fn init_with(&self, station_addr: SocketAddr) {
        let mut inner = self.lock();
        inner.station_addr = station_addr;
        self.init_locked(&mut inner);
    }

    fn init_locked(&self, inner: &mut Inner) {
        if !inner.setup_needed {
            trace!("init: setup already started; nothing to do");
            return;
        }
        inner.setup_needed = false;
        debug!(station = %inner.station_addr, "starting setup task");
        inner.setup = Some(SetupTask::spawn(
            inner.station_addr,
            self.factory.clone(),
            self.discovery.clone(),
            self.chain.clone(),
            self.last_recv.clone(),
        ));
    }

    /// Take the session back to its pre-setup state. Idempotent and
    /// infallible: every step runs even when it has nothing to do.
    pub fn shutdown(&self) {
        let mut inner = self.lock();

        if let Some(mut setup) = inner.setup.take() {
            setup.shutdown();
        }

        if let Some(mut cycle) = inner.cycle.take() {
            cycle.cancel();
        }

        if let Some(transport) = inner.transport.take() {
            transport.close();
        }

        inner.peer_addr = None;
        inner.setup_needed = true;
        debug!("session shut down");
    }

    // ─── Connection Establishment ────────────────────────────────────────

    /// Establish or confirm the peer announced by `packet`.
    ///
    /// A packet from the already-known address is a redundant announcement:
    /// the send cycle and `client` are told `is_new = false` and nothing
    /// else changes. Otherwise the payload is parsed (failure propagates,
    /// untouched state), the source becomes the new peer (last seen wins),
    /// the transport is retargeted, and a send cycle is started if none is
    /// active (fixed 40 ms period, first tick immediate).
    pub fn update_connection(
        &self,
        packet: &Datagram,
        params: Option<SendParameters>,
        client: Option<Arc<dyn ClientCallback>>,
    ) -> Result<(), SessionError> {
        let mut inner = self.lock();

        let source = match packet.source() {
            Some(source) => source,
            None => {
                warn!("update_connection: datagram without a source address; ignored");
                return Ok(());
            }
        };

        if inner.peer_addr == Some(source) {
            if let Some(cycle) = &inner.cycle {
                cycle.on_peer_connected(false);
            }
            if let Some(client) = &client {
                client.peer_connected(false);
            }
            return Ok(());
        }

        // Parse before mutating anything: a malformed or version-incompatible
        // announcement must leave the session exactly as it was.
        let payload = match &packet.body {
            DatagramBody::PeerDiscovery(payload) => payload,
            _ => return Err(ProtocolError::UnexpectedKind(packet.kind()).into()),
        };
        let announcement = self.discovery.parse(payload)?;

        let previous_peer = inner.peer_addr.replace(source);
        debug!(
            peer = %source,
            version = announcement.version,
            role = ?announcement.role,
            "new remote peer discovered"
        );

        if inner.transport.is_none() {
            if let Some(setup) = &inner.setup {
                inner.transport = setup.transport();
            }
        }
        let transport = match inner.transport.clone() {
            Some(transport) => transport,
            // Setup has not published yet; the peer is adopted and the send
            // cycle will start on the next announcement.
            None => return Ok(()),
        };

        if let Err(e) = transport.connect(source) {
            // Abort the transition and keep peer/transport/cycle consistent.
            inner.peer_addr = previous_peer;
            return Err(SessionError::Connect {
                addr: source,
                source: e,
            });
        }

        if inner.cycle.as_ref().map_or(true, |cycle| cycle.is_done()) {
            debug!("starting send cycle");
            if let Some(mut stale) = inner.cycle.take() {
                stale.cancel();
            }
            inner.cycle = Some(SendCycle::spawn(
                client.clone(),
                transport,
                self.last_recv.clone(),
                params.unwrap_or_else(|| self.default_params.clone()),
            ));
        }

        if let Some(cycle) = &inner.cycle {
            cycle.on_peer_connected(true);
        }
        if let Some(client) = &client {
            client.peer_connected(true);
        }
        Ok(())
    }

    // ─── Command Operations ──────────────────────────────────────────────

    /// Queue a command for at-least-once delivery. No-op when no send
    /// cycle is active.
    pub fn send_command(&self, command: Command) {
        let inner = self.lock();
        if let Some(cycle) = &inner.cycle {
            cycle.send_command(command);
        }
    }

    /// Withdraw a command from the pending set; returns whether it was
    /// pending.
    pub fn remove_command(&self, command: &Command) -> bool {
        let inner = self.lock();
        inner
            .cycle
            .as_ref()
            .is_some_and(|cycle| cycle.remove_command(&command.key()))
    }

    /// Route a reply: responses to remotely transmitted requests go over
    /// the wire; responses to locally injected requests are delivered back
    /// into the local receive path, because the requester is local.
    pub fn send_reply(&self, request: &Command, response: Command) {
        if !request.is_injected() {
            self.send_command(response);
        } else {
            self.inject_received_command(response);
        }
    }

    /// Feed `command` into the reception pipeline as if it had arrived over
    /// the wire. Dropped (and logged) when no setup task is active: there
    /// is no pipeline to receive it.
    pub fn inject_received_command(&self, mut command: Command) {
        let inner = self.lock();
        match &inner.setup {
            Some(setup) => {
                command.set_injected(true);
                setup.inject_received_command(command);
            }
            None => {
                trace!("inject_received_command: no setup task; command ignored");
            }
        }
    }

    /// Acknowledgment processing, intended to sit in the callback chain.
    ///
    /// An already-acknowledged command is the peer's ack of ours: withdraw
    /// the pending original and report handled. A fresh command gets
    /// acknowledged and retransmitted verbatim as the acknowledgment
    /// (deliberately the full body, which downstream consumers rely on),
    /// then reported not-handled so other subscribers still see it.
    pub fn process_acknowledgments(&self, command: &mut Command) -> CallbackResult {
        if command.is_acknowledged() {
            trace!(name = %command.name(), seq = command.sequence(), "received ack");
            self.remove_command(command);
            return CallbackResult::Handled;
        }
        command.acknowledge();
        self.send_command(command.clone());
        CallbackResult::NotHandled
    }

    /// Transmit an arbitrary datagram iff a connected transport exists.
    pub fn send_datagram(&self, datagram: &Datagram) {
        let inner = self.lock();
        if let Some(transport) = &inner.transport {
            if transport.peer_addr().is_some() {
                if let Err(e) = transport.send(datagram) {
                    warn!(kind = datagram.kind(), error = %e, "send_datagram failed");
                }
            }
        }
    }

    /// Forget the current peer and drop all pending commands, keeping the
    /// transport and receive infrastructure alive for a returning peer.
    pub fn client_disconnect(&self) {
        let mut inner = self.lock();
        if let Some(cycle) = &inner.cycle {
            cycle.clear_commands();
        }
        inner.peer_addr = None;
        debug!("client disconnected");
    }

    // ─── Callback Registration ───────────────────────────────────────────

    /// Register a subscriber at the front of the dispatch order.
    pub fn register_callback(&self, callback: Arc<dyn RecvCallback>) {
        self.chain.push(callback);
    }

    /// Unregister a subscriber; no-op if absent.
    pub fn unregister_callback(&self, callback: &Arc<dyn RecvCallback>) {
        self.chain.remove(callback);
    }

    /// The chain itself, for collaborators that dispatch events directly
    /// (e.g. a supervisor forwarding global errors).
    pub fn callback_chain(&self) -> Arc<CallbackChain> {
        self.chain.clone()
    }

    // ─── Introspection ───────────────────────────────────────────────────

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.lock().peer_addr
    }

    /// Whether a send cycle is currently scheduled.
    pub fn send_cycle_active(&self) -> bool {
        self.lock().cycle.as_ref().is_some_and(|c| !c.is_done())
    }

    /// Time since the last inbound datagram, for external timeout logic.
    pub fn since_last_received(&self) -> Duration {
        self.last_recv.elapsed()
    }

    /// Block until the setup task publishes the transport (or fails), up
    /// to `timeout`. Returns false if no setup is running or on timeout.
    pub fn await_setup(&self, timeout: Duration) -> bool {
        let latch = {
            let inner = self.lock();
            inner.setup.as_ref().map(|setup| setup.latch())
        };
        match latch {
            Some(latch) => latch.await_ready(timeout),
            None => false,
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
