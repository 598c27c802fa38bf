//! One-shot connection setup.
//!
//! Runs once per lifecycle on a dedicated thread: opens the transport
//! through the injected factory, targets it at the configured station
//! address, then brings up the receive side: a pump thread that drains
//! the socket and demultiplexes datagrams into the callback chain, and a
//! command-processor thread that dispatches command events from a queue.
//! Locally injected commands enter that same queue, so they are processed
//! exactly as remotely received ones.
//!
//! The finished transport is published behind a latch; `shutdown()` waits
//! on the latch first so it never races an in-flight setup. Worker threads
//! are signalled and left to drain on their own (they poll a shutdown flag
//! between receives) rather than joined, so teardown never blocks behind
//! subscriber logic.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use quanta::Instant;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::callback::CallbackChain;
use crate::command::Command;
use crate::datagram::DatagramBody;
use crate::discovery::{DiscoveryAnnouncer, PeerDiscovery};
use crate::liveness::RecvTimestamp;
use crate::transport::{Transport, TransportFactory};

/// Poll interval for the command-processor queue.
const COMMAND_POLL: Duration = Duration::from_millis(100);

/// How long `shutdown()` waits for an in-flight setup before proceeding.
const SETUP_GRACE: Duration = Duration::from_secs(5);

// ─── Shared State ────────────────────────────────────────────────────────────

#[derive(Default)]
struct SetupState {
    ready: bool,
    transport: Option<Arc<dyn Transport>>,
    inject_tx: Option<Sender<Command>>,
    announcer: Option<DiscoveryAnnouncer>,
}

struct SetupShared {
    state: Mutex<SetupState>,
    ready_cv: Condvar,
    shutdown: AtomicBool,
}

impl SetupShared {
    fn lock(&self) -> MutexGuard<'_, SetupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: SetupState) {
        *self.lock() = SetupState {
            ready: true,
            ..state
        };
        self.ready_cv.notify_all();
    }

    fn await_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .ready_cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }
        true
    }
}

/// Cheap handle onto the setup latch, usable without the session lock.
#[derive(Clone)]
pub struct SetupLatch {
    shared: Arc<SetupShared>,
}

impl SetupLatch {
    /// Wait until setup publishes (or fails) or the timeout passes.
    pub fn await_ready(&self, timeout: Duration) -> bool {
        self.shared.await_ready(timeout)
    }
}

// ─── Setup Task ──────────────────────────────────────────────────────────────

/// Handle to the one-shot setup routine. Present on the session between
/// `init()` and the next `shutdown()`.
pub struct SetupTask {
    shared: Arc<SetupShared>,
    handle: Option<JoinHandle<()>>,
}

impl SetupTask {
    pub fn spawn(
        station: SocketAddr,
        factory: Arc<dyn TransportFactory>,
        discovery: Arc<dyn PeerDiscovery>,
        chain: Arc<CallbackChain>,
        last_recv: Arc<RecvTimestamp>,
    ) -> Self {
        let shared = Arc::new(SetupShared {
            state: Mutex::new(SetupState::default()),
            ready_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let run_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("fieldlink-setup".into())
            .spawn(move || run(run_shared, station, factory, discovery, chain, last_recv))
            .expect("failed to spawn setup task");
        SetupTask {
            shared,
            handle: Some(handle),
        }
    }

    /// The transport, if setup has published it. Non-blocking.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.shared.lock().transport.clone()
    }

    pub fn latch(&self) -> SetupLatch {
        SetupLatch {
            shared: self.shared.clone(),
        }
    }

    /// Feed a command into the reception pipeline as if it had arrived
    /// over the wire. Dropped (with a trace) if the receive side is not up.
    pub fn inject_received_command(&self, command: Command) {
        let state = self.shared.lock();
        match &state.inject_tx {
            Some(tx) => {
                let _ = tx.send(command);
            }
            None => {
                trace!("inject_received_command: receive pipeline not up; command ignored")
            }
        }
    }

    /// Tear down the receive side. Waits for an in-flight setup to reach a
    /// safe point, then signals the workers and releases the transport.
    pub fn shutdown(&mut self) {
        if !self.shared.await_ready(SETUP_GRACE) {
            warn!("setup did not publish within grace period; shutting down anyway");
        }
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        let mut state = self.shared.lock();
        if let Some(mut announcer) = state.announcer.take() {
            announcer.stop();
        }
        // Dropping the sender disconnects the command processor once the
        // receive pump (which holds the other clone) exits.
        state.inject_tx = None;
        if let Some(transport) = state.transport.take() {
            transport.close();
        }
    }
}

impl Drop for SetupTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Setup Routine ───────────────────────────────────────────────────────────

fn run(
    shared: Arc<SetupShared>,
    station: SocketAddr,
    factory: Arc<dyn TransportFactory>,
    discovery: Arc<dyn PeerDiscovery>,
    chain: Arc<CallbackChain>,
    last_recv: Arc<RecvTimestamp>,
) {
    let transport = match factory.open(station) {
        Ok(transport) => transport,
        Err(e) => {
            error!(%station, error = %e, "unable to open transport");
            shared.publish(SetupState::default());
            return;
        }
    };

    // The controller initiates: aim the socket at the station right away.
    if let Err(e) = transport.connect(station) {
        error!(%station, error = %e, "initial connect failed");
        shared.publish(SetupState::default());
        return;
    }

    let (inject_tx, command_rx) = unbounded::<Command>();

    let pump_transport = transport.clone();
    let pump_chain = chain.clone();
    let pump_tx = inject_tx.clone();
    let pump_shutdown = shared.clone();
    thread::Builder::new()
        .name("fieldlink-recv".into())
        .spawn(move || recv_pump(pump_transport, pump_chain, last_recv, pump_tx, pump_shutdown))
        .expect("failed to spawn receive pump");

    let processor_shared = shared.clone();
    thread::Builder::new()
        .name("fieldlink-commands".into())
        .spawn(move || command_pump(command_rx, chain, processor_shared))
        .expect("failed to spawn command processor");

    let announcer = DiscoveryAnnouncer::spawn(transport.clone(), discovery);

    shared.publish(SetupState {
        ready: true,
        transport: Some(transport),
        inject_tx: Some(inject_tx),
        announcer: Some(announcer),
    });
    debug!(%station, "setup complete");
}

// ─── Receive Pump ────────────────────────────────────────────────────────────

fn recv_pump(
    transport: Arc<dyn Transport>,
    chain: Arc<CallbackChain>,
    last_recv: Arc<RecvTimestamp>,
    command_tx: Sender<Command>,
    shared: Arc<SetupShared>,
) {
    while !shared.shutdown.load(Ordering::Acquire) {
        let datagram = match transport.recv() {
            Ok(Some(datagram)) => datagram,
            Ok(None) => continue,
            Err(e) => {
                if !shared.shutdown.load(Ordering::Acquire) {
                    warn!(error = %e, "receive pump terminated");
                }
                break;
            }
        };

        last_recv.reset();
        trace!(kind = datagram.kind(), "datagram received");

        if chain.packet_received(&datagram).stop_dispatch() {
            continue;
        }

        match &datagram.body {
            DatagramBody::PeerDiscovery(_) => {
                chain.peer_discovery_event(&datagram);
            }
            DatagramBody::Heartbeat { .. } => {
                chain.heartbeat_event(&datagram, Instant::now());
            }
            DatagramBody::Command(command) => {
                let _ = command_tx.send(command.clone());
            }
            DatagramBody::Telemetry(_) => {
                chain.telemetry_event(&datagram);
            }
            DatagramBody::Gamepad(_) => {
                chain.gamepad_event(&datagram);
            }
            DatagramBody::Empty => {
                chain.empty_event(&datagram);
            }
        }
    }
    trace!("receive pump exited");
}

// ─── Command Processor ───────────────────────────────────────────────────────

fn command_pump(rx: Receiver<Command>, chain: Arc<CallbackChain>, shared: Arc<SetupShared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        match rx.recv_timeout(COMMAND_POLL) {
            Ok(mut command) => {
                chain.command_event(&mut command);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("command processor exited");
}
