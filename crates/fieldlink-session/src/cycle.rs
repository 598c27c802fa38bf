//! The send cycle.
//!
//! One dedicated thread per connection, ticking at a fixed 40 ms period
//! with zero initial delay. Every tick retransmits the entire pending
//! command set (unconditional resend, no backoff) and emits a heartbeat
//! stamped with the current time. The thread parks on a stop channel
//! between ticks, so cancellation interrupts the inter-tick sleep
//! immediately; an in-flight tick finishes on its own, but no further
//! ticks are scheduled.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use quanta::Instant;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::command::{Command, CommandKey, PendingCommandSet};
use crate::datagram::Datagram;
use crate::liveness::RecvTimestamp;
use crate::transport::Transport;

/// Fixed retransmission cadence.
pub const SEND_INTERVAL: Duration = Duration::from_millis(40);

// ─── Parameters & Client Callback ────────────────────────────────────────────

/// Per-connection tuning for the send cycle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SendParameters {
    /// Milliseconds without inbound traffic before the peer is presumed
    /// gone and the client callback is told so.
    pub assume_disconnect_after_ms: u64,
    /// Whether each tick emits a liveness heartbeat.
    pub heartbeats: bool,
}

impl SendParameters {
    pub fn disconnect_threshold(&self) -> Duration {
        Duration::from_millis(self.assume_disconnect_after_ms)
    }
}

impl Default for SendParameters {
    fn default() -> Self {
        SendParameters {
            assume_disconnect_after_ms: 2000,
            heartbeats: true,
        }
    }
}

/// Connection-state notifications for the component driving the session.
pub trait ClientCallback: Send + Sync {
    /// A peer (re)connected; `is_new` is false for a redundant announcement
    /// from the already-known address.
    fn peer_connected(&self, is_new: bool);

    /// Inbound traffic has gone stale past the disconnect threshold.
    fn peer_disconnected(&self) {}
}

// ─── Cycle ───────────────────────────────────────────────────────────────────

struct CycleShared {
    pending: Mutex<PendingCommandSet>,
    transport: Arc<dyn Transport>,
    last_recv: Arc<RecvTimestamp>,
    client: Option<Arc<dyn ClientCallback>>,
    params: SendParameters,
    done: AtomicBool,
}

impl CycleShared {
    fn pending(&self) -> MutexGuard<'_, PendingCommandSet> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to a running send cycle. Present on the session exactly while a
/// connection's periodic transmission is active.
pub struct SendCycle {
    shared: Arc<CycleShared>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl SendCycle {
    /// Start the cycle; the first tick runs immediately.
    pub fn spawn(
        client: Option<Arc<dyn ClientCallback>>,
        transport: Arc<dyn Transport>,
        last_recv: Arc<RecvTimestamp>,
        params: SendParameters,
    ) -> Self {
        let shared = Arc::new(CycleShared {
            pending: Mutex::new(PendingCommandSet::new()),
            transport,
            last_recv,
            client,
            params,
            done: AtomicBool::new(false),
        });
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("fieldlink-send".into())
            .spawn(move || {
                let mut peer_lost = false;
                let mut next = Instant::now();
                loop {
                    tick(&loop_shared, &mut peer_lost);
                    next = next + SEND_INTERVAL;
                    let now = Instant::now();
                    let wait = if next > now {
                        next - now
                    } else {
                        // A slow tick overran the period; realign instead of
                        // bursting to catch up.
                        next = now;
                        Duration::ZERO
                    };
                    match stop_rx.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
                loop_shared.done.store(true, Ordering::Release);
            })
            .expect("failed to spawn send cycle");

        SendCycle {
            shared,
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Add a command to the pending set; it is transmitted on every
    /// subsequent tick until acknowledged or withdrawn.
    pub fn send_command(&self, command: Command) {
        trace!(name = %command.name(), seq = command.sequence(), "queueing command");
        self.shared.pending().insert(command);
    }

    /// Withdraw a command; returns whether it was pending.
    pub fn remove_command(&self, key: &CommandKey) -> bool {
        self.shared.pending().remove(key)
    }

    /// Drop every pending command.
    pub fn clear_commands(&self) {
        self.shared.pending().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    /// The connection layer observed a peer announcement.
    pub fn on_peer_connected(&self, is_new: bool) {
        debug!(is_new, "send cycle notified of peer connection");
        self.shared.last_recv.reset();
    }

    /// Whether the cycle has stopped ticking (cancelled or exited).
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Request cancellation. Interrupts the inter-tick sleep; an in-flight
    /// tick is left to finish on its own (the thread is detached, never
    /// joined), so this cannot block indefinitely.
    pub fn cancel(&mut self) {
        let _ = self.stop_tx.try_send(());
        self.shared.done.store(true, Ordering::Release);
        drop(self.handle.take());
    }
}

impl Drop for SendCycle {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn tick(shared: &CycleShared, peer_lost: &mut bool) {
    let commands = shared.pending().snapshot();
    for command in commands {
        if let Err(e) = shared.transport.send(&Datagram::command(command)) {
            warn!(error = %e, "command retransmission failed");
        }
    }

    if shared.params.heartbeats {
        if let Err(e) = shared.transport.send(&Datagram::heartbeat()) {
            warn!(error = %e, "heartbeat failed");
        }
    }

    let stale = shared.last_recv.elapsed() > shared.params.disconnect_threshold();
    if stale && !*peer_lost {
        *peer_lost = true;
        debug!("no inbound traffic past threshold; presuming peer gone");
        if let Some(client) = &shared.client {
            client.peer_disconnected();
        }
    } else if !stale && *peer_lost {
        *peer_lost = false;
    }
}
