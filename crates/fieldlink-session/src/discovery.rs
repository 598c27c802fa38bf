//! Peer discovery collaborator and announcer.
//!
//! The payload semantics (what an announcement contains, which protocol
//! revisions are acceptable) live behind the [`PeerDiscovery`] trait. The
//! core only knows that parsing can fail ([`ProtocolError`]) and that a
//! successful parse makes the datagram's source address the new peer.
//!
//! The [`DiscoveryAnnouncer`] is the outbound half: a small periodic task,
//! started by the setup routine, that transmits our own announcement once
//! per second so the other side can find us.

use bytes::Bytes;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::datagram::{Datagram, DatagramBody};
use crate::error::ProtocolError;
use crate::transport::Transport;

/// How often we announce ourselves.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

// ─── Collaborator Trait ──────────────────────────────────────────────────────

/// What a successfully parsed announcement tells us about the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAnnouncement {
    /// Protocol revision the peer speaks.
    pub version: u8,
    pub role: PeerRole,
}

/// Which side of the link the peer claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Controller,
    Station,
}

/// Parses inbound announcements and produces our outbound one.
pub trait PeerDiscovery: Send + Sync {
    /// Validate an announcement payload. Failure is fatal to the current
    /// connection attempt and is never retried by the core.
    fn parse(&self, payload: &[u8]) -> Result<PeerAnnouncement, ProtocolError>;

    /// The payload this end announces itself with.
    fn announcement(&self) -> Bytes;
}

// ─── Announcer ───────────────────────────────────────────────────────────────

/// Periodic task transmitting our discovery payload.
pub struct DiscoveryAnnouncer {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl DiscoveryAnnouncer {
    pub fn spawn(transport: Arc<dyn Transport>, discovery: Arc<dyn PeerDiscovery>) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("fieldlink-announce".into())
            .spawn(move || loop {
                let payload = discovery.announcement();
                let datagram = Datagram::new(DatagramBody::PeerDiscovery(payload));
                if let Err(e) = transport.send(&datagram) {
                    warn!(error = %e, "discovery announcement failed");
                }
                match stop_rx.recv_timeout(ANNOUNCE_INTERVAL) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            })
            .expect("failed to spawn discovery announcer");
        DiscoveryAnnouncer {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop announcing. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!("discovery announcer stopped");
        }
    }
}

impl Drop for DiscoveryAnnouncer {
    fn drop(&mut self) {
        self.stop();
    }
}
