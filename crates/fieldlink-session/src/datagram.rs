//! In-memory datagram model.
//!
//! The session core never touches byte layout; encoding and decoding live
//! behind the [`WireCodec`](crate::udp::WireCodec) seam. What flows through
//! the core is this typed representation: a body tagged with its kind plus
//! the source address it arrived from (absent for locally built datagrams).

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::command::Command;

// ─── Body ────────────────────────────────────────────────────────────────────

/// The payload of a datagram, tagged by kind.
///
/// One variant per receive-event category the callback chain dispatches.
#[derive(Debug, Clone)]
pub enum DatagramBody {
    /// A peer announcing itself; payload semantics belong to the
    /// [`PeerDiscovery`](crate::discovery::PeerDiscovery) collaborator.
    PeerDiscovery(Bytes),
    /// Liveness signal carrying the sender's wall-clock timestamp.
    Heartbeat { timestamp_us: u64 },
    /// An application command (at-least-once delivery).
    Command(Command),
    /// Free-form telemetry from the station.
    Telemetry(Bytes),
    /// Gamepad input from the controller.
    Gamepad(Bytes),
    /// A datagram with no payload.
    Empty,
}

// ─── Datagram ────────────────────────────────────────────────────────────────

/// A single unit of transfer between controller and station.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub body: DatagramBody,
    /// Where the datagram came from; `None` for locally constructed ones.
    pub source: Option<SocketAddr>,
}

impl Datagram {
    /// A locally constructed datagram with no source address.
    pub fn new(body: DatagramBody) -> Self {
        Datagram { body, source: None }
    }

    /// A datagram as received from the wire.
    pub fn received(body: DatagramBody, source: SocketAddr) -> Self {
        Datagram {
            body,
            source: Some(source),
        }
    }

    /// A heartbeat stamped with the current wall-clock time.
    pub fn heartbeat() -> Self {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Datagram::new(DatagramBody::Heartbeat { timestamp_us })
    }

    /// Wrap a command for transmission.
    pub fn command(command: Command) -> Self {
        Datagram::new(DatagramBody::Command(command))
    }

    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    /// Kind tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self.body {
            DatagramBody::PeerDiscovery(_) => "peer-discovery",
            DatagramBody::Heartbeat { .. } => "heartbeat",
            DatagramBody::Command(_) => "command",
            DatagramBody::Telemetry(_) => "telemetry",
            DatagramBody::Gamepad(_) => "gamepad",
            DatagramBody::Empty => "empty",
        }
    }
}
