//! Error taxonomy for the session core.
//!
//! Two kinds of failure surface to callers: a discovery payload that cannot
//! be understood (protocol error, fatal to the current connection attempt)
//! and a transport that refuses to target the new peer (connect error,
//! chained with the failing address). Everything else, such as a missing
//! setup task or an unhandled command, is logged and absorbed, never an
//! error.

use std::net::SocketAddr;
use thiserror::Error;

/// A peer-discovery payload that could not be accepted.
///
/// Produced by [`PeerDiscovery::parse`](crate::discovery::PeerDiscovery::parse)
/// implementations; the core never retries a failed parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload too short to carry an announcement.
    #[error("discovery payload truncated ({0} bytes)")]
    Truncated(usize),
    /// The peer speaks a protocol revision we do not.
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },
    /// The datagram offered as an announcement was not a discovery datagram.
    #[error("expected a peer-discovery datagram, got {0}")]
    UnexpectedKind(&'static str),
    /// Anything else an implementation wants to reject.
    #[error("malformed discovery payload: {0}")]
    Malformed(String),
}

/// Errors surfaced by [`ConnectionSession`](crate::session::ConnectionSession)
/// operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The inbound datagram failed peer-discovery parsing. The session keeps
    /// its prior peer, transport, and send-cycle state.
    #[error("peer discovery rejected")]
    Protocol(#[from] ProtocolError),

    /// The transport could not be targeted at the newly discovered peer.
    #[error("unable to connect to {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
