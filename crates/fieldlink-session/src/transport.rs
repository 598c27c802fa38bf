//! Transport boundary.
//!
//! The session core never binds sockets or touches byte layout; it drives a
//! [`Transport`] it was handed (`connect` toward the active peer, `send`
//! datagrams, `close` on teardown) and assumes best-effort, unordered,
//! lossy delivery underneath. The setup task creates the transport through
//! a [`TransportFactory`], which is the seam tests and alternative
//! backends plug into.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::datagram::Datagram;

/// A connected datagram transport.
///
/// All methods take `&self`: implementations are internally synchronized
/// and shared across the setup, receive, and send-cycle threads.
pub trait Transport: Send + Sync {
    /// Target all subsequent sends at `addr`. Must be fast and local
    /// (address binding only); failures surface synchronously.
    fn connect(&self, addr: SocketAddr) -> io::Result<()>;

    /// Best-effort transmission of one datagram.
    fn send(&self, datagram: &Datagram) -> io::Result<()>;

    /// Block for the next inbound datagram, or `Ok(None)` on a short
    /// internal timeout so callers can poll their shutdown flag.
    fn recv(&self) -> io::Result<Option<Datagram>>;

    /// The currently targeted peer, if any.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Release the underlying resource. Idempotent; subsequent sends and
    /// receives become no-ops.
    fn close(&self);
}

/// Creates the transport for a connection lifecycle.
pub trait TransportFactory: Send + Sync {
    /// Open a transport prepared to exchange datagrams with `station`.
    fn open(&self, station: SocketAddr) -> io::Result<Arc<dyn Transport>>;
}
