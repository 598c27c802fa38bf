//! UDP-backed [`Transport`] implementation.
//!
//! Byte layout stays out of the core: the socket delegates encode/decode to
//! an injected [`WireCodec`]. The receive side uses a short read timeout so
//! the pump thread can poll its shutdown flag between datagrams.

use bytes::Bytes;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::datagram::Datagram;
use crate::error::ProtocolError;
use crate::transport::{Transport, TransportFactory};

/// Poll interval for the blocking receive path.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest datagram we accept off the wire.
const MAX_DATAGRAM: usize = 4096;

/// Serialization seam between [`Datagram`]s and wire bytes.
pub trait WireCodec: Send + Sync {
    fn encode(&self, datagram: &Datagram) -> Bytes;
    fn decode(&self, bytes: &[u8], source: SocketAddr) -> Result<Datagram, ProtocolError>;
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// A [`Transport`] over a bound `UdpSocket`.
pub struct UdpTransport {
    socket: UdpSocket,
    codec: Arc<dyn WireCodec>,
    peer: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket, codec: Arc<dyn WireCodec>) -> io::Result<Self> {
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(UdpTransport {
            socket,
            codec,
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl Transport for UdpTransport {
    fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        self.socket.connect(addr)?;
        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        Ok(())
    }

    fn send(&self, datagram: &Datagram) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let bytes = self.codec.encode(datagram);
        self.socket.send(&bytes).map(|_| ())
    }

    fn recv(&self) -> io::Result<Option<Datagram>> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut buf = [0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((len, source)) => match self.codec.decode(&buf[..len], source) {
                Ok(datagram) => Ok(Some(datagram)),
                Err(e) => {
                    warn!(%source, error = %e, "dropping undecodable datagram");
                    Ok(None)
                }
            },
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Binds a fresh UDP socket per connection lifecycle.
pub struct UdpTransportFactory {
    bind_addr: SocketAddr,
    codec: Arc<dyn WireCodec>,
}

impl UdpTransportFactory {
    pub fn new(bind_addr: SocketAddr, codec: Arc<dyn WireCodec>) -> Self {
        UdpTransportFactory { bind_addr, codec }
    }
}

impl TransportFactory for UdpTransportFactory {
    fn open(&self, _station: SocketAddr) -> io::Result<Arc<dyn Transport>> {
        let socket = UdpSocket::bind(self.bind_addr)?;
        Ok(Arc::new(UdpTransport::new(socket, self.codec.clone())?))
    }
}
