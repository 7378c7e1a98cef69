//! The datagram transport under a connector.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// A bound datagram socket.
///
/// Sends may happen from several threads at once.
pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Bound the time `recv_from` blocks, so receivers can notice a stop.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, datagram, peer)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, timeout)
    }
}

/// Whether a receive error only means the read timeout passed.
pub(crate) fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
