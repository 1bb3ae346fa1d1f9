//! Host-side transport carrying one protocol packet per UDP datagram.

use crate::error::{Convertible, Error};
use crate::hal::transport::TransportDriver;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpTransportError {
    Bind,
    NoPeer,
    Send,
    Receive,
}

impl Convertible for UdpTransportError {
    fn into(self) -> Error {
        Error::Transport(match self {
            UdpTransportError::Bind => "udp bind failed",
            UdpTransportError::NoPeer => "no udp peer known yet",
            UdpTransportError::Send => "udp send failed",
            UdpTransportError::Receive => "udp receive failed",
        })
    }
}

/// Datagram transport. The tool role connects to a known device
/// address; the listener role learns its peer from the first datagram
/// that arrives, the way the original update server did.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    /// Tool role: bound locally, talking to a known device address.
    pub fn connect<A: ToSocketAddrs>(local: A, peer: A) -> Result<Self, UdpTransportError> {
        let socket = UdpSocket::bind(local).map_err(|_| UdpTransportError::Bind)?;
        let peer = peer
            .to_socket_addrs()
            .map_err(|_| UdpTransportError::Bind)?
            .next()
            .ok_or(UdpTransportError::Bind)?;
        Ok(UdpTransport { socket, peer: Some(peer) })
    }

    /// Listener role: the peer is whoever sends the first request.
    pub fn listen<A: ToSocketAddrs>(local: A) -> Result<Self, UdpTransportError> {
        let socket = UdpSocket::bind(local).map_err(|_| UdpTransportError::Bind)?;
        Ok(UdpTransport { socket, peer: None })
    }
}

impl TransportDriver for UdpTransport {
    type Error = UdpTransportError;

    fn init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        let peer = self.peer.ok_or(UdpTransportError::NoPeer)?;
        self.socket.send_to(bytes, peer).map_err(|_| UdpTransportError::Send)
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        let (length, from) =
            self.socket.recv_from(buffer).map_err(|_| UdpTransportError::Receive)?;
        self.peer = Some(from);
        Ok(length)
    }

    fn close(&mut self) {}
}
