//! UDP transport. Each datagram is one chunk.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tlsmith_types::EngineError;
use tracing::debug;

use super::{closed_error, Received, Transport};

const MAX_DATAGRAM: usize = 65_535;

/// A UDP socket talking to one peer. A server-side transport learns its peer
/// from the first datagram it receives.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    /// Bind an ephemeral local port and send to `peer`.
    pub fn connect(peer: SocketAddr) -> Result<Self, EngineError> {
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        Ok(Self {
            socket: Some(socket),
            peer: Some(peer),
        })
    }

    /// Bind `addr` and wait for a peer.
    pub fn bind(addr: SocketAddr) -> Result<Self, EngineError> {
        Ok(Self {
            socket: Some(UdpSocket::bind(addr)?),
            peer: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EngineError> {
        let socket = self.socket.as_ref().ok_or_else(closed_error)?;
        Ok(socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let socket = self.socket.as_ref().ok_or_else(closed_error)?;
        let peer = self
            .peer
            .ok_or_else(|| EngineError::TransportFailure("udp peer unknown".into()))?;
        socket.send_to(data, peer)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received, EngineError> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(Received::Closed);
        };
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    match self.peer {
                        None => {
                            debug!(%from, "udp peer learned");
                            self.peer = Some(from);
                        }
                        Some(peer) if peer != from => {
                            debug!(%from, "dropping datagram from unexpected peer");
                            continue;
                        }
                        Some(_) => {}
                    }
                    buf.truncate(n);
                    return Ok(Received::Data(buf));
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(Received::Timeout)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("udp transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    fn is_datagram(&self) -> bool {
        true
    }
}
