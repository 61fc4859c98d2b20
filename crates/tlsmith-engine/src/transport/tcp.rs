//! TCP transport.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tlsmith_types::EngineError;
use tracing::debug;

use super::{closed_error, Received, Transport};

const READ_CHUNK: usize = 16 * 1024;

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, EngineError> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| EngineError::TransportFailure(format!("connect {addr}: {e}")))?;
        Self::from_stream(stream)
    }

    /// Accept one connection from `listener`.
    pub fn accept(listener: &TcpListener) -> Result<Self, EngineError> {
        let (stream, _) = listener.accept()?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, EngineError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!(%peer, "tcp transport connected");
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received, EngineError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Received::Closed);
        };
        // A zero read timeout means "block forever" to the OS.
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = vec![0u8; READ_CHUNK];
        match stream.read(&mut buf) {
            Ok(0) => Ok(Received::Closed),
            Ok(n) => {
                buf.truncate(n);
                Ok(Received::Data(buf))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(Received::Timeout)
            }
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) => {
                Ok(Received::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(peer = %self.peer, "tcp transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn is_datagram(&self) -> bool {
        false
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
