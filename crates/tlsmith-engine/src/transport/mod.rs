//! Byte transports under the bottom layer.
//!
//! A [`Transport`] moves opaque byte chunks. Receiving is the engine's only
//! blocking point and is always bounded by a timeout.

mod memory;
mod tcp;
mod udp;

use std::fmt;
use std::time::Duration;

use tlsmith_types::EngineError;

use crate::state::ConnectionState;
use crate::unit::{Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitFamily, UnitKind, UnitRegistry};

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Result of one bounded receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data(Vec<u8>),
    Timeout,
    /// The peer closed the connection (or the transport was closed locally).
    Closed,
}

/// A connected byte transport.
pub trait Transport: Send + fmt::Debug {
    fn send(&mut self, data: &[u8]) -> Result<(), EngineError>;

    /// Wait at most `timeout` for the next chunk.
    fn receive(&mut self, timeout: Duration) -> Result<Received, EngineError>;

    /// Release the underlying handle. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Whether chunk boundaries are meaningful (UDP, in-memory datagrams).
    fn is_datagram(&self) -> bool;
}

/// Raw bytes written to or read from the transport.
#[derive(Debug, Clone, Default)]
pub struct TransportChunk {
    pub data: Field<Vec<u8>>,
}

impl TransportChunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Field::with_value(data),
        }
    }
}

impl RegisteredUnit for TransportChunk {
    const KIND: UnitKind = UnitKind::new(UnitFamily::Transport, 0);
    const NAME: &'static str = "TransportChunk";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        Ok(Self::new(r.read_rest().to_vec()))
    }
}

impl ProtocolUnit for TransportChunk {
    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        self.data.fill(Vec::new);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.data.require("TransportChunk", "data")
    }

    fn apply(&self, _state: &mut ConnectionState, _origin: Origin) -> Result<(), EngineError> {
        Ok(())
    }

    unit_boilerplate!(registered);
}

pub(crate) fn register(registry: &mut UnitRegistry) {
    registry.register(TransportChunk::registration());
}

fn closed_error() -> EngineError {
    EngineError::TransportFailure("transport already closed".into())
}
