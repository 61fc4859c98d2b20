//! Bytes that could not be decoded as any registered unit.

use tlsmith_types::EngineError;

use super::{Field, Origin, ProtocolUnit, UnitFamily, UnitKind};
use crate::state::ConnectionState;

/// Undecodable or unregistered bytes, kept verbatim.
///
/// Its kind is the family's opaque kind, so it never matches a planned kind.
/// It can also be sent to inject raw bytes at any layer.
#[derive(Debug, Clone)]
pub struct OpaqueUnit {
    pub family: UnitFamily,
    /// The kind the bytes claimed to be, if any.
    pub claimed: Option<UnitKind>,
    pub bytes: Field<Vec<u8>>,
    /// Why decoding failed.
    pub error: Option<String>,
}

impl OpaqueUnit {
    pub fn new(family: UnitFamily, bytes: Vec<u8>) -> Self {
        Self {
            family,
            claimed: None,
            bytes: Field::with_value(bytes),
            error: None,
        }
    }

    pub fn undecodable(claimed: UnitKind, bytes: Vec<u8>, error: &EngineError) -> Self {
        Self {
            family: claimed.family,
            claimed: Some(claimed),
            bytes: Field::with_value(bytes),
            error: Some(error.to_string()),
        }
    }
}

impl ProtocolUnit for OpaqueUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::opaque(self.family)
    }

    fn name(&self) -> &'static str {
        "Opaque"
    }

    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        self.bytes.fill(Vec::new);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.bytes.require("Opaque", "bytes")
    }

    fn apply(&self, _state: &mut ConnectionState, _origin: Origin) -> Result<(), EngineError> {
        Ok(())
    }

    unit_boilerplate!();
}
