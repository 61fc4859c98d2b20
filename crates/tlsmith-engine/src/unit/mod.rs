//! Protocol units and their capability set.
//!
//! A protocol unit is one message, frame, record or header. Each concrete
//! type implements [`ProtocolUnit`] (compute-defaults, encode, apply-to-state)
//! and registers a decoder in the [`UnitRegistry`]; dispatch is always by
//! [`UnitKind`], never by a central type switch.

pub mod codec;
pub mod field;
pub mod opaque;
pub mod registry;

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use tlsmith_types::EngineError;

use crate::state::ConnectionState;

pub use codec::Reader;
pub use field::{Field, FieldValue, Override};
pub use opaque::OpaqueUnit;
pub use registry::{CreateFn, DecodeFn, Registration, UnitRegistry};

/// Unit families. Each layer owns exactly one family; extensions live inside
/// handshake messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnitFamily {
    Transport,
    Record,
    DtlsFragment,
    Handshake,
    Extension,
    Alert,
    ChangeCipherSpec,
    ApplicationData,
    Http,
    QuicFrame,
}

/// Runtime kind tag of a unit: a family plus a family-specific code
/// (handshake type, extension type, frame type, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKind {
    pub family: UnitFamily,
    pub code: u16,
}

impl UnitKind {
    /// Code reserved for bytes that could not be decoded as any unit.
    pub const OPAQUE_CODE: u16 = 0xFFFF;

    pub const fn new(family: UnitFamily, code: u16) -> Self {
        Self { family, code }
    }

    pub const fn opaque(family: UnitFamily) -> Self {
        Self {
            family,
            code: Self::OPAQUE_CODE,
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.code == Self::OPAQUE_CODE
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_opaque() {
            write!(f, "{:?}/opaque", self.family)
        } else {
            write!(f, "{:?}/{}", self.family, self.code)
        }
    }
}

/// Direction in which a unit was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Built locally and written to the wire. Apply only updates local
    /// bookkeeping; nothing is recorded as negotiated.
    Sent,
    /// Decoded from peer bytes; authoritative for negotiated values.
    Received,
}

/// The capability set shared by every unit kind.
pub trait ProtocolUnit: fmt::Debug + Send + Sync {
    fn kind(&self) -> UnitKind;

    fn name(&self) -> &'static str;

    /// Fill every field that lacks an explicit override from connection
    /// state. Must be idempotent and must not mutate state.
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError>;

    /// Serialize the current field values. Never recomputes defaults.
    fn encode(&self) -> Result<Vec<u8>, EngineError>;

    /// Write the unit's effects into connection state. Effects applied before
    /// a failure stay applied.
    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError>;

    fn clone_unit(&self) -> Box<dyn ProtocolUnit>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn ProtocolUnit> {
    fn clone(&self) -> Self {
        self.clone_unit()
    }
}

impl dyn ProtocolUnit {
    pub fn downcast_ref<T: ProtocolUnit + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: ProtocolUnit + 'static>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    pub fn is<T: ProtocolUnit + 'static>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// A unit type with a fixed kind, registrable as-is.
pub trait RegisteredUnit: ProtocolUnit + Default + Clone + Sized + 'static {
    const KIND: UnitKind;
    const NAME: &'static str;

    /// Decode one unit at the cursor.
    fn decode(reader: &mut Reader<'_>, state: &ConnectionState) -> Result<Self, EngineError>;

    fn registration() -> Registration {
        Registration {
            kind: Self::KIND,
            name: Self::NAME,
            decode: decode_boxed::<Self>,
            create: create_boxed::<Self>,
        }
    }
}

fn decode_boxed<T: RegisteredUnit>(
    reader: &mut Reader<'_>,
    state: &ConnectionState,
) -> Result<Box<dyn ProtocolUnit>, EngineError> {
    Ok(Box::new(T::decode(reader, state)?))
}

fn create_boxed<T: RegisteredUnit>() -> Box<dyn ProtocolUnit> {
    Box::new(T::default())
}

/// Kinds of a unit list, in order.
pub fn kinds_of(units: &[Box<dyn ProtocolUnit>]) -> Vec<UnitKind> {
    units.iter().map(|u| u.kind()).collect()
}

/// Length as a u8 wire value; oversized values wrap, which is what an
/// adversarial encoder wants.
pub(crate) fn len_u8(len: usize) -> u8 {
    len as u8
}

pub(crate) fn len_u16(len: usize) -> u16 {
    len as u16
}

pub(crate) fn len_u24(len: usize) -> u32 {
    (len as u32) & 0x00FF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display_and_opaque() {
        let k = UnitKind::new(UnitFamily::Handshake, 1);
        assert_eq!(k.to_string(), "Handshake/1");
        assert!(!k.is_opaque());
        let o = UnitKind::opaque(UnitFamily::Record);
        assert!(o.is_opaque());
        assert_eq!(o.to_string(), "Record/opaque");
    }

    #[test]
    fn test_length_helpers_wrap() {
        assert_eq!(len_u8(256), 0);
        assert_eq!(len_u16(70_000), 4464);
        assert_eq!(len_u24(0x0100_0001), 1);
    }
}
