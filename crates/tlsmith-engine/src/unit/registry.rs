//! Kind → capability registry.
//!
//! Adding a unit kind means calling [`UnitRegistry::register`] with its
//! decoder and constructor; nothing else in the engine changes.

use std::collections::HashMap;
use std::fmt;

use tlsmith_types::EngineError;
use tracing::debug;

use super::{OpaqueUnit, ProtocolUnit, Reader, UnitKind};
use crate::state::ConnectionState;

/// Decode one unit from a cursor positioned at its first byte.
pub type DecodeFn =
    fn(&mut Reader<'_>, &ConnectionState) -> Result<Box<dyn ProtocolUnit>, EngineError>;

/// Build an empty unit whose fields are all left to compute-defaults.
pub type CreateFn = fn() -> Box<dyn ProtocolUnit>;

/// Capabilities registered for one kind.
#[derive(Clone, Copy)]
pub struct Registration {
    pub kind: UnitKind,
    pub name: &'static str,
    pub decode: DecodeFn,
    pub create: CreateFn,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

/// Registry of unit kinds.
#[derive(Debug, Clone, Default)]
pub struct UnitRegistry {
    entries: HashMap<UnitKind, Registration>,
}

impl UnitRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// A registry with every unit kind shipped by this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::transport::register(&mut registry);
        crate::record::register(&mut registry);
        crate::fragment::dtls::register(&mut registry);
        crate::handshake::register(&mut registry);
        crate::extensions::register(&mut registry);
        crate::alert::register(&mut registry);
        crate::message::register(&mut registry);
        crate::http::register(&mut registry);
        crate::quic::register(&mut registry);
        registry
    }

    /// Register (or replace) the capabilities of one kind.
    pub fn register(&mut self, registration: Registration) -> Option<Registration> {
        self.entries.insert(registration.kind, registration)
    }

    pub fn get(&self, kind: UnitKind) -> Option<&Registration> {
        self.entries.get(&kind)
    }

    pub fn contains(&self, kind: UnitKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Human readable name of a kind.
    pub fn name(&self, kind: UnitKind) -> &'static str {
        if kind.is_opaque() {
            return "Opaque";
        }
        self.entries.get(&kind).map_or("Unregistered", |r| r.name)
    }

    /// All registered kinds, sorted.
    pub fn kinds(&self) -> Vec<UnitKind> {
        let mut kinds: Vec<UnitKind> = self.entries.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// A fresh unit of `kind` with every field left to compute-defaults.
    pub fn create(&self, kind: UnitKind) -> Result<Box<dyn ProtocolUnit>, EngineError> {
        self.entries
            .get(&kind)
            .map(|r| (r.create)())
            .ok_or_else(|| EngineError::UnknownKind(kind.to_string()))
    }

    /// Decode `data` as exactly one unit of `kind`. Bytes left over after
    /// the decoder returns are reported as malformed. Kinds whose layout
    /// depends on the carrying unit (extensions) infer it from the bytes;
    /// [`UnitRegistry::decode_nested`] fixes it instead.
    pub fn decode(
        &self,
        kind: UnitKind,
        data: &[u8],
        state: &ConnectionState,
    ) -> Result<Box<dyn ProtocolUnit>, EngineError> {
        self.decode_exact(kind, Reader::new(self.name(kind), data), state)
    }

    /// [`UnitRegistry::decode`] for a unit nested inside a unit of kind
    /// `parent`.
    pub fn decode_nested(
        &self,
        kind: UnitKind,
        data: &[u8],
        parent: UnitKind,
        state: &ConnectionState,
    ) -> Result<Box<dyn ProtocolUnit>, EngineError> {
        let reader = Reader::new(self.name(kind), data).with_parent(parent);
        self.decode_exact(kind, reader, state)
    }

    /// Decode one unit of `kind` at the cursor, leaving any later bytes
    /// unread. Used for self-delimiting units packed back to back.
    pub fn decode_from(
        &self,
        kind: UnitKind,
        reader: &mut Reader<'_>,
        state: &ConnectionState,
    ) -> Result<Box<dyn ProtocolUnit>, EngineError> {
        let registration = self
            .entries
            .get(&kind)
            .ok_or_else(|| EngineError::UnknownKind(kind.to_string()))?;
        let outer = reader.unit();
        reader.set_unit(registration.name);
        let result = (registration.decode)(reader, state);
        reader.set_unit(outer);
        result
    }

    fn decode_exact(
        &self,
        kind: UnitKind,
        mut reader: Reader<'_>,
        state: &ConnectionState,
    ) -> Result<Box<dyn ProtocolUnit>, EngineError> {
        let unit = self.decode_from(kind, &mut reader, state)?;
        reader.expect_end()?;
        Ok(unit)
    }

    /// Like [`UnitRegistry::decode`], but any failure yields an
    /// [`OpaqueUnit`] carrying the raw bytes and the reason.
    pub fn decode_or_opaque(
        &self,
        kind: UnitKind,
        data: &[u8],
        state: &ConnectionState,
    ) -> Box<dyn ProtocolUnit> {
        match self.decode(kind, data, state) {
            Ok(unit) => unit,
            Err(err) => {
                debug!(%kind, error = %err, len = data.len(), "undecodable unit kept as opaque");
                Box::new(OpaqueUnit::undecodable(kind, data.to_vec(), &err))
            }
        }
    }
}
