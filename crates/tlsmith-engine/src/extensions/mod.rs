//! Hello extensions (RFC 8446 Section 4.2).
//!
//! Every extension is a unit of family [`UnitFamily::Extension`] whose code
//! is the extension type. Types without a dedicated unit decode as
//! [`GenericExtension`]. Several extensions have a different body depending
//! on the message carrying them; decoders learn the carrier from
//! [`Reader::parent`]. Decoded without a carrier, their form is inferred
//! from the body.

mod alpn;
mod cookie;
mod generic;
mod key_share;
mod lists;
mod server_name;
mod supported_versions;

use tlsmith_types::EngineError;
use tracing::debug;

use crate::handshake::HandshakeType;
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{
    len_u16, Field, OpaqueUnit, Origin, ProtocolUnit, Reader, UnitFamily, UnitKind, UnitRegistry,
};

pub use alpn::Alpn;
pub use cookie::Cookie;
pub use generic::GenericExtension;
pub use key_share::{KeyShare, KeyShareEntry, KeyShareForm};
pub use lists::{SignatureAlgorithms, SupportedGroups};
pub use server_name::ServerName;
pub use supported_versions::{SupportedVersions, VersionsForm};

/// TLS extension type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionType(pub u16);

impl ExtensionType {
    pub const SERVER_NAME: Self = Self(0);
    pub const MAX_FRAGMENT_LENGTH: Self = Self(1);
    pub const STATUS_REQUEST: Self = Self(5);
    pub const SUPPORTED_GROUPS: Self = Self(10);
    pub const EC_POINT_FORMATS: Self = Self(11);
    pub const SIGNATURE_ALGORITHMS: Self = Self(13);
    pub const HEARTBEAT: Self = Self(15);
    pub const APPLICATION_LAYER_PROTOCOL_NEGOTIATION: Self = Self(16);
    pub const PADDING: Self = Self(21);
    pub const ENCRYPT_THEN_MAC: Self = Self(22);
    pub const EXTENDED_MASTER_SECRET: Self = Self(23);
    pub const SESSION_TICKET: Self = Self(35);
    pub const PRE_SHARED_KEY: Self = Self(41);
    pub const EARLY_DATA: Self = Self(42);
    pub const SUPPORTED_VERSIONS: Self = Self(43);
    pub const COOKIE: Self = Self(44);
    pub const PSK_KEY_EXCHANGE_MODES: Self = Self(45);
    pub const KEY_SHARE: Self = Self(51);
    pub const RENEGOTIATION_INFO: Self = Self(0xFF01);

    pub const fn kind(self) -> UnitKind {
        UnitKind::new(UnitFamily::Extension, self.0)
    }
}

/// Message an extension is carried in, as far as its body layout cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloContext {
    ClientHello,
    ServerHello,
    EncryptedExtensions,
    /// No carrier, or one that does not fix the form.
    Other,
}

impl HelloContext {
    /// Context of a nested decode.
    pub fn of(reader: &Reader<'_>) -> Self {
        match reader.parent() {
            None => Self::Other,
            Some(kind) if kind.family != UnitFamily::Handshake => Self::Other,
            Some(kind) => match HandshakeType(kind.code as u8) {
                HandshakeType::CLIENT_HELLO => Self::ClientHello,
                HandshakeType::SERVER_HELLO => Self::ServerHello,
                HandshakeType::ENCRYPTED_EXTENSIONS => Self::EncryptedExtensions,
                _ => Self::Other,
            },
        }
    }
}

/// The type and length prefix shared by every extension.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHeader {
    pub extension_type: Field<u16>,
    pub extension_length: Field<u16>,
}

impl ExtensionHeader {
    /// Read the prefix and return a reader over exactly the body.
    pub fn read<'a>(r: &mut Reader<'a>) -> Result<(Self, Reader<'a>), EngineError> {
        let extension_type = r.read_u16("extension_type")?;
        let extension_length = r.read_u16("extension_length")?;
        let body = r.sub_reader(extension_length as usize, "extension_data")?;
        Ok((
            Self {
                extension_type: Field::with_value(extension_type),
                extension_length: Field::with_value(extension_length),
            },
            body,
        ))
    }

    pub fn compute(&mut self, extension_type: ExtensionType, body_len: usize) {
        self.extension_type.compute(|| extension_type.0);
        self.extension_length.compute(|| len_u16(body_len));
    }

    pub fn write(&self, unit: &'static str, body: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::with_capacity(4 + body.len());
        put_u16(&mut out, self.extension_type.require(unit, "extension_type")?);
        put_u16(&mut out, self.extension_length.require(unit, "extension_length")?);
        out.extend_from_slice(body);
        Ok(out)
    }
}

/// Decode the extension block of a hello-style message: a u16 total length
/// followed by extensions. Returns the declared length and the units.
///
/// An extension whose body fails to parse is kept as an opaque unit so the
/// rest of the message still decodes.
pub fn decode_list(
    r: &mut Reader<'_>,
    parent: UnitKind,
    state: &ConnectionState,
) -> Result<(u16, Vec<Box<dyn ProtocolUnit>>), EngineError> {
    let total = r.read_u16("extensions_length")?;
    let mut list = r.sub_reader(total as usize, "extensions")?;
    let bytes = list.data();
    let registry = state.registry();
    let mut units: Vec<Box<dyn ProtocolUnit>> = Vec::new();
    while !list.is_empty() {
        let start = list.position();
        let extension_type = list.read_u16("extension_type")?;
        let body_len = list.read_u16("extension_length")?;
        list.read_bytes(body_len as usize, "extension_data")?;
        let raw = &bytes[start..list.position()];

        let kind = ExtensionType(extension_type).kind();
        if !registry.contains(kind) {
            let mut reader = Reader::new(GenericExtension::NAME, raw);
            units.push(Box::new(GenericExtension::decode(&mut reader)?));
            continue;
        }
        match registry.decode_nested(kind, raw, parent, state) {
            Ok(unit) => units.push(unit),
            Err(err) => {
                debug!(%kind, error = %err, "extension kept as opaque");
                units.push(Box::new(OpaqueUnit::undecodable(kind, raw.to_vec(), &err)));
            }
        }
    }
    Ok((total, units))
}

/// Concatenated encodings of `units`.
pub fn encode_list(units: &[Box<dyn ProtocolUnit>]) -> Result<Vec<u8>, EngineError> {
    let mut out = Vec::new();
    for unit in units {
        out.extend_from_slice(&unit.encode()?);
    }
    Ok(out)
}

/// Compute every extension and return the encoded block length.
pub fn compute_list(
    units: &mut [Box<dyn ProtocolUnit>],
    state: &ConnectionState,
) -> Result<usize, EngineError> {
    let mut len = 0;
    for unit in units.iter_mut() {
        unit.compute_defaults(state)?;
        len += unit.encode()?.len();
    }
    Ok(len)
}

/// Apply every extension. All extensions are attempted; the first failure is
/// returned after the rest have been applied. Received extension types are
/// recorded in order.
pub fn apply_list(
    units: &[Box<dyn ProtocolUnit>],
    state: &mut ConnectionState,
    origin: Origin,
) -> Result<(), EngineError> {
    if origin == Origin::Received {
        let types: Vec<u16> = units
            .iter()
            .map(|u| u.kind())
            .filter(|k| !k.is_opaque())
            .map(|k| k.code)
            .collect();
        state.record_negotiated("peer_extensions", |n| n.peer_extensions = types);
    }
    let mut first_error = None;
    for unit in units {
        if let Err(err) = unit.apply(state, origin) {
            debug!(unit = unit.name(), error = %err, "extension apply failed");
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Find the first extension of a given type.
pub fn find<T: ProtocolUnit + 'static>(units: &[Box<dyn ProtocolUnit>]) -> Option<&T> {
    units.iter().find_map(|u| u.downcast_ref::<T>())
}

pub(crate) fn register(registry: &mut UnitRegistry) {
    use crate::unit::RegisteredUnit;
    registry.register(ServerName::registration());
    registry.register(SupportedGroups::registration());
    registry.register(SignatureAlgorithms::registration());
    registry.register(Alpn::registration());
    registry.register(SupportedVersions::registration());
    registry.register(Cookie::registration());
    registry.register(KeyShare::registration());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::handshake::HandshakeType;

    fn hex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_decode_list_mixes_known_generic_and_opaque() {
        let state = ConnectionState::new(EngineConfig::default());
        // supported_groups [x25519], unknown type 0x1234, supported_groups with bad length
        let data = hex("0014000a00040002001d12340002abcd000a0002ffff");
        let parent = HandshakeType::CLIENT_HELLO.kind();
        let mut r = Reader::new("ClientHello", &data);
        let (total, units) = decode_list(&mut r, parent, &state).unwrap();
        assert_eq!(total, 0x14);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].kind(), ExtensionType::SUPPORTED_GROUPS.kind());
        assert_eq!(units[1].kind(), ExtensionType(0x1234).kind());
        assert!(units[1].is::<GenericExtension>());
        assert!(units[2].kind().is_opaque());
        assert_eq!(encode_list(&units).unwrap(), data[2..]);
    }

    #[test]
    fn test_trailing_body_bytes_are_kept_as_opaque() {
        let state = ConnectionState::new(EngineConfig::default());
        let client_hello = HandshakeType::CLIENT_HELLO.kind();
        let server_hello = HandshakeType::SERVER_HELLO.kind();
        let cases = [
            ("000a00060002001ddead", client_hello),
            ("000d000600020804dead", client_hello),
            ("001000070003026832dead", client_hello),
            ("002c00050001aadead", client_hello),
            ("0000000b0007000004612e696fdead", client_hello),
            ("002b0005020304dead", client_hello),
            ("002b00040304dead", server_hello),
            ("003300090005001d0001aadead", client_hello),
            ("00330007001d0001aadead", server_hello),
        ];
        for (ext, parent) in cases {
            let ext = hex(ext);
            let kind = ExtensionType(u16::from_be_bytes([ext[0], ext[1]])).kind();
            let err = state
                .registry()
                .decode_nested(kind, &ext, parent, &state)
                .unwrap_err();
            assert!(
                matches!(err, EngineError::MalformedUnit { field: "trailing data", .. }),
                "{kind}: {err:?}"
            );

            let mut block = (ext.len() as u16).to_be_bytes().to_vec();
            block.extend_from_slice(&ext);
            let mut r = Reader::new("Hello", &block);
            let (_, units) = decode_list(&mut r, parent, &state).unwrap();
            assert!(units[0].kind().is_opaque(), "{kind}");
            assert_eq!(encode_list(&units).unwrap(), ext);
        }
    }

    #[test]
    fn test_truncated_extension_is_malformed() {
        let state = ConnectionState::new(EngineConfig::default());
        let data = hex("0006000a0008001d");
        let mut r = Reader::new("ClientHello", &data);
        let err = decode_list(&mut r, HandshakeType::CLIENT_HELLO.kind(), &state).unwrap_err();
        assert!(matches!(
            err,
            EngineError::MalformedUnit {
                field: "extension_data",
                ..
            }
        ));
    }

    #[test]
    fn test_apply_list_records_received_types() {
        let mut state = ConnectionState::new(EngineConfig::default());
        let unknown = GenericExtension::new(ExtensionType(0x4444), vec![]);
        let mut groups = SupportedGroups::default();
        groups.groups.set(vec![0x001d]);
        let units: Vec<Box<dyn ProtocolUnit>> = vec![Box::new(unknown), Box::new(groups)];
        apply_list(&units, &mut state, Origin::Received).unwrap();
        assert_eq!(state.negotiated().peer_extensions, vec![0x4444, 10]);
        assert_eq!(state.negotiated().peer_groups.len(), 1);
    }

    #[test]
    fn test_hello_context_from_parent() {
        let data = [0u8; 0];
        assert_eq!(HelloContext::of(&Reader::new("x", &data)), HelloContext::Other);
        let r = Reader::new("x", &data).with_parent(HandshakeType::SERVER_HELLO.kind());
        assert_eq!(HelloContext::of(&r), HelloContext::ServerHello);
        let r = Reader::new("x", &data).with_parent(HandshakeType::ENCRYPTED_EXTENSIONS.kind());
        assert_eq!(HelloContext::of(&r), HelloContext::EncryptedExtensions);
    }
}
