//! Handshake messages (RFC 8446 Section 4, RFC 5246 Section 7.4,
//! RFC 6347 Section 4.2).
//!
//! Every message unit carries its 4-byte TLS handshake header. The DTLS
//! fragment header is added and removed by the DTLS layer, so units and the
//! transcript always see the TLS form.

mod certificate;
mod finished;
mod hello;
mod hello_verify;
mod key_exchange;

use tlsmith_types::EngineError;

use crate::unit::codec::put_u24;
use crate::unit::{len_u24, Field, Reader, RegisteredUnit, UnitFamily, UnitKind, UnitRegistry};

pub use certificate::{Certificate, CertificateEntry, CertificateVerify};
pub use finished::Finished;
pub use hello::{ClientHello, EncryptedExtensions, ServerHello, HELLO_RETRY_REQUEST_RANDOM};
pub use hello_verify::HelloVerifyRequest;
pub use key_exchange::{ClientKeyExchange, ServerHelloDone, ServerKeyExchange};

/// Handshake message type. Open newtype so that unassigned types can be
/// sent and received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandshakeType(pub u8);

impl HandshakeType {
    pub const HELLO_REQUEST: Self = Self(0);
    pub const CLIENT_HELLO: Self = Self(1);
    pub const SERVER_HELLO: Self = Self(2);
    pub const HELLO_VERIFY_REQUEST: Self = Self(3);
    pub const NEW_SESSION_TICKET: Self = Self(4);
    pub const END_OF_EARLY_DATA: Self = Self(5);
    pub const ENCRYPTED_EXTENSIONS: Self = Self(8);
    pub const CERTIFICATE: Self = Self(11);
    pub const SERVER_KEY_EXCHANGE: Self = Self(12);
    pub const CERTIFICATE_REQUEST: Self = Self(13);
    pub const SERVER_HELLO_DONE: Self = Self(14);
    pub const CERTIFICATE_VERIFY: Self = Self(15);
    pub const CLIENT_KEY_EXCHANGE: Self = Self(16);
    pub const FINISHED: Self = Self(20);
    pub const KEY_UPDATE: Self = Self(24);
    pub const MESSAGE_HASH: Self = Self(254);

    pub const fn kind(self) -> UnitKind {
        UnitKind::new(UnitFamily::Handshake, self.0 as u16)
    }
}

/// TLS handshake header length.
pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// The msg_type and u24 length prefix of a handshake message.
#[derive(Debug, Clone, Default)]
pub struct HandshakeHeader {
    pub msg_type: Field<u8>,
    pub length: Field<u32>,
}

impl HandshakeHeader {
    /// Read the prefix and return a reader over exactly the body.
    pub fn read<'a>(r: &mut Reader<'a>) -> Result<(Self, Reader<'a>), EngineError> {
        let msg_type = r.read_u8("msg_type")?;
        let length = r.read_u24("length")?;
        let body = r.sub_reader(length as usize, "body")?;
        Ok((
            Self {
                msg_type: Field::with_value(msg_type),
                length: Field::with_value(length),
            },
            body,
        ))
    }

    pub fn compute(&mut self, msg_type: HandshakeType, body_len: usize) {
        self.msg_type.compute(|| msg_type.0);
        self.length.compute(|| len_u24(body_len));
    }

    pub fn write(&self, unit: &'static str, body: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
        out.push(self.msg_type.require(unit, "msg_type")?);
        put_u24(&mut out, self.length.require(unit, "length")?);
        out.extend_from_slice(body);
        Ok(out)
    }
}

/// Total length of the TLS-form handshake message at the start of
/// `buffer`, once its header is complete.
pub fn frame_len(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < HANDSHAKE_HEADER_LEN {
        return None;
    }
    let len = u32::from_be_bytes([0, buffer[1], buffer[2], buffer[3]]) as usize;
    Some(HANDSHAKE_HEADER_LEN + len)
}

/// Unit kind of the message at the start of `buffer`.
pub fn kind_of(buffer: &[u8]) -> Option<UnitKind> {
    buffer.first().map(|t| HandshakeType(*t).kind())
}

pub(crate) fn register(registry: &mut UnitRegistry) {
    registry.register(ClientHello::registration());
    registry.register(ServerHello::registration());
    registry.register(HelloVerifyRequest::registration());
    registry.register(EncryptedExtensions::registration());
    registry.register(Certificate::registration());
    registry.register(CertificateVerify::registration());
    registry.register(ServerKeyExchange::registration());
    registry.register(ServerHelloDone::registration());
    registry.register(ClientKeyExchange::registration());
    registry.register(Finished::registration());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len_and_kind() {
        assert_eq!(frame_len(&[20, 0, 0]), None);
        assert_eq!(frame_len(&[20, 0, 0, 32]), Some(36));
        assert_eq!(frame_len(&[1, 1, 0, 0]), Some(4 + 65536));
        assert_eq!(kind_of(&[11]), Some(HandshakeType::CERTIFICATE.kind()));
        assert_eq!(kind_of(&[]), None);
    }

    #[test]
    fn test_header_roundtrip_with_length_override() {
        let mut header = HandshakeHeader::default();
        header.compute(HandshakeType::FINISHED, 3);
        assert_eq!(header.write("Finished", &[1, 2, 3]).unwrap(), [20, 0, 0, 3, 1, 2, 3]);
        header.length.force(0x00FF_FFFF);
        header.compute(HandshakeType::FINISHED, 3);
        let bytes = header.write("Finished", &[1, 2, 3]).unwrap();
        assert_eq!(&bytes[..4], &[20, 0xFF, 0xFF, 0xFF]);

        let mut r = Reader::new("Finished", &[20, 0, 0, 2, 9, 9]);
        let (decoded, body) = HandshakeHeader::read(&mut r).unwrap();
        assert_eq!(decoded.length.get(), Some(2));
        assert_eq!(body.remaining(), 2);
    }
}
