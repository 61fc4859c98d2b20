//! TLS and DTLS records (RFC 8446 Section 5.1, RFC 6347 Section 4.1).
//!
//! A [`Record`] keeps the cleartext it carries (`content_type`,
//! `protocol_message`) next to what goes on the wire (`wire_content_type`,
//! `fragment`). When a write cipher is installed compute-defaults seals the
//! cleartext into the fragment; decode opens it with the read cipher.

pub mod protection;

use tlsmith_types::EngineError;

use crate::state::ConnectionState;
use crate::unit::codec::{put_u16, put_u48};
use crate::unit::{
    len_u16, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitFamily, UnitKind,
    UnitRegistry,
};

/// Record content type. Open newtype so that unassigned values can be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentType(pub u8);

impl ContentType {
    pub const CHANGE_CIPHER_SPEC: Self = Self(20);
    pub const ALERT: Self = Self(21);
    pub const HANDSHAKE: Self = Self(22);
    pub const APPLICATION_DATA: Self = Self(23);
    pub const HEARTBEAT: Self = Self(24);
}

/// TLS record header length.
pub const TLS_HEADER_LEN: usize = 5;
/// DTLS record header length (type, version, epoch, 48-bit sequence, length).
pub const DTLS_HEADER_LEN: usize = 13;

/// Header length for the connection's record format.
pub fn header_len(dtls: bool) -> usize {
    if dtls {
        DTLS_HEADER_LEN
    } else {
        TLS_HEADER_LEN
    }
}

/// One record.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// DTLS header layout; taken from state by compute-defaults and decode.
    pub dtls: bool,
    /// Content type of the cleartext.
    pub content_type: Field<u8>,
    /// Cleartext carried by this record.
    pub protocol_message: Field<Vec<u8>>,
    pub wire_content_type: Field<u8>,
    pub version: Field<u16>,
    pub epoch: Field<u16>,
    pub sequence_number: Field<u64>,
    pub length: Field<u16>,
    /// Payload as sent: ciphertext when protected, else the cleartext.
    pub fragment: Field<Vec<u8>>,
    pub protected: bool,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(content_type: ContentType, payload: Vec<u8>) -> Self {
        let mut record = Self::new();
        record.content_type.set(content_type.0);
        record.protocol_message.set(payload);
        record
    }

    /// Total record length from a buffered header, if enough bytes are
    /// present to read it.
    pub fn frame_len(buffer: &[u8], dtls: bool) -> Option<usize> {
        let header = header_len(dtls);
        if buffer.len() < header {
            return None;
        }
        let len = u16::from_be_bytes([buffer[header - 2], buffer[header - 1]]) as usize;
        Some(header + len)
    }
}

impl RegisteredUnit for Record {
    const KIND: UnitKind = UnitKind::new(UnitFamily::Record, 0);
    const NAME: &'static str = "Record";

    fn decode(r: &mut Reader<'_>, state: &ConnectionState) -> Result<Self, EngineError> {
        let dtls = state.is_dtls();
        let wire_type = r.read_u8("content_type")?;
        let version = r.read_u16("version")?;
        let (epoch, sequence) = if dtls {
            (Some(r.read_u16("epoch")?), Some(r.read_u48("sequence_number")?))
        } else {
            (None, None)
        };
        let length = r.read_u16("length")?;
        let fragment = r.read_bytes(length as usize, "fragment")?.to_vec();

        let mut record = Record {
            dtls,
            wire_content_type: Field::with_value(wire_type),
            version: Field::with_value(version),
            length: Field::with_value(length),
            ..Record::default()
        };
        if let (Some(epoch), Some(sequence)) = (epoch, sequence) {
            record.epoch.set(epoch);
            record.sequence_number.set(sequence);
        }

        let cipher = state
            .keys()
            .read_cipher()
            .filter(|_| !dtls && wire_type == ContentType::APPLICATION_DATA.0);
        match cipher {
            Some(cipher) => {
                let (inner_type, plaintext) =
                    cipher.open(state.crypto(), state.counters().read_sequence, &fragment)?;
                record.protected = true;
                record.content_type.set(inner_type.0);
                record.protocol_message.set(plaintext);
            }
            None => {
                record.content_type.set(wire_type);
                record.protocol_message.set(fragment.clone());
            }
        }
        record.fragment.set(fragment);
        Ok(record)
    }
}

impl ProtocolUnit for Record {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.dtls = state.is_dtls();
        self.content_type
            .fill(|| ContentType::APPLICATION_DATA.0);
        self.protocol_message.fill(Vec::new);
        self.version.compute(|| state.record_version().0);
        if self.dtls {
            let counters = state.counters();
            self.epoch.compute(|| counters.write_epoch);
            self.sequence_number.compute(|| counters.write_sequence);
        }

        let content_type = self.content_type.require("Record", "content_type")?;
        let cleartext = self.protocol_message.require("Record", "protocol_message")?;
        let cipher = state
            .keys()
            .write_cipher()
            .filter(|_| !self.dtls && content_type != ContentType::CHANGE_CIPHER_SPEC.0);
        match cipher {
            Some(cipher) => {
                self.protected = true;
                self.wire_content_type
                    .compute(|| ContentType::APPLICATION_DATA.0);
                self.fragment.try_compute(|| {
                    cipher.seal(
                        state.crypto(),
                        state.counters().write_sequence,
                        ContentType(content_type),
                        &cleartext,
                    )
                })?;
            }
            None => {
                self.protected = false;
                self.wire_content_type.compute(|| content_type);
                self.fragment.compute(|| cleartext);
            }
        }
        let fragment_len = self.fragment.emitted_len();
        self.length.compute(|| len_u16(fragment_len));
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let fragment = self.fragment.require("Record", "fragment")?;
        let mut out = Vec::with_capacity(header_len(self.dtls) + fragment.len());
        out.push(self.wire_content_type.require("Record", "content_type")?);
        put_u16(&mut out, self.version.require("Record", "version")?);
        if self.dtls {
            put_u16(&mut out, self.epoch.require("Record", "epoch")?);
            put_u48(&mut out, self.sequence_number.require("Record", "sequence_number")?);
        }
        put_u16(&mut out, self.length.require("Record", "length")?);
        out.extend_from_slice(&fragment);
        Ok(out)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        let counters = state.counters_mut();
        match origin {
            Origin::Sent => counters.write_sequence = counters.write_sequence.wrapping_add(1),
            Origin::Received => counters.read_sequence = counters.read_sequence.wrapping_add(1),
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

pub(crate) fn register(registry: &mut UnitRegistry) {
    registry.register(Record::registration());
}
