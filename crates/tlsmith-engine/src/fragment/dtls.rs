//! DTLS handshake fragment (RFC 6347 Section 4.2.2).
//!
//! ```text
//! struct {
//!     HandshakeType msg_type;
//!     uint24 length;
//!     uint16 message_seq;
//!     uint24 fragment_offset;
//!     uint24 fragment_length;
//!     opaque body[fragment_length];
//! } Handshake;
//! ```

use tlsmith_types::EngineError;

use super::Fragment;
use crate::state::ConnectionState;
use crate::unit::codec::put_u24;
use crate::unit::{
    len_u24, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitFamily, UnitKind,
    UnitRegistry,
};

/// DTLS handshake header length.
pub const DTLS_HANDSHAKE_HEADER_LEN: usize = 12;

/// One fragment of a DTLS handshake message.
#[derive(Debug, Clone, Default)]
pub struct DtlsHandshakeFragment {
    pub msg_type: Field<u8>,
    /// Length of the whole message body.
    pub length: Field<u32>,
    pub message_seq: Field<u16>,
    pub fragment_offset: Field<u32>,
    pub fragment_length: Field<u32>,
    pub body: Field<Vec<u8>>,
}

impl DtlsHandshakeFragment {
    /// Fragment of the message body `fragment` was cut from.
    pub fn from_fragment(msg_type: u8, message_seq: u16, fragment: &Fragment) -> Self {
        Self {
            msg_type: Field::with_value(msg_type),
            length: Field::with_value(fragment.total_length as u32),
            message_seq: Field::with_value(message_seq),
            fragment_offset: Field::with_value(fragment.offset as u32),
            fragment_length: Field::with_value(fragment.payload.len() as u32),
            body: Field::with_value(fragment.payload.clone()),
        }
    }

    /// The emitted values as a generic fragment (keyed by message_seq).
    pub fn to_fragment(&self) -> Result<Fragment, EngineError> {
        let msg_type = self.msg_type.require(Self::NAME, "msg_type")?;
        Ok(Fragment {
            kind: UnitKind::new(UnitFamily::Handshake, u16::from(msg_type)),
            sequence: u64::from(self.message_seq.require(Self::NAME, "message_seq")?),
            offset: self.fragment_offset.require(Self::NAME, "fragment_offset")? as usize,
            total_length: self.length.require(Self::NAME, "length")? as usize,
            payload: self.body.require(Self::NAME, "body")?,
        })
    }

    /// Length of the fragment starting at `buffer[0]`, if its header is
    /// complete.
    pub fn frame_len(buffer: &[u8]) -> Option<usize> {
        if buffer.len() < DTLS_HANDSHAKE_HEADER_LEN {
            return None;
        }
        let len = u32::from_be_bytes([0, buffer[9], buffer[10], buffer[11]]) as usize;
        Some(DTLS_HANDSHAKE_HEADER_LEN + len)
    }
}

impl RegisteredUnit for DtlsHandshakeFragment {
    const KIND: UnitKind = UnitKind::new(UnitFamily::DtlsFragment, 0);
    const NAME: &'static str = "DtlsHandshakeFragment";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let msg_type = r.read_u8("msg_type")?;
        let length = r.read_u24("length")?;
        let message_seq = r.read_u16("message_seq")?;
        let fragment_offset = r.read_u24("fragment_offset")?;
        let fragment_length = r.read_u24("fragment_length")?;
        let body = r.read_bytes(fragment_length as usize, "body")?.to_vec();
        Ok(Self {
            msg_type: Field::with_value(msg_type),
            length: Field::with_value(length),
            message_seq: Field::with_value(message_seq),
            fragment_offset: Field::with_value(fragment_offset),
            fragment_length: Field::with_value(fragment_length),
            body: Field::with_value(body),
        })
    }
}

impl ProtocolUnit for DtlsHandshakeFragment {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.body.fill(Vec::new);
        let body_len = self.body.emitted_len();
        self.msg_type.fill(|| 0);
        self.message_seq
            .fill(|| state.counters().dtls_next_send_message_seq);
        self.fragment_offset.fill(|| 0);
        self.length.fill(|| len_u24(body_len));
        self.fragment_length.compute(|| len_u24(body_len));
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let body = self.body.require(Self::NAME, "body")?;
        let mut out = Vec::with_capacity(DTLS_HANDSHAKE_HEADER_LEN + body.len());
        out.push(self.msg_type.require(Self::NAME, "msg_type")?);
        put_u24(&mut out, self.length.require(Self::NAME, "length")?);
        out.extend_from_slice(&self.message_seq.require(Self::NAME, "message_seq")?.to_be_bytes());
        put_u24(&mut out, self.fragment_offset.require(Self::NAME, "fragment_offset")?);
        put_u24(&mut out, self.fragment_length.require(Self::NAME, "fragment_length")?);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Message sequence bookkeeping belongs to the fragment layer, which
    /// sees whole messages.
    fn apply(&self, _state: &mut ConnectionState, _origin: Origin) -> Result<(), EngineError> {
        Ok(())
    }

    unit_boilerplate!(registered);
}

pub(crate) fn register(registry: &mut UnitRegistry) {
    registry.register(DtlsHandshakeFragment::registration());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fragment::split;

    #[test]
    fn test_fragment_header_layout() {
        let state = ConnectionState::new(EngineConfig::default());
        let pieces = split(UnitKind::new(UnitFamily::Handshake, 1), 3, &[0xAA; 10], 4);
        let mut unit = DtlsHandshakeFragment::from_fragment(1, 3, &pieces[1]);
        unit.compute_defaults(&state).unwrap();
        let bytes = unit.encode().unwrap();
        assert_eq!(
            bytes,
            [1, 0, 0, 10, 0, 3, 0, 0, 4, 0, 0, 4, 0xAA, 0xAA, 0xAA, 0xAA]
        );
        assert_eq!(DtlsHandshakeFragment::frame_len(&bytes), Some(16));

        let decoded = state
            .registry()
            .decode(DtlsHandshakeFragment::KIND, &bytes, &state)
            .unwrap();
        let back = decoded
            .downcast_ref::<DtlsHandshakeFragment>()
            .unwrap()
            .to_fragment()
            .unwrap();
        assert_eq!(back, pieces[1]);
    }

    #[test]
    fn test_fragment_length_override_survives_compute() {
        let state = ConnectionState::new(EngineConfig::default());
        let mut unit = DtlsHandshakeFragment::default();
        unit.body.set(vec![1, 2]);
        unit.fragment_length.force(100);
        unit.compute_defaults(&state).unwrap();
        let bytes = unit.encode().unwrap();
        assert_eq!(&bytes[9..12], &[0, 0, 100]);
        assert_eq!(&bytes[1..4], &[0, 0, 2]);
    }
}
