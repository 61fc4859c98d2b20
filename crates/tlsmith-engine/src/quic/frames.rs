use tlsmith_types::EngineError;
use tracing::debug;

use super::FrameType;
use crate::state::ConnectionState;
use crate::unit::codec::{put_varint, varint_len};
use crate::unit::{
    Field, Origin, ProtocolUnit, Reader, Registration, RegisteredUnit, UnitKind, UnitRegistry,
};

fn read_frame_type(r: &mut Reader<'_>) -> Result<Field<u64>, EngineError> {
    Ok(Field::with_value(r.read_varint("frame_type")?))
}

fn write_varint(
    out: &mut Vec<u8>,
    field: &Field<u64>,
    unit: &'static str,
    name: &'static str,
) -> Result<(), EngineError> {
    put_varint(out, field.require(unit, name)?);
    Ok(())
}

/// A run of PADDING frames (type 0x00). Consecutive zero bytes decode as one
/// unit; `length` counts them.
#[derive(Debug, Clone, Default)]
pub struct Padding {
    pub length: Field<u64>,
}

impl Padding {
    pub fn new(length: u64) -> Self {
        Self {
            length: Field::with_value(length),
        }
    }
}

impl RegisteredUnit for Padding {
    const KIND: UnitKind = FrameType::PADDING.kind();
    const NAME: &'static str = "Padding";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let mut length = 0u64;
        while !r.is_empty() && r.peek_u8("padding")? == 0 {
            r.read_u8("padding")?;
            length += 1;
        }
        if length == 0 {
            return Err(r.malformed("frame_type"));
        }
        Ok(Self::new(length))
    }
}

impl ProtocolUnit for Padding {
    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        self.length.fill(|| 1);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let length = self.length.require(Self::NAME, "length")?;
        Ok(vec![0; length as usize])
    }

    fn apply(&self, _state: &mut ConnectionState, _origin: Origin) -> Result<(), EngineError> {
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// PING (type 0x01).
#[derive(Debug, Clone, Default)]
pub struct Ping {
    pub frame_type: Field<u64>,
}

impl RegisteredUnit for Ping {
    const KIND: UnitKind = FrameType::PING.kind();
    const NAME: &'static str = "Ping";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        Ok(Self {
            frame_type: read_frame_type(r)?,
        })
    }
}

impl ProtocolUnit for Ping {
    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        self.frame_type.compute(|| FrameType::PING.0);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::with_capacity(1);
        write_varint(&mut out, &self.frame_type, Self::NAME, "frame_type")?;
        Ok(out)
    }

    fn apply(&self, _state: &mut ConnectionState, _origin: Origin) -> Result<(), EngineError> {
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// ACK (type 0x02). Additional ranges are kept as raw varint pairs.
#[derive(Debug, Clone, Default)]
pub struct Ack {
    pub frame_type: Field<u64>,
    pub largest_acknowledged: Field<u64>,
    pub ack_delay: Field<u64>,
    pub ack_range_count: Field<u64>,
    pub first_ack_range: Field<u64>,
    pub additional_ranges: Field<Vec<u8>>,
}

impl RegisteredUnit for Ack {
    const KIND: UnitKind = FrameType::ACK.kind();
    const NAME: &'static str = "Ack";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let frame_type = read_frame_type(r)?;
        let largest = r.read_varint("largest_acknowledged")?;
        let delay = r.read_varint("ack_delay")?;
        let count = r.read_varint("ack_range_count")?;
        let first = r.read_varint("first_ack_range")?;
        let start = r.position();
        for _ in 0..count {
            r.read_varint("gap")?;
            r.read_varint("ack_range_length")?;
        }
        let ranges = r.data()[start..r.position()].to_vec();
        Ok(Self {
            frame_type,
            largest_acknowledged: Field::with_value(largest),
            ack_delay: Field::with_value(delay),
            ack_range_count: Field::with_value(count),
            first_ack_range: Field::with_value(first),
            additional_ranges: Field::with_value(ranges),
        })
    }
}

impl ProtocolUnit for Ack {
    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        self.frame_type.compute(|| FrameType::ACK.0);
        self.largest_acknowledged.fill(|| 0);
        self.ack_delay.fill(|| 0);
        self.first_ack_range.fill(|| 0);
        self.ack_range_count.fill(|| 0);
        self.additional_ranges.fill(Vec::new);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::with_capacity(8);
        write_varint(&mut out, &self.frame_type, Self::NAME, "frame_type")?;
        write_varint(&mut out, &self.largest_acknowledged, Self::NAME, "largest_acknowledged")?;
        write_varint(&mut out, &self.ack_delay, Self::NAME, "ack_delay")?;
        write_varint(&mut out, &self.ack_range_count, Self::NAME, "ack_range_count")?;
        write_varint(&mut out, &self.first_ack_range, Self::NAME, "first_ack_range")?;
        out.extend_from_slice(&self.additional_ranges.require(Self::NAME, "ack_ranges")?);
        Ok(out)
    }

    fn apply(&self, _state: &mut ConnectionState, _origin: Origin) -> Result<(), EngineError> {
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// CRYPTO (type 0x06): a slice of the handshake byte stream at `offset`.
#[derive(Debug, Clone, Default)]
pub struct Crypto {
    pub frame_type: Field<u64>,
    pub offset: Field<u64>,
    pub length: Field<u64>,
    pub data: Field<Vec<u8>>,
}

impl Crypto {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Field::with_value(data),
            ..Self::default()
        }
    }

    pub fn encoded_len(offset: u64, data_len: usize) -> usize {
        1 + varint_len(offset) + varint_len(data_len as u64) + data_len
    }
}

impl RegisteredUnit for Crypto {
    const KIND: UnitKind = FrameType::CRYPTO.kind();
    const NAME: &'static str = "Crypto";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let frame_type = read_frame_type(r)?;
        let offset = r.read_varint("offset")?;
        let length = r.read_varint("length")?;
        let len = usize::try_from(length).map_err(|_| r.malformed("length"))?;
        let data = r.read_bytes(len, "crypto_data")?.to_vec();
        Ok(Self {
            frame_type,
            offset: Field::with_value(offset),
            length: Field::with_value(length),
            data: Field::with_value(data),
        })
    }
}

impl ProtocolUnit for Crypto {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.frame_type.compute(|| FrameType::CRYPTO.0);
        self.offset
            .compute(|| state.counters().quic_crypto_send_offset);
        self.data.fill(Vec::new);
        let len = self.data.emitted_len();
        self.length.compute(|| len as u64);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let data = self.data.require(Self::NAME, "crypto_data")?;
        let mut out = Vec::with_capacity(data.len() + 9);
        write_varint(&mut out, &self.frame_type, Self::NAME, "frame_type")?;
        write_varint(&mut out, &self.offset, Self::NAME, "offset")?;
        write_varint(&mut out, &self.length, Self::NAME, "length")?;
        out.extend_from_slice(&data);
        Ok(out)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Sent {
            let end = self.offset.get().unwrap_or_default()
                + self.data.value().map_or(0, |d| d.len() as u64);
            let counters = state.counters_mut();
            counters.quic_crypto_send_offset = counters.quic_crypto_send_offset.max(end);
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// CONNECTION_CLOSE, transport (0x1c) or application (0x1d) form. Only the
/// transport form carries the offending frame type.
#[derive(Debug, Clone, Default)]
pub struct ConnectionClose {
    pub application: bool,
    pub frame_type: Field<u64>,
    pub error_code: Field<u64>,
    pub offending_frame_type: Field<u64>,
    pub reason_length: Field<u64>,
    pub reason: Field<Vec<u8>>,
}

impl ConnectionClose {
    pub fn transport(error_code: u64) -> Self {
        Self {
            error_code: Field::with_value(error_code),
            ..Self::default()
        }
    }

    pub fn application(error_code: u64) -> Self {
        Self {
            application: true,
            ..Self::transport(error_code)
        }
    }

    fn wire_type(&self) -> FrameType {
        if self.application {
            FrameType::CONNECTION_CLOSE_APPLICATION
        } else {
            FrameType::CONNECTION_CLOSE
        }
    }

    fn application_registration() -> Registration {
        Registration {
            kind: FrameType::CONNECTION_CLOSE_APPLICATION.kind(),
            name: Self::NAME,
            decode: |r, state| {
                Self::decode(r, state).map(|close| Box::new(close) as Box<dyn ProtocolUnit>)
            },
            create: || Box::new(Self::application(0)) as Box<dyn ProtocolUnit>,
        }
    }
}

impl RegisteredUnit for ConnectionClose {
    const KIND: UnitKind = FrameType::CONNECTION_CLOSE.kind();
    const NAME: &'static str = "ConnectionClose";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let frame_type = r.read_varint("frame_type")?;
        let application = frame_type == FrameType::CONNECTION_CLOSE_APPLICATION.0;
        let error_code = r.read_varint("error_code")?;
        let mut close = Self {
            application,
            frame_type: Field::with_value(frame_type),
            error_code: Field::with_value(error_code),
            ..Self::default()
        };
        if !application {
            close
                .offending_frame_type
                .set(r.read_varint("offending_frame_type")?);
        }
        let reason_length = r.read_varint("reason_phrase_length")?;
        let len = usize::try_from(reason_length).map_err(|_| r.malformed("reason_phrase_length"))?;
        close.reason_length.set(reason_length);
        close.reason.set(r.read_bytes(len, "reason_phrase")?.to_vec());
        Ok(close)
    }
}

impl ProtocolUnit for ConnectionClose {
    fn kind(&self) -> UnitKind {
        self.wire_type().kind()
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        let wire_type = self.wire_type();
        self.frame_type.compute(|| wire_type.0);
        self.error_code.fill(|| 0);
        if !self.application {
            self.offending_frame_type.fill(|| 0);
        }
        self.reason.fill(Vec::new);
        let len = self.reason.emitted_len();
        self.reason_length.compute(|| len as u64);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let reason = self.reason.require(Self::NAME, "reason_phrase")?;
        let mut out = Vec::with_capacity(reason.len() + 8);
        write_varint(&mut out, &self.frame_type, Self::NAME, "frame_type")?;
        write_varint(&mut out, &self.error_code, Self::NAME, "error_code")?;
        if !self.application {
            write_varint(&mut out, &self.offending_frame_type, Self::NAME, "offending_frame_type")?;
        }
        write_varint(&mut out, &self.reason_length, Self::NAME, "reason_phrase_length")?;
        out.extend_from_slice(&reason);
        Ok(out)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let code = self.error_code.get();
            debug!(?code, application = self.application, "peer closed QUIC connection");
            state.record_negotiated("quic_close_error", |n| n.quic_close_error = code);
        }
        Ok(())
    }

    unit_boilerplate!();
}

pub(super) fn register(registry: &mut UnitRegistry) {
    registry.register(Padding::registration());
    registry.register(Ping::registration());
    registry.register(Ack::registration());
    registry.register(Crypto::registration());
    registry.register(ConnectionClose::registration());
    registry.register(ConnectionClose::application_registration());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::unit::Override;

    fn state() -> ConnectionState {
        ConnectionState::new(EngineConfig::default())
    }

    #[test]
    fn test_crypto_frames_advance_send_offset() {
        let mut state = state();
        let mut first = Crypto::new(vec![1; 70]);
        first.compute_defaults(&state).unwrap();
        first.apply(&mut state, Origin::Sent).unwrap();
        let mut second = Crypto::new(vec![2; 3]);
        second.compute_defaults(&state).unwrap();
        let bytes = second.encode().unwrap();
        assert_eq!(bytes, [0x06, 0x40, 70, 3, 2, 2, 2]);
        assert_eq!(bytes.len(), Crypto::encoded_len(70, 3));

        let decoded = state.registry().decode(Crypto::KIND, &bytes, &state).unwrap();
        let decoded = decoded.downcast_ref::<Crypto>().unwrap();
        assert_eq!(decoded.offset.get(), Some(70));
        assert_eq!(decoded.data.get(), Some(vec![2; 3]));
    }

    #[test]
    fn test_padding_run_is_one_unit() {
        let state = state();
        let mut r = Reader::new("Padding", &[0, 0, 0, 1]);
        let padding = state.registry().decode_from(Padding::KIND, &mut r, &state).unwrap();
        assert_eq!(padding.encode().unwrap(), [0, 0, 0]);
        assert_eq!(r.remaining(), 1);
    }

    #[test]
    fn test_ack_with_extra_range_keeps_raw_ranges() {
        let state = state();
        let bytes = [0x02, 10, 0, 1, 2, 1, 3];
        let ack = state.registry().decode(Ack::KIND, &bytes, &state).unwrap();
        assert_eq!(ack.encode().unwrap(), bytes);
        let mut fresh = Ack::default();
        fresh.compute_defaults(&state).unwrap();
        assert_eq!(fresh.encode().unwrap(), [0x02, 0, 0, 0, 0]);
    }

    #[test]
    fn test_connection_close_forms() {
        let mut state = state();
        let mut close = ConnectionClose::application(0x0101);
        close.reason.set(b"bye".to_vec());
        close.compute_defaults(&state).unwrap();
        let bytes = close.encode().unwrap();
        assert_eq!(bytes, [0x1d, 0x41, 0x01, 3, b'b', b'y', b'e']);
        assert_eq!(close.kind(), FrameType::CONNECTION_CLOSE_APPLICATION.kind());
        let decoded = state
            .registry()
            .decode(FrameType::CONNECTION_CLOSE_APPLICATION.kind(), &bytes, &state)
            .unwrap();
        decoded.apply(&mut state, Origin::Received).unwrap();
        assert_eq!(state.negotiated().quic_close_error, Some(0x0101));

        let mut transport = ConnectionClose::transport(0x0a);
        transport.offending_frame_type.set(0x06);
        transport.compute_defaults(&state).unwrap();
        assert_eq!(transport.encode().unwrap(), [0x1c, 0x0a, 0x06, 0]);
    }

    #[test]
    fn test_frame_type_override() {
        let state = state();
        let mut ping = Ping::default();
        ping.frame_type.set_override(Override::Explicit(0x3F));
        ping.compute_defaults(&state).unwrap();
        assert_eq!(ping.encode().unwrap(), [0x3F]);
    }
}
