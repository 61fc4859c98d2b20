//! QUIC frame layer: frames packed straight into datagrams.
//!
//! Handshake bytes from the message layer travel in CRYPTO frames, one
//! datagram per frame. Received CRYPTO data is reordered by offset and
//! handed up once contiguous.

use std::collections::VecDeque;
use std::time::Instant;

use tlsmith_types::EngineError;
use tracing::{debug, warn};

use super::{next_layer, LayerData, LayerResult, LayerType, ProtocolLayer};
use crate::fragment::StreamAssembler;
use crate::quic::{peek_kind, Crypto};
use crate::record::ContentType;
use crate::state::ConnectionState;
use crate::unit::{OpaqueUnit, Origin, ProtocolUnit, Reader, UnitFamily, UnitKind};

#[derive(Debug)]
pub struct QuicFrameLayer {
    crypto_stream: Option<StreamAssembler>,
    delivered: VecDeque<LayerData>,
    staged: Vec<Box<dyn ProtocolUnit>>,
    processed: LayerResult,
}

impl QuicFrameLayer {
    pub fn new() -> Self {
        Self {
            crypto_stream: None,
            delivered: VecDeque::new(),
            staged: Vec::new(),
            processed: LayerResult::new(LayerType::QuicFrame),
        }
    }

    /// Pull one datagram and process its frames. Returns `false` on
    /// timeout.
    fn pull(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        let (next, rest) = next_layer(lower, LayerType::QuicFrame)?;
        let Some(datagram) = next.receive_data(deadline, rest, state)? else {
            return Ok(false);
        };
        let frames = decode_frames(&datagram.bytes, state);
        debug!(frames = frames.len(), len = datagram.bytes.len(), "received datagram");
        let stream = self
            .crypto_stream
            .get_or_insert_with(|| StreamAssembler::new(state.config().overlap_policy));
        for frame in frames {
            if let Some(crypto) = frame.downcast_ref::<Crypto>() {
                let offset = crypto.offset.get().unwrap_or_default();
                let data = crypto.data.get().unwrap_or_default();
                if let Err(err) = stream.insert(offset, &data) {
                    warn!(offset, error = %err, "crypto data rejected");
                    self.processed.error(&err);
                }
            }
            if let Err(err) = frame.apply(state, Origin::Received) {
                self.processed.error(&err);
            }
            self.processed.push(frame);
        }
        let handshake = stream.read_contiguous();
        if !handshake.is_empty() {
            self.delivered
                .push_back(LayerData::new(ContentType::HANDSHAKE.0, handshake));
        }
        Ok(true)
    }
}

/// Frames packed back to back. An unregistered or undecodable frame makes
/// the rest of the datagram opaque.
fn decode_frames(bytes: &[u8], state: &ConnectionState) -> Vec<Box<dyn ProtocolUnit>> {
    let mut frames = Vec::new();
    let mut r = Reader::new("QuicFrame", bytes);
    while !r.is_empty() {
        let start = r.position();
        let decoded = peek_kind(&r).and_then(|kind| {
            if state.registry().contains(kind) {
                state.registry().decode_from(kind, &mut r, state)
            } else {
                Err(EngineError::UnknownKind(kind.to_string()))
            }
        });
        match decoded {
            Ok(frame) => frames.push(frame),
            Err(err) => {
                debug!(error = %err, offset = start, "undecodable frame");
                frames.push(Box::new(OpaqueUnit::undecodable(
                    UnitKind::opaque(UnitFamily::QuicFrame),
                    bytes[start..].to_vec(),
                    &err,
                )));
                break;
            }
        }
    }
    frames
}

impl Default for QuicFrameLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolLayer for QuicFrameLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::QuicFrame
    }

    fn owns(&self, family: UnitFamily) -> bool {
        family == UnitFamily::QuicFrame
    }

    /// All units go out in one datagram. Each frame is applied before the
    /// next is computed, so CRYPTO offsets advance within the datagram.
    fn send_units(
        &mut self,
        units: Vec<Box<dyn ProtocolUnit>>,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let mut datagram = Vec::new();
        for mut unit in units {
            match unit.compute_defaults(state).and_then(|()| unit.encode()) {
                Ok(bytes) => datagram.extend_from_slice(&bytes),
                Err(err) => {
                    warn!(unit = unit.name(), error = %err, "frame not sent");
                    self.processed.error(&err);
                    continue;
                }
            }
            if let Err(err) = unit.apply(state, Origin::Sent) {
                self.processed.error(&err);
            }
            self.processed.push(unit);
        }
        if datagram.is_empty() {
            return Ok(());
        }
        let (next, rest) = next_layer(lower, LayerType::QuicFrame)?;
        next.send_data(LayerData::new(0, datagram), rest, state)
    }

    fn stage_units(&mut self, units: Vec<Box<dyn ProtocolUnit>>) {
        self.staged.extend(units);
    }

    fn flush_staged(
        &mut self,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let staged = std::mem::take(&mut self.staged);
        self.send_units(staged, lower, state)
    }

    /// Handshake bytes are cut into CRYPTO frames of at most
    /// `quic_max_crypto_payload` bytes.
    fn send_data(
        &mut self,
        data: LayerData,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        if data.content_type != ContentType::HANDSHAKE.0 {
            return Err(EngineError::Unsupported(format!(
                "content type {} over QUIC frames",
                data.content_type
            )));
        }
        let max = state.config().quic_max_crypto_payload.max(1);
        for chunk in data.bytes.chunks(max) {
            let template = self.staged.iter().position(|u| u.is::<Crypto>());
            let mut unit = match template {
                Some(pos) => self.staged.remove(pos),
                None => Box::new(Crypto::default()),
            };
            if let Some(crypto) = unit.downcast_mut::<Crypto>() {
                if crypto.data.value().is_none() {
                    crypto.data.set(chunk.to_vec());
                }
            }
            self.send_units(vec![unit], lower, state)?;
        }
        Ok(())
    }

    fn receive_data(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<Option<LayerData>, EngineError> {
        loop {
            if let Some(data) = self.delivered.pop_front() {
                return Ok(Some(data));
            }
            if !self.pull(deadline, lower, state)? {
                return Ok(None);
            }
        }
    }

    fn receive_unit(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        let before = self.processed.units.len();
        while self.processed.units.len() == before {
            if !self.pull(deadline, lower, state)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn processed(&self) -> &LayerResult {
        &self.processed
    }

    fn begin_action(&mut self) {
        self.processed = LayerResult::new(LayerType::QuicFrame);
        self.staged.clear();
    }

    fn take_processed(&mut self) -> LayerResult {
        std::mem::replace(&mut self.processed, LayerResult::new(LayerType::QuicFrame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::layer::TransportLayer;
    use crate::quic::{ConnectionClose, FrameType, Padding, Ping};
    use crate::transport::MemoryTransport;
    use crate::unit::RegisteredUnit;
    use crate::Role;
    use std::time::Duration;

    type Layers = Vec<Box<dyn ProtocolLayer>>;

    fn pair() -> (Layers, Layers) {
        let (a, b) = MemoryTransport::pair();
        let side = |t: MemoryTransport| -> Layers {
            vec![
                Box::new(QuicFrameLayer::new()),
                Box::new(TransportLayer::new(Box::new(t))),
            ]
        };
        (side(a), side(b))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_millis(300)
    }

    #[test]
    fn test_frames_share_one_datagram() {
        let mut client = ConnectionState::new(EngineConfig::default());
        let mut server = ConnectionState::new(EngineConfig::default().with_role(Role::Server));
        let (mut left, mut right) = pair();

        let (top, lower) = left.split_first_mut().unwrap();
        top.send_units(
            vec![
                Box::new(Ping::default()),
                Box::new(ConnectionClose::transport(0x0a)),
                Box::new(Padding::new(3)),
            ],
            lower,
            &mut client,
        )
        .unwrap();
        assert_eq!(lower[0].processed().units.len(), 1);

        let (top, lower) = right.split_first_mut().unwrap();
        assert!(top.receive_unit(deadline(), lower, &mut server).unwrap());
        assert_eq!(
            top.processed().kinds(),
            [Ping::KIND, ConnectionClose::KIND, Padding::KIND]
        );
        assert_eq!(server.negotiated().quic_close_error, Some(0x0a));
    }

    #[test]
    fn test_crypto_stream_reordered_and_handed_up() {
        let config = EngineConfig::builder().quic_max_crypto_payload(3).build().unwrap();
        let mut client = ConnectionState::new(config.clone());
        let mut server = ConnectionState::new(config.with_role(Role::Server));
        let (mut left, mut right) = pair();

        let (top, lower) = left.split_first_mut().unwrap();
        let mut late = Crypto::new(vec![4, 5]);
        late.offset.force(3);
        top.send_units(vec![Box::new(late)], lower, &mut client).unwrap();
        client.counters_mut().quic_crypto_send_offset = 0;
        top.send_data(LayerData::new(22, vec![1, 2, 3]), lower, &mut client)
            .unwrap();
        assert_eq!(client.counters().quic_crypto_send_offset, 3);

        let (top, lower) = right.split_first_mut().unwrap();
        let data = top.receive_data(deadline(), lower, &mut server).unwrap().unwrap();
        assert_eq!(data, LayerData::new(22, vec![1, 2, 3, 4, 5]));
        assert_eq!(top.processed().kinds(), [Crypto::KIND, Crypto::KIND]);
    }

    #[test]
    fn test_unknown_frame_makes_rest_opaque() {
        let mut client = ConnectionState::new(EngineConfig::default());
        let mut server = ConnectionState::new(EngineConfig::default().with_role(Role::Server));
        let (mut left, mut right) = pair();
        let (_, lower) = left.split_first_mut().unwrap();
        lower[0]
            .send_data(LayerData::new(0, vec![0x01, 0x1e, 0xAA]), &mut [], &mut client)
            .unwrap();

        let (top, lower) = right.split_first_mut().unwrap();
        assert!(top.receive_unit(deadline(), lower, &mut server).unwrap());
        assert_eq!(
            top.processed().kinds(),
            [FrameType::PING.kind(), UnitKind::opaque(UnitFamily::QuicFrame)]
        );
    }

    #[test]
    fn test_application_data_is_unsupported() {
        let mut client = ConnectionState::new(EngineConfig::default());
        let (mut left, _right) = pair();
        let (top, lower) = left.split_first_mut().unwrap();
        let err = top
            .send_data(LayerData::new(23, vec![1]), lower, &mut client)
            .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }
}
