//! Message layer: handshake messages, alerts, ChangeCipherSpec and
//! application data carried in records.
//!
//! Handshake messages may span records and several may share one record, so
//! handshake bytes are buffered and cut at message boundaries. Each message
//! is added to the transcript before it is applied.

use std::time::Instant;

use tlsmith_types::EngineError;
use tracing::{debug, warn};

use super::{next_layer, opaque, LayerData, LayerResult, LayerType, ProtocolLayer};
use crate::alert::Alert;
use crate::handshake;
use crate::message::{ApplicationData, ChangeCipherSpec};
use crate::record::ContentType;
use crate::state::ConnectionState;
use crate::unit::{OpaqueUnit, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitFamily};

/// Record content type that carries units of `family`.
fn content_type_for(family: UnitFamily) -> Option<ContentType> {
    match family {
        UnitFamily::Handshake => Some(ContentType::HANDSHAKE),
        UnitFamily::Alert => Some(ContentType::ALERT),
        UnitFamily::ChangeCipherSpec => Some(ContentType::CHANGE_CIPHER_SPEC),
        UnitFamily::ApplicationData => Some(ContentType::APPLICATION_DATA),
        _ => None,
    }
}

#[derive(Debug)]
pub struct MessageLayer {
    handshake_buffer: Vec<u8>,
    staged: Vec<Box<dyn ProtocolUnit>>,
    processed: LayerResult,
}

impl MessageLayer {
    pub fn new() -> Self {
        Self {
            handshake_buffer: Vec::new(),
            staged: Vec::new(),
            processed: LayerResult::new(LayerType::Message),
        }
    }

    fn emit(
        &mut self,
        mut unit: Box<dyn ProtocolUnit>,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let family = unit.kind().family;
        let Some(content_type) = content_type_for(family) else {
            let err = EngineError::Layer(format!("{family:?} units are not sent as messages"));
            warn!(unit = unit.name(), "unit skipped: {err}");
            self.processed.error(&err);
            return Ok(());
        };
        let bytes = match unit.compute_defaults(state).and_then(|()| unit.encode()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(unit = unit.name(), error = %err, "message not sent");
                self.processed.error(&err);
                return Ok(());
            }
        };
        if family == UnitFamily::Handshake {
            state.transcript_mut().append(&bytes);
        }
        debug!(unit = unit.name(), len = bytes.len(), "sending message");
        let (next, rest) = next_layer(lower, LayerType::Message)?;
        next.send_data(LayerData::new(content_type.0, bytes), rest, state)?;
        self.apply_and_record(unit, state, Origin::Sent);
        Ok(())
    }

    fn apply_and_record(
        &mut self,
        unit: Box<dyn ProtocolUnit>,
        state: &mut ConnectionState,
        origin: Origin,
    ) {
        if let Err(err) = unit.apply(state, origin) {
            warn!(unit = unit.name(), ?origin, error = %err, "apply failed");
            self.processed.error(&err);
        }
        self.processed.push(unit);
    }

    /// Decode and apply the next complete buffered handshake message.
    fn next_handshake(&mut self, state: &mut ConnectionState) -> bool {
        let Some(len) = handshake::frame_len(&self.handshake_buffer) else {
            return false;
        };
        if self.handshake_buffer.len() < len {
            return false;
        }
        let bytes: Vec<u8> = self.handshake_buffer.drain(..len).collect();
        let unit = match handshake::kind_of(&bytes) {
            Some(kind) => state.registry().decode_or_opaque(kind, &bytes, state),
            None => opaque(UnitFamily::Handshake, bytes.clone()),
        };
        state.transcript_mut().append(&bytes);
        debug!(unit = unit.name(), len, "received handshake message");
        self.apply_and_record(unit, state, Origin::Received);
        true
    }

    /// Decode a non-handshake payload into units and apply them.
    fn process(&mut self, data: &LayerData, state: &mut ConnectionState) {
        let units: Vec<Box<dyn ProtocolUnit>> = match ContentType(data.content_type) {
            ContentType::ALERT => decode_alerts(&data.bytes, state),
            ContentType::CHANGE_CIPHER_SPEC => vec![state.registry().decode_or_opaque(
                ChangeCipherSpec::KIND,
                &data.bytes,
                state,
            )],
            ContentType::APPLICATION_DATA => vec![state.registry().decode_or_opaque(
                ApplicationData::KIND,
                &data.bytes,
                state,
            )],
            other => {
                debug!(content_type = other.0, "unknown content type kept as opaque");
                vec![opaque(UnitFamily::Record, data.bytes.clone())]
            }
        };
        for unit in units {
            self.apply_and_record(unit, state, Origin::Received);
        }
    }
}

/// Alerts packed back to back; an undecodable tail becomes opaque.
fn decode_alerts(bytes: &[u8], state: &ConnectionState) -> Vec<Box<dyn ProtocolUnit>> {
    let mut units = Vec::new();
    let mut r = Reader::new(Alert::NAME, bytes);
    while !r.is_empty() {
        let start = r.position();
        match state.registry().decode_from(Alert::KIND, &mut r, state) {
            Ok(unit) => units.push(unit),
            Err(err) => {
                units.push(Box::new(OpaqueUnit::undecodable(
                    Alert::KIND,
                    bytes[start..].to_vec(),
                    &err,
                )));
                break;
            }
        }
    }
    units
}

impl Default for MessageLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolLayer for MessageLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::Message
    }

    fn owns(&self, family: UnitFamily) -> bool {
        content_type_for(family).is_some()
    }

    fn send_units(
        &mut self,
        units: Vec<Box<dyn ProtocolUnit>>,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        for unit in units {
            self.emit(unit, lower, state)?;
        }
        Ok(())
    }

    fn stage_units(&mut self, units: Vec<Box<dyn ProtocolUnit>>) {
        self.staged.extend(units);
    }

    fn flush_staged(
        &mut self,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        for unit in std::mem::take(&mut self.staged) {
            self.emit(unit, lower, state)?;
        }
        Ok(())
    }

    /// Bytes from the layer above travel as application data, in a staged
    /// ApplicationData template if there is one.
    fn send_data(
        &mut self,
        data: LayerData,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let mut unit = match self.staged.iter().position(|u| u.is::<ApplicationData>()) {
            Some(pos) => self.staged.remove(pos),
            None => Box::new(ApplicationData::default()),
        };
        if let Some(app) = unit.downcast_mut::<ApplicationData>() {
            if app.data.value().is_none() {
                app.data.set(data.bytes);
            }
        }
        self.emit(unit, lower, state)
    }

    /// Application data for the layer above. Other messages arriving in
    /// between are processed and recorded on the way.
    fn receive_data(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<Option<LayerData>, EngineError> {
        loop {
            while self.next_handshake(state) {}
            let (next, rest) = next_layer(lower, LayerType::Message)?;
            let Some(data) = next.receive_data(deadline, rest, state)? else {
                return Ok(None);
            };
            match ContentType(data.content_type) {
                ContentType::HANDSHAKE => self.handshake_buffer.extend_from_slice(&data.bytes),
                ContentType::APPLICATION_DATA => {
                    self.process(&data, state);
                    return Ok(Some(data));
                }
                _ => self.process(&data, state),
            }
        }
    }

    fn receive_unit(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        loop {
            if self.next_handshake(state) {
                return Ok(true);
            }
            let (next, rest) = next_layer(lower, LayerType::Message)?;
            let Some(data) = next.receive_data(deadline, rest, state)? else {
                return Ok(false);
            };
            if data.content_type == ContentType::HANDSHAKE.0 {
                self.handshake_buffer.extend_from_slice(&data.bytes);
            } else {
                self.process(&data, state);
                return Ok(true);
            }
        }
    }

    fn processed(&self) -> &LayerResult {
        &self.processed
    }

    fn begin_action(&mut self) {
        self.processed = LayerResult::new(LayerType::Message);
        self.staged.clear();
    }

    fn take_processed(&mut self) -> LayerResult {
        std::mem::replace(&mut self.processed, LayerResult::new(LayerType::Message))
    }

    fn drain_partial(&mut self) {
        if !self.handshake_buffer.is_empty() {
            let bytes = std::mem::take(&mut self.handshake_buffer);
            debug!(len = bytes.len(), "partial handshake message surfaced as opaque");
            self.processed.push(opaque(UnitFamily::Handshake, bytes));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertDescription, AlertLevel};
    use crate::config::EngineConfig;
    use crate::handshake::{ClientHello, HandshakeType};
    use crate::layer::{RecordLayer, TransportLayer};
    use crate::transport::MemoryTransport;
    use crate::unit::UnitKind;
    use crate::Role;
    use std::time::Duration;

    type Layers = Vec<Box<dyn ProtocolLayer>>;

    fn tls_pair() -> (Layers, Layers) {
        let (a, b) = MemoryTransport::pair();
        let side = |t: MemoryTransport| -> Layers {
            vec![
                Box::new(MessageLayer::new()),
                Box::new(RecordLayer::new()),
                Box::new(TransportLayer::new(Box::new(t))),
            ]
        };
        (side(a), side(b))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_millis(300)
    }

    #[test]
    fn test_handshake_spanning_records_is_reassembled() {
        let config = EngineConfig::builder().max_record_payload(16).build().unwrap();
        let mut client = ConnectionState::new(config.clone());
        let mut server = ConnectionState::new(config.with_role(Role::Server));
        let (mut left, mut right) = tls_pair();

        let (top, lower) = left.split_first_mut().unwrap();
        top.send_units(vec![Box::new(ClientHello::default())], lower, &mut client)
            .unwrap();
        assert_eq!(client.transcript().len(), 1);
        assert!(lower[0].processed().units.len() > 1);

        let (top, lower) = right.split_first_mut().unwrap();
        assert!(top.receive_unit(deadline(), lower, &mut server).unwrap());
        assert_eq!(top.processed().kinds(), [HandshakeType::CLIENT_HELLO.kind()]);
        assert_eq!(server.transcript().messages(), client.transcript().messages());
        assert!(!server.negotiated().peer_cipher_suites.is_empty());
    }

    #[test]
    fn test_alerts_and_unknown_content() {
        let config = EngineConfig::default();
        let mut client = ConnectionState::new(config.clone());
        let mut server = ConnectionState::new(config.with_role(Role::Server));
        let (mut left, mut right) = tls_pair();

        let (top, lower) = left.split_first_mut().unwrap();
        top.send_units(
            vec![Box::new(Alert::new(AlertLevel::FATAL, AlertDescription::HANDSHAKE_FAILURE))],
            lower,
            &mut client,
        )
        .unwrap();
        let (record, rest) = lower.split_first_mut().unwrap();
        record
            .send_data(LayerData::new(99, vec![1, 2]), rest, &mut client)
            .unwrap();

        let (top, lower) = right.split_first_mut().unwrap();
        assert!(top.receive_unit(deadline(), lower, &mut server).unwrap());
        assert!(top.receive_unit(deadline(), lower, &mut server).unwrap());
        assert_eq!(
            top.processed().kinds(),
            [Alert::KIND, UnitKind::opaque(UnitFamily::Record)]
        );
        assert_eq!(server.negotiated().last_alert, Some((2, 40)));
    }

    #[test]
    fn test_application_data_is_handed_up() {
        let config = EngineConfig::default();
        let mut client = ConnectionState::new(config.clone());
        let mut server = ConnectionState::new(config.with_role(Role::Server));
        let (mut left, mut right) = tls_pair();

        let (top, lower) = left.split_first_mut().unwrap();
        top.send_data(LayerData::new(0, b"GET".to_vec()), lower, &mut client)
            .unwrap();
        assert_eq!(top.processed().kinds(), [ApplicationData::KIND]);

        let (top, lower) = right.split_first_mut().unwrap();
        let data = top.receive_data(deadline(), lower, &mut server).unwrap().unwrap();
        assert_eq!(data.bytes, b"GET");
        assert_eq!(server.negotiated().received_application_data, b"GET");
    }

    #[test]
    fn test_unsendable_family_is_recorded_as_error() {
        let mut state = ConnectionState::new(EngineConfig::default());
        let (mut left, _right) = tls_pair();
        let (top, lower) = left.split_first_mut().unwrap();
        top.send_units(
            vec![Box::new(OpaqueUnit::new(UnitFamily::QuicFrame, vec![1]))],
            lower,
            &mut state,
        )
        .unwrap();
        assert!(top.processed().is_empty());
        assert_eq!(top.processed().errors.len(), 1);
    }

    #[test]
    fn test_partial_handshake_drains_as_opaque() {
        let config = EngineConfig::default();
        let mut client = ConnectionState::new(config.clone());
        let mut server = ConnectionState::new(config.with_role(Role::Server));
        let (mut left, mut right) = tls_pair();
        let (_, lower) = left.split_first_mut().unwrap();
        let (record, rest) = lower.split_first_mut().unwrap();
        record
            .send_data(LayerData::new(22, vec![2, 0, 0, 40, 3, 3]), rest, &mut client)
            .unwrap();

        let (top, lower) = right.split_first_mut().unwrap();
        let short = Instant::now() + Duration::from_millis(50);
        assert!(!top.receive_unit(short, lower, &mut server).unwrap());
        top.drain_partial();
        assert_eq!(
            top.processed().kinds(),
            [UnitKind::opaque(UnitFamily::Handshake)]
        );
        assert!(server.transcript().is_empty());
    }
}
