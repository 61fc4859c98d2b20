//! HTTP layer: HTTP/1.1 messages over the application data stream.

use std::time::Instant;

use tlsmith_types::EngineError;
use tracing::{debug, warn};

use super::{next_layer, opaque, LayerData, LayerResult, LayerType, ProtocolLayer};
use crate::http;
use crate::record::ContentType;
use crate::state::ConnectionState;
use crate::unit::{Origin, ProtocolUnit, UnitFamily};

#[derive(Debug)]
pub struct HttpLayer {
    buffer: Vec<u8>,
    processed: LayerResult,
}

impl HttpLayer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            processed: LayerResult::new(LayerType::Http),
        }
    }

    /// Decode and apply the next complete buffered message.
    fn next_message(&mut self, state: &mut ConnectionState) -> bool {
        let Some(len) = http::frame_len(&self.buffer) else {
            return false;
        };
        let bytes: Vec<u8> = self.buffer.drain(..len).collect();
        let unit = state
            .registry()
            .decode_or_opaque(http::kind_of(&bytes), &bytes, state);
        debug!(unit = unit.name(), len, "received http message");
        if let Err(err) = unit.apply(state, Origin::Received) {
            self.processed.error(&err);
        }
        self.processed.push(unit);
        true
    }
}

impl Default for HttpLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolLayer for HttpLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::Http
    }

    fn owns(&self, family: UnitFamily) -> bool {
        family == UnitFamily::Http
    }

    fn send_units(
        &mut self,
        units: Vec<Box<dyn ProtocolUnit>>,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        for mut unit in units {
            let bytes = match unit.compute_defaults(state).and_then(|()| unit.encode()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(unit = unit.name(), error = %err, "http message not sent");
                    self.processed.error(&err);
                    continue;
                }
            };
            let (next, rest) = next_layer(lower, LayerType::Http)?;
            next.send_data(
                LayerData::new(ContentType::APPLICATION_DATA.0, bytes),
                rest,
                state,
            )?;
            if let Err(err) = unit.apply(state, Origin::Sent) {
                self.processed.error(&err);
            }
            self.processed.push(unit);
        }
        Ok(())
    }

    fn stage_units(&mut self, units: Vec<Box<dyn ProtocolUnit>>) {
        if !units.is_empty() {
            debug!(count = units.len(), "http layer is the top layer; templates ignored");
        }
    }

    fn flush_staged(
        &mut self,
        _lower: &mut [Box<dyn ProtocolLayer>],
        _state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn send_data(
        &mut self,
        data: LayerData,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let (next, rest) = next_layer(lower, LayerType::Http)?;
        next.send_data(
            LayerData::new(ContentType::APPLICATION_DATA.0, data.bytes),
            rest,
            state,
        )
    }

    fn receive_data(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<Option<LayerData>, EngineError> {
        let (next, rest) = next_layer(lower, LayerType::Http)?;
        next.receive_data(deadline, rest, state)
    }

    fn receive_unit(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        loop {
            if self.next_message(state) {
                return Ok(true);
            }
            let (next, rest) = next_layer(lower, LayerType::Http)?;
            let Some(data) = next.receive_data(deadline, rest, state)? else {
                return Ok(false);
            };
            self.buffer.extend_from_slice(&data.bytes);
        }
    }

    fn processed(&self) -> &LayerResult {
        &self.processed
    }

    fn begin_action(&mut self) {
        self.processed = LayerResult::new(LayerType::Http);
    }

    fn take_processed(&mut self) -> LayerResult {
        std::mem::replace(&mut self.processed, LayerResult::new(LayerType::Http))
    }

    fn drain_partial(&mut self) {
        if !self.buffer.is_empty() {
            let bytes = std::mem::take(&mut self.buffer);
            debug!(len = bytes.len(), "partial http message surfaced as opaque");
            self.processed.push(opaque(UnitFamily::Http, bytes));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::http::{HttpRequest, HttpResponse};
    use crate::layer::{MessageLayer, RecordLayer, TransportLayer};
    use crate::message::ApplicationData;
    use crate::transport::MemoryTransport;
    use crate::unit::{RegisteredUnit, UnitKind};
    use crate::Role;
    use std::time::Duration;

    type Layers = Vec<Box<dyn ProtocolLayer>>;

    fn pair() -> (Layers, Layers) {
        let (a, b) = MemoryTransport::pair();
        let side = |t: MemoryTransport| -> Layers {
            vec![
                Box::new(HttpLayer::new()),
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
    fn test_request_and_response_exchange() {
        let config = EngineConfig::builder().server_name("example.test").build().unwrap();
        let mut client = ConnectionState::new(config.clone());
        let mut server = ConnectionState::new(config.with_role(Role::Server));
        let (mut left, mut right) = pair();

        let (top, lower) = left.split_first_mut().unwrap();
        top.send_units(vec![Box::new(HttpRequest::default())], lower, &mut client)
            .unwrap();
        assert_eq!(lower[0].processed().kinds(), [ApplicationData::KIND]);

        let (top, lower) = right.split_first_mut().unwrap();
        assert!(top.receive_unit(deadline(), lower, &mut server).unwrap());
        assert_eq!(top.processed().kinds(), [HttpRequest::KIND]);
        assert_eq!(server.negotiated().http_request_target.as_deref(), Some("/"));
        assert!(server
            .negotiated()
            .http_headers
            .contains(&("Host".to_string(), "example.test".to_string())));

        let mut response = HttpResponse::default();
        response.body.set(b"hello".to_vec());
        top.send_units(vec![Box::new(response)], lower, &mut server)
            .unwrap();
        let (top, lower) = left.split_first_mut().unwrap();
        assert!(top.receive_unit(deadline(), lower, &mut client).unwrap());
        assert_eq!(client.negotiated().http_status, Some(200));
    }

    #[test]
    fn test_message_split_across_records() {
        let config = EngineConfig::builder().max_record_payload(8).build().unwrap();
        let mut client = ConnectionState::new(config.clone());
        let mut server = ConnectionState::new(config.with_role(Role::Server));
        let (mut left, mut right) = pair();

        let (top, lower) = left.split_first_mut().unwrap();
        top.send_units(vec![Box::new(HttpRequest::default())], lower, &mut client)
            .unwrap();

        let (top, lower) = right.split_first_mut().unwrap();
        assert!(top.receive_unit(deadline(), lower, &mut server).unwrap());
        assert_eq!(top.processed().kinds(), [HttpRequest::KIND]);
        assert!(lower[0].processed().units.len() > 1);
    }

    #[test]
    fn test_truncated_message_drains_as_opaque() {
        let mut client = ConnectionState::new(EngineConfig::default());
        let mut server = ConnectionState::new(EngineConfig::default().with_role(Role::Server));
        let (mut left, mut right) = pair();
        let (top, lower) = left.split_first_mut().unwrap();
        top.send_data(LayerData::new(0, b"GET / HTTP/1.1\r\nHost".to_vec()), lower, &mut client)
            .unwrap();

        let (top, lower) = right.split_first_mut().unwrap();
        let short = Instant::now() + Duration::from_millis(50);
        assert!(!top.receive_unit(short, lower, &mut server).unwrap());
        top.drain_partial();
        assert_eq!(top.processed().kinds(), [UnitKind::opaque(UnitFamily::Http)]);
    }

    #[test]
    fn test_oversized_content_length_waits_then_drains() {
        let mut client = ConnectionState::new(EngineConfig::default());
        let mut server = ConnectionState::new(EngineConfig::default().with_role(Role::Server));
        let (mut left, mut right) = pair();
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nabc";
        let (top, lower) = left.split_first_mut().unwrap();
        top.send_data(LayerData::new(0, head.to_vec()), lower, &mut client)
            .unwrap();

        let (top, lower) = right.split_first_mut().unwrap();
        let short = Instant::now() + Duration::from_millis(50);
        assert!(!top.receive_unit(short, lower, &mut server).unwrap());
        top.drain_partial();
        assert_eq!(top.processed().kinds(), [UnitKind::opaque(UnitFamily::Http)]);
        assert_eq!(top.processed().units[0].encode().unwrap(), head);
    }
}
