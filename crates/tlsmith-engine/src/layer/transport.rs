//! Bottom layer: raw chunks to and from a [`Transport`].

use std::time::Instant;

use tlsmith_types::EngineError;
use tracing::{debug, trace};

use super::{remaining, LayerData, LayerResult, LayerType, ProtocolLayer};
use crate::state::ConnectionState;
use crate::transport::{Received, Transport, TransportChunk};
use crate::unit::{Origin, ProtocolUnit, UnitFamily};

#[derive(Debug)]
pub struct TransportLayer {
    transport: Box<dyn Transport>,
    processed: LayerResult,
    received_in_action: bool,
}

impl TransportLayer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            processed: LayerResult::new(LayerType::Transport),
            received_in_action: false,
        }
    }

    pub fn is_datagram(&self) -> bool {
        self.transport.is_datagram()
    }

    fn write(&mut self, bytes: Vec<u8>, state: &mut ConnectionState) -> Result<(), EngineError> {
        self.transport.send(&bytes)?;
        trace!(len = bytes.len(), "transport sent");
        let chunk = TransportChunk::new(bytes);
        if let Err(err) = chunk.apply(state, Origin::Sent) {
            self.processed.error(&err);
        }
        self.processed.push(Box::new(chunk));
        Ok(())
    }
}

impl ProtocolLayer for TransportLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::Transport
    }

    fn owns(&self, family: UnitFamily) -> bool {
        family == UnitFamily::Transport
    }

    fn send_units(
        &mut self,
        units: Vec<Box<dyn ProtocolUnit>>,
        _lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        for mut unit in units {
            let bytes = match unit
                .compute_defaults(state)
                .and_then(|()| unit.encode())
            {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(unit = unit.name(), error = %err, "transport unit skipped");
                    self.processed.error(&err);
                    continue;
                }
            };
            self.transport.send(&bytes)?;
            if let Err(err) = unit.apply(state, Origin::Sent) {
                self.processed.error(&err);
            }
            self.processed.push(unit);
        }
        Ok(())
    }

    fn stage_units(&mut self, units: Vec<Box<dyn ProtocolUnit>>) {
        if !units.is_empty() {
            debug!(count = units.len(), "transport layer has nothing to frame; templates ignored");
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
        _lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        self.write(data.bytes, state)
    }

    fn receive_data(
        &mut self,
        deadline: Instant,
        _lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<Option<LayerData>, EngineError> {
        let Some(wait) = remaining(deadline) else {
            return Ok(None);
        };
        match self.transport.receive(wait)? {
            Received::Data(bytes) => {
                trace!(len = bytes.len(), "transport received");
                self.received_in_action = true;
                let chunk = TransportChunk::new(bytes.clone());
                if let Err(err) = chunk.apply(state, Origin::Received) {
                    self.processed.error(&err);
                }
                self.processed.push(Box::new(chunk));
                Ok(Some(LayerData::new(0, bytes)))
            }
            Received::Timeout => Ok(None),
            Received::Closed if !self.received_in_action => Err(EngineError::TransportFailure(
                "connection closed by peer before any data arrived".into(),
            )),
            Received::Closed => {
                debug!("connection closed after data; ending receive");
                Ok(None)
            }
        }
    }

    fn receive_unit(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        Ok(self.receive_data(deadline, lower, state)?.is_some())
    }

    fn processed(&self) -> &LayerResult {
        &self.processed
    }

    fn begin_action(&mut self) {
        self.processed = LayerResult::new(LayerType::Transport);
        self.received_in_action = false;
    }

    fn take_processed(&mut self) -> LayerResult {
        std::mem::replace(&mut self.processed, LayerResult::new(LayerType::Transport))
    }

    fn close(&mut self) {
        self.transport.close();
    }
}
