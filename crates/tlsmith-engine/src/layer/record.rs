//! Record layer: TLS and DTLS records over a byte or datagram transport.
//!
//! Records are decoded one at a time as the layer above asks for data, so a
//! key change applied by a handshake message takes effect on the very next
//! record.

use std::time::Instant;

use tlsmith_types::EngineError;
use tracing::{debug, warn};

use super::{next_layer, opaque, LayerData, LayerResult, LayerType, ProtocolLayer};
use crate::record::Record;
use crate::state::ConnectionState;
use crate::unit::{Origin, ProtocolUnit, RegisteredUnit, UnitFamily};

#[derive(Debug)]
pub struct RecordLayer {
    buffer: Vec<u8>,
    staged: Vec<Box<dyn ProtocolUnit>>,
    processed: LayerResult,
}

impl RecordLayer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            staged: Vec::new(),
            processed: LayerResult::new(LayerType::Record),
        }
    }

    /// Compute, encode, send down and apply one record-family unit.
    fn emit(
        &mut self,
        mut unit: Box<dyn ProtocolUnit>,
        content_type: u8,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let bytes = match unit.compute_defaults(state).and_then(|()| unit.encode()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(unit = unit.name(), error = %err, "record not sent");
                self.processed.error(&err);
                return Ok(());
            }
        };
        let (next, rest) = next_layer(lower, LayerType::Record)?;
        next.send_data(LayerData::new(content_type, bytes), rest, state)?;
        if let Err(err) = unit.apply(state, Origin::Sent) {
            warn!(unit = unit.name(), error = %err, "record apply failed");
            self.processed.error(&err);
        }
        self.processed.push(unit);
        Ok(())
    }

    /// Take the first staged record template, if any.
    fn take_template(&mut self) -> Option<Box<dyn ProtocolUnit>> {
        let pos = self.staged.iter().position(|u| u.is::<Record>())?;
        Some(self.staged.remove(pos))
    }

    /// Decode the next complete record in the buffer. Undecodable records
    /// are recorded as opaque and not handed up.
    fn next_record(&mut self, state: &mut ConnectionState) -> Option<Option<LayerData>> {
        let len = Record::frame_len(&self.buffer, state.is_dtls())?;
        if self.buffer.len() < len {
            return None;
        }
        let bytes: Vec<u8> = self.buffer.drain(..len).collect();
        let unit = state.registry().decode_or_opaque(Record::KIND, &bytes, state);
        let payload = unit.downcast_ref::<Record>().map(|record| {
            let content_type = record.content_type.get().unwrap_or_default();
            let message = record.protocol_message.get().unwrap_or_default();
            LayerData::new(content_type, message)
        });
        if payload.is_none() {
            warn!(len = bytes.len(), "undecodable record");
        }
        if let Err(err) = unit.apply(state, Origin::Received) {
            self.processed.error(&err);
        }
        self.processed.push(unit);
        Some(payload)
    }

    /// Buffer the next chunk from below. Returns `false` on timeout.
    fn pull(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        let (next, rest) = next_layer(lower, LayerType::Record)?;
        let Some(chunk) = next.receive_data(deadline, rest, state)? else {
            return Ok(false);
        };
        let dtls = state.is_dtls();
        let start = self.buffer.len();
        self.buffer.extend_from_slice(&chunk.bytes);
        if dtls {
            // Records never span datagrams; a tail that is not a whole
            // record will not be completed by the next one.
            let whole = start + complete_prefix(&self.buffer[start..], dtls);
            if whole < self.buffer.len() {
                let tail = self.buffer.split_off(whole);
                debug!(len = tail.len(), "truncated record in datagram");
                self.processed.push(opaque(UnitFamily::Record, tail));
            }
        }
        Ok(true)
    }
}

/// Length of the longest run of whole records at the start of `buffer`.
fn complete_prefix(buffer: &[u8], dtls: bool) -> usize {
    let mut pos = 0;
    while let Some(len) = Record::frame_len(&buffer[pos..], dtls) {
        if buffer.len() - pos < len {
            break;
        }
        pos += len;
    }
    pos
}

impl Default for RecordLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolLayer for RecordLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::Record
    }

    fn owns(&self, family: UnitFamily) -> bool {
        family == UnitFamily::Record
    }

    fn send_units(
        &mut self,
        units: Vec<Box<dyn ProtocolUnit>>,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        for unit in units {
            self.emit(unit, 0, lower, state)?;
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
            self.emit(unit, 0, lower, state)?;
        }
        Ok(())
    }

    /// Split `data` into records of at most `max_record_payload` bytes,
    /// consuming staged templates in order.
    fn send_data(
        &mut self,
        data: LayerData,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let max = state.config().max_record_payload.max(1);
        let mut chunks: Vec<&[u8]> = data.bytes.chunks(max).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for chunk in chunks {
            let mut unit = self
                .take_template()
                .unwrap_or_else(|| Box::new(Record::new()));
            if let Some(record) = unit.downcast_mut::<Record>() {
                if record.protocol_message.value().is_none() {
                    record.protocol_message.set(chunk.to_vec());
                }
                record.content_type.fill(|| data.content_type);
            }
            self.emit(unit, data.content_type, lower, state)?;
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
            while let Some(payload) = self.next_record(state) {
                if payload.is_some() {
                    return Ok(payload);
                }
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
        loop {
            if self.next_record(state).is_some() {
                return Ok(true);
            }
            if !self.pull(deadline, lower, state)? {
                return Ok(false);
            }
        }
    }

    fn processed(&self) -> &LayerResult {
        &self.processed
    }

    fn begin_action(&mut self) {
        self.processed = LayerResult::new(LayerType::Record);
        self.staged.clear();
    }

    fn take_processed(&mut self) -> LayerResult {
        std::mem::replace(&mut self.processed, LayerResult::new(LayerType::Record))
    }

    fn drain_partial(&mut self) {
        if !self.buffer.is_empty() {
            let bytes = std::mem::take(&mut self.buffer);
            debug!(len = bytes.len(), "partial record surfaced as opaque");
            self.processed.push(opaque(UnitFamily::Record, bytes));
        }
    }
}
