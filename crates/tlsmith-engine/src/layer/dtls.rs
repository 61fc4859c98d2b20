//! DTLS handshake fragmentation layer (RFC 6347 Section 4.2.2).
//!
//! Sits between the message layer and the record layer. Outgoing handshake
//! messages arrive in TLS form and leave as one or more fragments with a
//! message sequence number; incoming fragments are reassembled per
//! message_seq and handed up in TLS form, in sequence order. Only messages
//! within [`MAX_PENDING_MESSAGES`] of the next expected one and no longer than
//! [`MAX_MESSAGE_LEN`] are buffered; other fragments surface as opaque units.
//! Everything sent between two receives forms one flight, kept for
//! retransmission.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tlsmith_types::EngineError;
use tracing::{debug, warn};

use super::{next_layer, opaque, LayerData, LayerResult, LayerType, ProtocolLayer};
use crate::fragment::{split, DtlsHandshakeFragment, Flight, Fragment, ReassemblyBuffer, RetransmitTimer};
use crate::handshake::{HandshakeType, HANDSHAKE_HEADER_LEN};
use crate::record::ContentType;
use crate::state::ConnectionState;
use crate::unit::codec::put_u24;
use crate::unit::{OpaqueUnit, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitFamily};

/// Messages past the next expected message_seq that may be reassembled at once.
pub const MAX_PENDING_MESSAGES: u16 = 16;

/// Largest handshake message body reassembled from fragments.
pub const MAX_MESSAGE_LEN: usize = 1 << 18;

#[derive(Debug)]
pub struct DtlsFragmentLayer {
    reassembly: HashMap<u16, ReassemblyBuffer>,
    /// Payloads ready for the layer above.
    delivered: VecDeque<LayerData>,
    flight: Flight,
    /// Runs while the flight is unanswered and timed resends are enabled.
    timer: Option<RetransmitTimer>,
    /// Set once something was received; the next send starts a new flight.
    flight_done: bool,
    staged: Vec<Box<dyn ProtocolUnit>>,
    processed: LayerResult,
}

impl DtlsFragmentLayer {
    pub fn new() -> Self {
        Self {
            reassembly: HashMap::new(),
            delivered: VecDeque::new(),
            flight: Flight::new(),
            timer: None,
            flight_done: true,
            staged: Vec::new(),
            processed: LayerResult::new(LayerType::DtlsFragment),
        }
    }

    /// Payloads of the current flight, as handed to the record layer.
    pub fn flight(&self) -> &Flight {
        &self.flight
    }

    fn begin_flight_if_needed(&mut self, state: &ConnectionState) {
        if self.flight_done {
            self.flight.clear();
            self.timer = state.config().dtls_retransmit_timeout.map(RetransmitTimer::new);
            self.flight_done = false;
        }
    }

    fn transmit(
        &mut self,
        content_type: u8,
        bytes: Vec<u8>,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        self.flight.push(content_type, bytes.clone());
        let (next, rest) = next_layer(lower, LayerType::DtlsFragment)?;
        next.send_data(LayerData::new(content_type, bytes), rest, state)?;
        if let Some(timer) = &mut self.timer {
            timer.arm(Instant::now());
        }
        Ok(())
    }

    /// Compute, encode, transmit and apply one fragment-family unit.
    fn emit(
        &mut self,
        mut unit: Box<dyn ProtocolUnit>,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let bytes = match unit.compute_defaults(state).and_then(|()| unit.encode()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(unit = unit.name(), error = %err, "fragment not sent");
                self.processed.error(&err);
                return Ok(());
            }
        };
        self.transmit(ContentType::HANDSHAKE.0, bytes, lower, state)?;
        if let Err(err) = unit.apply(state, Origin::Sent) {
            self.processed.error(&err);
        }
        self.processed.push(unit);
        Ok(())
    }

    /// Fragment a TLS-form handshake message under the next send sequence
    /// number.
    fn send_handshake(
        &mut self,
        message: &[u8],
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let msg_type = message[0];
        let body = &message[HANDSHAKE_HEADER_LEN..];
        let message_seq = state.counters().dtls_next_send_message_seq;
        {
            let counters = state.counters_mut();
            counters.dtls_next_send_message_seq = message_seq.wrapping_add(1);
        }
        let max = state.config().dtls_max_fragment_length;
        let pieces = split(
            HandshakeType(msg_type).kind(),
            u64::from(message_seq),
            body,
            max,
        );
        debug!(msg_type, message_seq, fragments = pieces.len(), "fragmenting handshake message");
        for piece in &pieces {
            let generated = DtlsHandshakeFragment::from_fragment(msg_type, message_seq, piece);
            let unit: Box<dyn ProtocolUnit> = match self.take_template() {
                Some(mut template) => {
                    if let Some(fragment) = template.downcast_mut::<DtlsHandshakeFragment>() {
                        adopt(fragment, generated);
                    }
                    template
                }
                None => Box::new(generated),
            };
            self.emit(unit, lower, state)?;
        }
        Ok(())
    }

    fn take_template(&mut self) -> Option<Box<dyn ProtocolUnit>> {
        let pos = self
            .staged
            .iter()
            .position(|u| u.is::<DtlsHandshakeFragment>())?;
        Some(self.staged.remove(pos))
    }

    /// Pull one payload from below and process it, resending the flight
    /// whenever its timer fires first. Returns `false` on timeout.
    fn pull(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        let wait_until = match self.timer.as_ref().and_then(RetransmitTimer::deadline) {
            Some(resend_at) if resend_at < deadline => resend_at,
            _ => deadline,
        };
        let (next, rest) = next_layer(lower, LayerType::DtlsFragment)?;
        let Some(data) = next.receive_data(wait_until, rest, state)? else {
            let now = Instant::now();
            if now < deadline && self.timer.as_ref().is_some_and(|t| t.is_expired(now)) {
                if !self.retransmit(lower, state)? {
                    self.timer = None;
                }
                return Ok(true);
            }
            return Ok(false);
        };
        self.flight_done = true;
        if let Some(timer) = &mut self.timer {
            timer.reset();
        }
        if data.content_type == ContentType::HANDSHAKE.0 {
            self.receive_fragments(&data.bytes, state);
        } else {
            self.delivered.push_back(data);
        }
        Ok(true)
    }

    fn receive_fragments(&mut self, bytes: &[u8], state: &mut ConnectionState) {
        let mut units: Vec<(Box<dyn ProtocolUnit>, &[u8])> = Vec::new();
        {
            let mut r = Reader::new(DtlsHandshakeFragment::NAME, bytes);
            while !r.is_empty() {
                let start = r.position();
                match state
                    .registry()
                    .decode_from(DtlsHandshakeFragment::KIND, &mut r, state)
                {
                    Ok(unit) => units.push((unit, &bytes[start..r.position()])),
                    Err(err) => {
                        debug!(error = %err, "undecodable handshake fragment");
                        units.push((
                            Box::new(OpaqueUnit::undecodable(
                                DtlsHandshakeFragment::KIND,
                                bytes[start..].to_vec(),
                                &err,
                            )),
                            &[],
                        ));
                        break;
                    }
                }
            }
        }
        for (unit, raw) in units {
            if let Some(fragment) = unit.downcast_ref::<DtlsHandshakeFragment>() {
                let placed = fragment
                    .to_fragment()
                    .and_then(|piece| self.place(piece, state));
                if let Err(err) = placed {
                    debug!(error = %err, "fragment kept as opaque");
                    self.processed.error(&err);
                    self.processed.push(Box::new(OpaqueUnit::undecodable(
                        DtlsHandshakeFragment::KIND,
                        raw.to_vec(),
                        &err,
                    )));
                    continue;
                }
            }
            if let Err(err) = unit.apply(state, Origin::Received) {
                self.processed.error(&err);
            }
            self.processed.push(unit);
        }
        self.deliver_ready(state);
    }

    /// Buffer one fragment. Fragments outside the reassembly window or
    /// length cap are refused.
    fn place(&mut self, piece: Fragment, state: &ConnectionState) -> Result<(), EngineError> {
        let message_seq = piece.sequence as u16;
        let next = state.counters().dtls_next_receive_message_seq;
        if message_seq < next {
            debug!(message_seq, "fragment of an already delivered message");
            return Ok(());
        }
        if message_seq - next >= MAX_PENDING_MESSAGES {
            return Err(EngineError::Layer(format!(
                "message_seq {message_seq} is beyond the reassembly window at {next}"
            )));
        }
        if piece.total_length > MAX_MESSAGE_LEN || piece.end() > MAX_MESSAGE_LEN {
            return Err(EngineError::Layer(format!(
                "message {message_seq} exceeds {MAX_MESSAGE_LEN} bytes"
            )));
        }
        let policy = state.config().overlap_policy;
        let buffer = self.reassembly.entry(message_seq).or_insert_with(|| {
            ReassemblyBuffer::new(piece.kind, piece.sequence, piece.total_length, policy)
        });
        if buffer.kind() != piece.kind {
            warn!(message_seq, "fragments of one message disagree on msg_type");
        }
        if let Err(err) = buffer.insert(piece.offset, &piece.payload) {
            warn!(message_seq, error = %err, "fragment rejected");
            self.processed.error(&err);
        }
        Ok(())
    }

    /// Hand up every complete message whose turn has come.
    fn deliver_ready(&mut self, state: &mut ConnectionState) {
        loop {
            let seq = state.counters().dtls_next_receive_message_seq;
            if !self.reassembly.get(&seq).is_some_and(|b| b.is_complete()) {
                return;
            }
            let Some(buffer) = self.reassembly.remove(&seq) else {
                return;
            };
            match buffer.finish() {
                Ok(message) => {
                    for conflict in &message.conflicts {
                        warn!(?conflict, "overlapping fragments disagreed");
                    }
                    let mut tls = Vec::with_capacity(HANDSHAKE_HEADER_LEN + message.bytes.len());
                    tls.push(message.kind.code as u8);
                    put_u24(&mut tls, message.bytes.len() as u32);
                    tls.extend_from_slice(&message.bytes);
                    self.delivered
                        .push_back(LayerData::new(ContentType::HANDSHAKE.0, tls));
                }
                Err(err) => self.processed.error(&err),
            }
            let counters = state.counters_mut();
            counters.dtls_next_receive_message_seq = seq.wrapping_add(1);
        }
    }
}

/// Give `template` the generated value of every field it leaves unset.
fn adopt(template: &mut DtlsHandshakeFragment, generated: DtlsHandshakeFragment) {
    macro_rules! take {
        ($($field:ident),*) => {
            $(
                if template.$field.value().is_none() {
                    if let Some(v) = generated.$field.get() {
                        template.$field.set(v);
                    }
                }
            )*
        };
    }
    take!(msg_type, length, message_seq, fragment_offset, fragment_length, body);
}

impl Default for DtlsFragmentLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolLayer for DtlsFragmentLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::DtlsFragment
    }

    fn owns(&self, family: UnitFamily) -> bool {
        family == UnitFamily::DtlsFragment
    }

    fn send_units(
        &mut self,
        units: Vec<Box<dyn ProtocolUnit>>,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        self.begin_flight_if_needed(state);
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
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(());
        }
        self.send_units(staged, lower, state)
    }

    fn send_data(
        &mut self,
        data: LayerData,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        self.begin_flight_if_needed(state);
        if data.content_type == ContentType::HANDSHAKE.0
            && data.bytes.len() >= HANDSHAKE_HEADER_LEN
        {
            self.send_handshake(&data.bytes, lower, state)
        } else {
            self.transmit(data.content_type, data.bytes, lower, state)
        }
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
        self.processed = LayerResult::new(LayerType::DtlsFragment);
        self.staged.clear();
    }

    fn take_processed(&mut self) -> LayerResult {
        std::mem::replace(&mut self.processed, LayerResult::new(LayerType::DtlsFragment))
    }

    fn drain_partial(&mut self) {
        let mut pending: Vec<u16> = self.reassembly.keys().copied().collect();
        pending.sort_unstable();
        for seq in pending {
            if let Some(buffer) = self.reassembly.remove(&seq) {
                debug!(
                    message_seq = seq,
                    missing = buffer.missing(),
                    "incomplete message surfaced as opaque"
                );
                self.processed.push(opaque(
                    UnitFamily::DtlsFragment,
                    buffer.partial_bytes().to_vec(),
                ));
            }
        }
    }

    fn retransmit(
        &mut self,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        if self.flight.is_empty() {
            return Ok(false);
        }
        if state.retransmissions_exhausted() {
            debug!(records = self.flight.len(), "retransmission budget spent");
            return Ok(false);
        }
        let (next, rest) = next_layer(lower, LayerType::DtlsFragment)?;
        for (content_type, bytes) in self.flight.entries() {
            next.send_data(LayerData::new(*content_type, bytes.clone()), rest, state)?;
        }
        if let Some(timer) = &mut self.timer {
            timer.backoff(Instant::now());
        }
        let counters = state.counters_mut();
        counters.dtls_flight_retransmissions += 1;
        debug!(
            records = self.flight.len(),
            attempt = counters.dtls_flight_retransmissions,
            next_timeout = ?self.timer.as_ref().map(RetransmitTimer::timeout),
            "flight retransmitted"
        );
        Ok(true)
    }
}
