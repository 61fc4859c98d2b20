//! Layers and the layer stack.
//!
//! A layer owns one unit family. Sending computes, encodes and frames its
//! units for the layer beneath; receiving pulls deframed bytes from the layer
//! beneath, decodes them into its own units and applies each to connection
//! state in wire order. Every layer records what it processed during the
//! current action, whichever layer the action addressed.
//!
//! Layers are stored top first. A layer reaches the layers beneath it through
//! the `lower` slice, whose first element is the layer directly below; the
//! bottom layer gets an empty slice.

mod configuration;
mod dtls;
mod http;
mod message;
mod quic;
mod record;
mod stack;
mod transport;

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tlsmith_types::EngineError;
use tracing::debug;

use crate::state::ConnectionState;
use crate::unit::{OpaqueUnit, ProtocolUnit, UnitFamily, UnitKind};

pub use configuration::{LayerConfiguration, ReceivePolicy};
pub use dtls::DtlsFragmentLayer;
pub use http::HttpLayer;
pub use message::MessageLayer;
pub use quic::QuicFrameLayer;
pub use record::RecordLayer;
pub use stack::LayerStack;
pub use transport::TransportLayer;

/// Layer identity, used to address a layer in a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    Transport,
    Record,
    DtlsFragment,
    Message,
    Http,
    QuicFrame,
}

/// Deframed bytes handed between adjacent layers. `content_type` is the
/// record content type where one exists and 0 otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerData {
    pub content_type: u8,
    pub bytes: Vec<u8>,
}

impl LayerData {
    pub fn new(content_type: u8, bytes: Vec<u8>) -> Self {
        Self {
            content_type,
            bytes,
        }
    }
}

/// What one layer processed during one action, in processing order.
#[derive(Debug, Clone)]
pub struct LayerResult {
    pub layer: LayerType,
    pub units: Vec<Box<dyn ProtocolUnit>>,
    /// Unit-level failures converted at the layer boundary.
    pub errors: Vec<String>,
}

impl LayerResult {
    pub fn new(layer: LayerType) -> Self {
        Self {
            layer,
            units: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn kinds(&self) -> Vec<UnitKind> {
        self.units.iter().map(|u| u.kind()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub(crate) fn push(&mut self, unit: Box<dyn ProtocolUnit>) {
        self.units.push(unit);
    }

    pub(crate) fn error(&mut self, err: &EngineError) {
        self.errors.push(err.to_string());
    }
}

/// One stage of a layer stack.
pub trait ProtocolLayer: Send + fmt::Debug {
    fn layer_type(&self) -> LayerType;

    /// Whether units of `family` are sent and received by this layer.
    fn owns(&self, family: UnitFamily) -> bool;

    /// Compute defaults for, encode and send each unit, then apply it as
    /// sent. A unit that cannot be built is logged and skipped.
    fn send_units(
        &mut self,
        units: Vec<Box<dyn ProtocolUnit>>,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError>;

    /// Keep `units` as templates for framing the next bytes handed down by
    /// the layer above.
    fn stage_units(&mut self, units: Vec<Box<dyn ProtocolUnit>>);

    /// Send the staged templates no data from above consumed.
    fn flush_staged(
        &mut self,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError>;

    /// Frame bytes from the layer above and pass them down.
    fn send_data(
        &mut self,
        data: LayerData,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError>;

    /// The next deframed payload for the layer above, or `None` when
    /// nothing arrives before `deadline`.
    fn receive_data(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<Option<LayerData>, EngineError>;

    /// Receive, decode and apply at least one unit of this layer. Returns
    /// `false` when nothing arrived before `deadline`.
    fn receive_unit(
        &mut self,
        deadline: Instant,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError>;

    /// Units processed so far in the current action.
    fn processed(&self) -> &LayerResult;

    /// Start recording a new action.
    fn begin_action(&mut self);

    /// Hand over what was processed in the current action.
    fn take_processed(&mut self) -> LayerResult;

    /// Turn buffered bytes that never formed a complete frame into opaque
    /// units.
    fn drain_partial(&mut self) {}

    /// Resend the last flight. Returns `false` when this layer keeps no
    /// flight.
    fn retransmit(
        &mut self,
        _lower: &mut [Box<dyn ProtocolLayer>],
        _state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        Ok(false)
    }

    /// Release any handle this layer holds. Idempotent.
    fn close(&mut self) {}

    /// Receive units until `policy` is finished or `timeout` elapses. For
    /// open-ended policies the timeout restarts after every unit. Returns
    /// `true` when the receive ended on the timeout.
    fn receive_units(
        &mut self,
        policy: &ReceivePolicy,
        expected: &[UnitKind],
        timeout: Duration,
        lower: &mut [Box<dyn ProtocolLayer>],
        state: &mut ConnectionState,
    ) -> Result<bool, EngineError> {
        let mut deadline = Instant::now() + timeout;
        loop {
            if policy.is_finished(expected, &self.processed().kinds()) {
                return Ok(false);
            }
            if !self.receive_unit(deadline, lower, state)? {
                debug!(layer = ?self.layer_type(), received = self.processed().units.len(), "receive timed out");
                return Ok(true);
            }
            if policy.is_open_ended() {
                deadline = Instant::now() + timeout;
            }
        }
    }
}

/// Split `lower` into the layer directly beneath and the rest.
pub(crate) fn next_layer<'a>(
    lower: &'a mut [Box<dyn ProtocolLayer>],
    caller: LayerType,
) -> Result<(&'a mut Box<dyn ProtocolLayer>, &'a mut [Box<dyn ProtocolLayer>]), EngineError> {
    lower
        .split_first_mut()
        .ok_or_else(|| EngineError::Layer(format!("{caller:?} layer has no layer beneath")))
}

/// Time left until `deadline`, or `None` once it has passed.
pub(crate) fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
}

/// Bytes that will never complete a frame, recorded as an opaque unit.
pub(crate) fn opaque(family: UnitFamily, bytes: Vec<u8>) -> Box<dyn ProtocolUnit> {
    Box::new(OpaqueUnit::new(family, bytes))
}
