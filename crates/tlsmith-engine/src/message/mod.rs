//! ChangeCipherSpec and ApplicationData payload units.

use tlsmith_types::EngineError;

use crate::state::ConnectionState;
use crate::unit::{
    Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitFamily, UnitKind, UnitRegistry,
};

/// ChangeCipherSpec (RFC 5246 Section 7.1); a single byte, normally 1.
#[derive(Debug, Clone, Default)]
pub struct ChangeCipherSpec {
    pub value: Field<u8>,
}

impl RegisteredUnit for ChangeCipherSpec {
    const KIND: UnitKind = UnitKind::new(UnitFamily::ChangeCipherSpec, 0);
    const NAME: &'static str = "ChangeCipherSpec";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        Ok(Self {
            value: Field::with_value(r.read_u8("type")?),
        })
    }
}

impl ProtocolUnit for ChangeCipherSpec {
    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        self.value.fill(|| 1);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        Ok(vec![self.value.require(Self::NAME, "type")?])
    }

    /// Before TLS 1.3 the message starts a new epoch in its direction. The
    /// records themselves stay in the clear.
    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        let new_epoch = !state.is_tls13();
        if origin == Origin::Received {
            state.record_negotiated("peer_sent_change_cipher_spec", |n| {
                n.peer_sent_change_cipher_spec = true
            });
        }
        if new_epoch {
            let counters = state.counters_mut();
            match origin {
                Origin::Sent => {
                    counters.write_epoch = counters.write_epoch.wrapping_add(1);
                    counters.write_sequence = 0;
                }
                Origin::Received => {
                    counters.read_epoch = counters.read_epoch.wrapping_add(1);
                    counters.read_sequence = 0;
                }
            }
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// Opaque application payload.
#[derive(Debug, Clone, Default)]
pub struct ApplicationData {
    pub data: Field<Vec<u8>>,
}

impl ApplicationData {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Field::with_value(data.into()),
        }
    }
}

impl RegisteredUnit for ApplicationData {
    const KIND: UnitKind = UnitKind::new(UnitFamily::ApplicationData, 0);
    const NAME: &'static str = "ApplicationData";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        Ok(Self::new(r.read_rest()))
    }
}

impl ProtocolUnit for ApplicationData {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.data
            .fill(|| state.config().default_application_data.clone());
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.data.require(Self::NAME, "data")
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let data = self.data.get().unwrap_or_default();
            state.record_negotiated("received_application_data", |n| {
                n.received_application_data.extend_from_slice(&data)
            });
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

pub(crate) fn register(registry: &mut UnitRegistry) {
    registry.register(ChangeCipherSpec::registration());
    registry.register(ApplicationData::registration());
}
