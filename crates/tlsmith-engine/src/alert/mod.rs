//! TLS alert protocol.

use tlsmith_types::EngineError;
use tracing::debug;

use crate::state::ConnectionState;
use crate::unit::{
    Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitFamily, UnitKind, UnitRegistry,
};

/// Alert severity level. Open newtype so that invalid levels can be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertLevel(pub u8);

impl AlertLevel {
    pub const WARNING: Self = Self(1);
    pub const FATAL: Self = Self(2);
}

/// Alert description codes (RFC 8446 Section 6, plus legacy codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertDescription(pub u8);

impl AlertDescription {
    pub const CLOSE_NOTIFY: Self = Self(0);
    pub const UNEXPECTED_MESSAGE: Self = Self(10);
    pub const BAD_RECORD_MAC: Self = Self(20);
    pub const RECORD_OVERFLOW: Self = Self(22);
    pub const HANDSHAKE_FAILURE: Self = Self(40);
    pub const BAD_CERTIFICATE: Self = Self(42);
    pub const UNSUPPORTED_CERTIFICATE: Self = Self(43);
    pub const CERTIFICATE_EXPIRED: Self = Self(45);
    pub const CERTIFICATE_UNKNOWN: Self = Self(46);
    pub const ILLEGAL_PARAMETER: Self = Self(47);
    pub const UNKNOWN_CA: Self = Self(48);
    pub const DECODE_ERROR: Self = Self(50);
    pub const DECRYPT_ERROR: Self = Self(51);
    pub const PROTOCOL_VERSION: Self = Self(70);
    pub const INSUFFICIENT_SECURITY: Self = Self(71);
    pub const INTERNAL_ERROR: Self = Self(80);
    pub const INAPPROPRIATE_FALLBACK: Self = Self(86);
    pub const USER_CANCELED: Self = Self(90);
    pub const MISSING_EXTENSION: Self = Self(109);
    pub const UNSUPPORTED_EXTENSION: Self = Self(110);
    pub const UNRECOGNIZED_NAME: Self = Self(112);
    pub const CERTIFICATE_REQUIRED: Self = Self(116);
    pub const NO_APPLICATION_PROTOCOL: Self = Self(120);
}

/// A TLS alert. Defaults come from the configured alert.
#[derive(Debug, Clone, Default)]
pub struct Alert {
    pub level: Field<u8>,
    pub description: Field<u8>,
}

impl Alert {
    pub fn new(level: AlertLevel, description: AlertDescription) -> Self {
        Self {
            level: Field::with_value(level.0),
            description: Field::with_value(description.0),
        }
    }

    pub fn close_notify() -> Self {
        Self::new(AlertLevel::WARNING, AlertDescription::CLOSE_NOTIFY)
    }
}

impl RegisteredUnit for Alert {
    const KIND: UnitKind = UnitKind::new(UnitFamily::Alert, 0);
    const NAME: &'static str = "Alert";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let level = r.read_u8("level")?;
        let description = r.read_u8("description")?;
        Ok(Self {
            level: Field::with_value(level),
            description: Field::with_value(description),
        })
    }
}

impl ProtocolUnit for Alert {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        let (level, description) = state.config().default_alert;
        self.level.fill(|| level);
        self.description.fill(|| description);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        Ok(vec![
            self.level.require(Self::NAME, "level")?,
            self.description.require(Self::NAME, "description")?,
        ])
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let alert = self.level.get().zip(self.description.get());
            debug!(?alert, "alert received");
            state.record_negotiated("last_alert", |n| n.last_alert = alert);
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

pub(crate) fn register(registry: &mut UnitRegistry) {
    registry.register(Alert::registration());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn test_alert_defaults_from_config() {
        let state = ConnectionState::new(
            EngineConfig::builder()
                .default_alert(2, AlertDescription::HANDSHAKE_FAILURE.0)
                .build()
                .unwrap(),
        );
        let mut alert = Alert::default();
        alert.compute_defaults(&state).unwrap();
        assert_eq!(alert.encode().unwrap(), [2, 40]);

        let mut explicit = Alert::close_notify();
        explicit.compute_defaults(&state).unwrap();
        assert_eq!(explicit.encode().unwrap(), [1, 0]);
    }

    #[test]
    fn test_received_alert_recorded() {
        let mut state = ConnectionState::new(EngineConfig::default());
        let alert = state.registry().decode(Alert::KIND, &[2, 80], &state).unwrap();
        alert.apply(&mut state, Origin::Received).unwrap();
        assert_eq!(state.negotiated().last_alert, Some((2, 80)));
    }

    #[test]
    fn test_short_alert_is_malformed() {
        let state = ConnectionState::new(EngineConfig::default());
        let err = state.registry().decode(Alert::KIND, &[2], &state).unwrap_err();
        assert!(matches!(
            err,
            EngineError::MalformedUnit {
                field: "description",
                offset: 1,
                ..
            }
        ));
    }
}
