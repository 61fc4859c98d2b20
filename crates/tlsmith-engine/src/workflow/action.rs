//! Scripted workflow steps and their normalization against connection state.

use std::time::Duration;

use tlsmith_types::SkipSignal;

use crate::handshake::{ClientKeyExchange, ServerKeyExchange};
use crate::layer::{LayerConfiguration, LayerType, ReceivePolicy};
use crate::state::ConnectionState;
use crate::unit::{ProtocolUnit, UnitKind};
use crate::Role;

/// Chooses a unit when the action is normalized rather than when the trace
/// is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSelector {
    /// A default instance of a registered kind.
    Kind(UnitKind),
    /// The key exchange message of the negotiated version and role.
    KeyExchange,
}

impl UnitSelector {
    fn select(self, state: &ConnectionState) -> Result<Box<dyn ProtocolUnit>, SkipSignal> {
        match self {
            Self::Kind(kind) => state
                .registry()
                .create(kind)
                .map_err(|err| SkipSignal::new(err.to_string())),
            Self::KeyExchange => {
                if state.is_tls13() {
                    return Err(SkipSignal::new("no key exchange message in TLS 1.3"));
                }
                Ok(match state.role() {
                    Role::Client => Box::new(ClientKeyExchange::default()),
                    Role::Server => Box::new(ServerKeyExchange::default()),
                })
            }
        }
    }
}

/// One scripted step of a workflow trace.
#[derive(Debug, Clone)]
pub enum WorkflowAction {
    Send { configurations: Vec<LayerConfiguration> },
    Receive { configurations: Vec<LayerConfiguration> },
    /// Units chosen from connection state at execution time.
    DynamicSend {
        layer: LayerType,
        selectors: Vec<UnitSelector>,
    },
    /// Resend the last DTLS flight.
    ResendFlight,
    Wait(Duration),
}

/// An action resolved against the current connection state.
#[derive(Debug, Clone)]
pub enum NormalizedAction {
    Send(Vec<LayerConfiguration>),
    Receive(Vec<LayerConfiguration>),
    ResendFlight,
    Wait(Duration),
}

impl NormalizedAction {
    /// The configurations the executed action is compared against.
    pub fn plan(&self) -> &[LayerConfiguration] {
        match self {
            Self::Send(configs) | Self::Receive(configs) => configs,
            Self::ResendFlight | Self::Wait(_) => &[],
        }
    }
}

impl WorkflowAction {
    pub fn send(layer: LayerType, units: Vec<Box<dyn ProtocolUnit>>) -> Self {
        Self::Send {
            configurations: vec![LayerConfiguration::send(layer, units)],
        }
    }

    pub fn receive(layer: LayerType, expected: Vec<UnitKind>) -> Self {
        Self::Receive {
            configurations: vec![LayerConfiguration::receive(layer, expected)],
        }
    }

    pub fn receive_with(layer: LayerType, expected: Vec<UnitKind>, policy: ReceivePolicy) -> Self {
        Self::Receive {
            configurations: vec![LayerConfiguration::receive_with(layer, expected, policy)],
        }
    }

    pub fn dynamic_send(layer: LayerType, selectors: Vec<UnitSelector>) -> Self {
        Self::DynamicSend { layer, selectors }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "Send",
            Self::Receive { .. } => "Receive",
            Self::DynamicSend { .. } => "DynamicSend",
            Self::ResendFlight => "ResendFlight",
            Self::Wait(_) => "Wait",
        }
    }

    /// Resolve the action against `state`. A `SkipSignal` means the action
    /// does not apply to this connection and is passed over.
    pub fn normalize(&self, state: &ConnectionState) -> Result<NormalizedAction, SkipSignal> {
        match self {
            Self::Send { configurations } => Ok(NormalizedAction::Send(configurations.clone())),
            Self::Receive { configurations } => {
                Ok(NormalizedAction::Receive(configurations.clone()))
            }
            Self::DynamicSend { layer, selectors } => {
                let units = selectors
                    .iter()
                    .map(|s| s.select(state))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(NormalizedAction::Send(vec![LayerConfiguration::send(
                    *layer, units,
                )]))
            }
            Self::ResendFlight => {
                if !state.is_dtls() {
                    return Err(SkipSignal::new("flights are only resent over DTLS"));
                }
                if state.retransmissions_exhausted() {
                    return Err(SkipSignal::new(format!(
                        "retransmission limit of {} reached",
                        state.config().dtls_max_retransmissions
                    )));
                }
                Ok(NormalizedAction::ResendFlight)
            }
            Self::Wait(duration) => Ok(NormalizedAction::Wait(*duration)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::handshake::HandshakeType;
    use crate::unit::RegisteredUnit;
    use tlsmith_types::ProtocolVersion;

    #[test]
    fn test_key_exchange_skipped_under_tls13() {
        let state = ConnectionState::new(EngineConfig::default());
        assert!(state.is_tls13());
        let action = WorkflowAction::dynamic_send(LayerType::Message, vec![UnitSelector::KeyExchange]);
        let skip = action.normalize(&state).unwrap_err();
        assert!(skip.reason.contains("TLS 1.3"));
    }

    #[test]
    fn test_key_exchange_selected_by_role() {
        let config = EngineConfig::builder()
            .supported_versions(&[ProtocolVersion::TLS12])
            .build()
            .unwrap();
        let client = ConnectionState::new(config.clone());
        let server = ConnectionState::new(config.with_role(Role::Server));
        let action = WorkflowAction::dynamic_send(
            LayerType::Message,
            vec![UnitSelector::KeyExchange, UnitSelector::Kind(HandshakeType::FINISHED.kind())],
        );

        let plan = action.normalize(&client).unwrap();
        assert_eq!(
            plan.plan()[0].planned_kinds(),
            [ClientKeyExchange::KIND, HandshakeType::FINISHED.kind()]
        );
        let plan = action.normalize(&server).unwrap();
        assert_eq!(plan.plan()[0].planned_kinds()[0], ServerKeyExchange::KIND);
    }

    #[test]
    fn test_unregistered_kind_is_skipped() {
        let state = ConnectionState::new(EngineConfig::default());
        let action = WorkflowAction::dynamic_send(
            LayerType::Message,
            vec![UnitSelector::Kind(HandshakeType(99).kind())],
        );
        assert!(action.normalize(&state).is_err());
    }

    #[test]
    fn test_resend_flight_requires_dtls_and_budget() {
        let tls = ConnectionState::new(EngineConfig::default());
        assert!(WorkflowAction::ResendFlight.normalize(&tls).is_err());

        let config = EngineConfig::builder()
            .supported_versions(&[ProtocolVersion::DTLS12])
            .dtls_max_retransmissions(1)
            .build()
            .unwrap();
        let mut dtls = ConnectionState::new(config);
        assert!(matches!(
            WorkflowAction::ResendFlight.normalize(&dtls),
            Ok(NormalizedAction::ResendFlight)
        ));
        dtls.counters_mut().dtls_flight_retransmissions = 1;
        let skip = WorkflowAction::ResendFlight.normalize(&dtls).unwrap_err();
        assert!(skip.reason.contains("limit"));
    }
}
