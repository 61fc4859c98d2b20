//! Per-layer instructions for one action and their success predicates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::LayerType;
use crate::unit::{ProtocolUnit, UnitKind};

/// When a receive stops, and what counts as success. Both predicates are
/// pure functions of the processed kind list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceivePolicy {
    /// Receive as many units as expected; succeed on an exact match.
    Expected,
    /// Like `Expected`, but stop as soon as a unit deviates.
    StopAtFirstMismatch,
    /// Exactly one unit, of the first expected kind if one is given.
    ExactlyOne,
    /// Any number of units until the line goes quiet; succeed if every unit
    /// is of an expected kind.
    AnyNumber,
    /// Receive until a unit of this kind arrives.
    Until(UnitKind),
    /// Receive until the line goes quiet; succeed on an exact match when
    /// kinds are expected, always otherwise.
    UntilNoMoreData,
}

impl ReceivePolicy {
    /// Whether the receive loop can stop without waiting for more units.
    pub fn is_finished(&self, expected: &[UnitKind], processed: &[UnitKind]) -> bool {
        match self {
            Self::Expected => processed.len() >= expected.len(),
            Self::StopAtFirstMismatch => {
                processed.len() >= expected.len()
                    || processed.iter().zip(expected).any(|(p, e)| p != e)
            }
            Self::ExactlyOne => !processed.is_empty(),
            Self::AnyNumber | Self::UntilNoMoreData => false,
            Self::Until(kind) => processed.contains(kind),
        }
    }

    pub fn is_satisfied(&self, expected: &[UnitKind], processed: &[UnitKind]) -> bool {
        match self {
            Self::Expected | Self::StopAtFirstMismatch => processed == expected,
            Self::ExactlyOne => {
                processed.len() == 1 && expected.first().map_or(true, |e| *e == processed[0])
            }
            Self::AnyNumber => {
                expected.is_empty() || processed.iter().all(|p| expected.contains(p))
            }
            Self::Until(kind) => processed.contains(kind),
            Self::UntilNoMoreData => expected.is_empty() || processed == expected,
        }
    }

    /// Policies that only end when nothing more arrives. Their timeout is an
    /// idle timeout, restarted after every unit.
    pub fn is_open_ended(&self) -> bool {
        matches!(self, Self::AnyNumber | Self::UntilNoMoreData)
    }
}

/// Declarative instruction for one layer in one action.
#[derive(Debug, Clone)]
pub enum LayerConfiguration {
    /// Send these units through the layer. On a layer beneath the top-most
    /// configured one the units serve as framing templates.
    Send {
        layer: LayerType,
        units: Vec<Box<dyn ProtocolUnit>>,
    },
    Receive {
        layer: LayerType,
        expected: Vec<UnitKind>,
        policy: ReceivePolicy,
        /// Falls back to the configured receive timeout.
        timeout: Option<Duration>,
    },
}

impl LayerConfiguration {
    pub fn send(layer: LayerType, units: Vec<Box<dyn ProtocolUnit>>) -> Self {
        Self::Send { layer, units }
    }

    /// Receive exactly the `expected` kinds, in order.
    pub fn receive(layer: LayerType, expected: Vec<UnitKind>) -> Self {
        Self::Receive {
            layer,
            expected,
            policy: ReceivePolicy::Expected,
            timeout: None,
        }
    }

    pub fn receive_with(layer: LayerType, expected: Vec<UnitKind>, policy: ReceivePolicy) -> Self {
        Self::Receive {
            layer,
            expected,
            policy,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, value: Duration) -> Self {
        if let Self::Receive { timeout, .. } = &mut self {
            *timeout = Some(value);
        }
        self
    }

    pub fn layer(&self) -> LayerType {
        match self {
            Self::Send { layer, .. } | Self::Receive { layer, .. } => *layer,
        }
    }

    pub fn is_send(&self) -> bool {
        matches!(self, Self::Send { .. })
    }

    /// Kinds the action plans to process on this layer.
    pub fn planned_kinds(&self) -> Vec<UnitKind> {
        match self {
            Self::Send { units, .. } => units.iter().map(|u| u.kind()).collect(),
            Self::Receive { expected, .. } => expected.clone(),
        }
    }

    /// Success predicate over what the layer actually processed. A send
    /// succeeds when the configured units went out first, in order; framing
    /// the layer added afterwards does not count against it.
    pub fn is_satisfied(&self, processed: &[UnitKind]) -> bool {
        match self {
            Self::Send { units, .. } => {
                processed.len() >= units.len()
                    && units.iter().zip(processed).all(|(u, p)| u.kind() == *p)
            }
            Self::Receive {
                expected, policy, ..
            } => policy.is_satisfied(expected, processed),
        }
    }
}
