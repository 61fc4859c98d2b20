//! Planned actions and what actually happened when they ran.

use std::time::Duration;

use serde::Serialize;

use super::action::WorkflowAction;
use crate::layer::{LayerConfiguration, LayerResult, LayerType};
use crate::unit::UnitKind;

/// How one action ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ActionOutcome {
    Executed,
    /// The action did not apply to this connection.
    Skipped { reason: String },
    /// The transport became unusable; the trace was aborted here.
    TransportFailure { reason: String },
}

impl ActionOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// The recorded execution of one action.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub index: usize,
    pub outcome: ActionOutcome,
    /// Configurations the action resolved to before it ran.
    pub plan: Vec<LayerConfiguration>,
    /// Units every layer processed, top of the stack first.
    pub results: Vec<LayerResult>,
    /// Failures that ended the action early without aborting the trace.
    pub errors: Vec<String>,
    pub as_planned: bool,
    pub elapsed: Duration,
}

impl TraceEntry {
    pub fn result(&self, layer: LayerType) -> Option<&LayerResult> {
        self.results.iter().find(|r| r.layer == layer)
    }

    /// Kinds processed by `layer`; empty when the layer saw nothing.
    pub fn kinds(&self, layer: LayerType) -> Vec<UnitKind> {
        self.result(layer).map(LayerResult::kinds).unwrap_or_default()
    }

    /// Whether every planned configuration is satisfied by what its layer
    /// processed.
    pub(crate) fn matches_plan(plan: &[LayerConfiguration], results: &[LayerResult]) -> bool {
        plan.iter().all(|config| {
            let processed = results
                .iter()
                .find(|r| r.layer == config.layer())
                .map(LayerResult::kinds)
                .unwrap_or_default();
            config.is_satisfied(&processed)
        })
    }
}

/// An ordered script of actions plus, once executed, one entry per action
/// that ran.
#[derive(Debug, Clone, Default)]
pub struct WorkflowTrace {
    actions: Vec<WorkflowAction>,
    entries: Vec<TraceEntry>,
}

impl WorkflowTrace {
    pub fn new(actions: Vec<WorkflowAction>) -> Self {
        Self {
            actions,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, action: WorkflowAction) {
        self.actions.push(action);
    }

    pub fn with(mut self, action: WorkflowAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn actions(&self) -> &[WorkflowAction] {
        &self.actions
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub(crate) fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    /// Forget recorded outcomes so the trace can run again.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// True when every action ran and each one that was not skipped matched
    /// its plan.
    pub fn executed_as_planned(&self) -> bool {
        self.entries.len() == self.actions.len()
            && self
                .entries
                .iter()
                .all(|e| e.outcome.is_skipped() || e.as_planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{ClientHello, HandshakeType};
    use crate::layer::ReceivePolicy;

    fn entry(outcome: ActionOutcome, as_planned: bool) -> TraceEntry {
        TraceEntry {
            index: 0,
            outcome,
            plan: Vec::new(),
            results: Vec::new(),
            errors: Vec::new(),
            as_planned,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_matches_plan_per_layer() {
        let plan = vec![LayerConfiguration::receive_with(
            LayerType::Message,
            vec![HandshakeType::CLIENT_HELLO.kind()],
            ReceivePolicy::ExactlyOne,
        )];
        let mut message = LayerResult::new(LayerType::Message);
        assert!(!TraceEntry::matches_plan(&plan, &[message.clone()]));
        message.push(Box::new(ClientHello::default()));
        assert!(TraceEntry::matches_plan(&plan, &[message.clone()]));
        assert!(!TraceEntry::matches_plan(&plan, &[]));
        message.push(Box::new(ClientHello::default()));
        assert!(!TraceEntry::matches_plan(&plan, &[message]));
    }

    #[test]
    fn test_skipped_actions_do_not_count() {
        let mut trace = WorkflowTrace::new(vec![WorkflowAction::ResendFlight])
            .with(WorkflowAction::Wait(Duration::ZERO));
        assert!(!trace.executed_as_planned());
        trace.record(entry(
            ActionOutcome::Skipped {
                reason: "not DTLS".into(),
            },
            false,
        ));
        assert!(!trace.executed_as_planned());
        trace.record(entry(ActionOutcome::Executed, true));
        assert!(trace.executed_as_planned());

        trace.reset();
        assert!(trace.entries().is_empty());
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn test_transport_failure_is_never_as_planned() {
        let mut trace = WorkflowTrace::new(vec![WorkflowAction::Wait(Duration::ZERO)]);
        trace.record(entry(
            ActionOutcome::TransportFailure {
                reason: "closed".into(),
            },
            false,
        ));
        assert!(!trace.executed_as_planned());
    }
}
