//! The record handed back after every trace execution.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::executor::ExecutorStatus;
use super::trace::{ActionOutcome, WorkflowTrace};
use crate::layer::LayerType;
use crate::state::{ConnectionState, Negotiated};
use crate::unit::UnitKind;

/// Outcome of one trace execution. Produced even when the trace aborts.
#[derive(Debug)]
pub struct ExecutionResult {
    pub executed_as_planned: bool,
    pub status: ExecutorStatus,
    pub abort_reason: Option<String>,
    pub state: ConnectionState,
    pub trace: WorkflowTrace,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

impl ExecutionResult {
    pub fn duration(&self) -> Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unwrap_or_default()
    }

    /// Serializable view of the result for external storage.
    pub fn summary(&self) -> TraceSummary {
        let actions = self
            .trace
            .actions()
            .iter()
            .enumerate()
            .map(|(index, action)| {
                let entry = self.trace.entries().iter().find(|e| e.index == index);
                ActionSummary {
                    index,
                    action: action.name(),
                    outcome: entry.map(|e| e.outcome.clone()),
                    as_planned: entry.is_some_and(|e| e.as_planned),
                    planned: entry
                        .map(|e| {
                            e.plan
                                .iter()
                                .map(|c| LayerPlan {
                                    layer: c.layer(),
                                    send: c.is_send(),
                                    kinds: c.planned_kinds(),
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                    layers: entry
                        .map(|e| {
                            e.results
                                .iter()
                                .filter(|r| !r.is_empty() || !r.errors.is_empty())
                                .map(|r| LayerSummary {
                                    layer: r.layer,
                                    units: r
                                        .units
                                        .iter()
                                        .map(|u| UnitSummary {
                                            kind: u.kind(),
                                            name: u.name(),
                                            bytes: u.encode().ok().map(hex::encode),
                                        })
                                        .collect(),
                                    errors: r.errors.clone(),
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                    errors: entry.map(|e| e.errors.clone()).unwrap_or_default(),
                }
            })
            .collect();
        TraceSummary {
            executed_as_planned: self.executed_as_planned,
            status: self.status,
            abort_reason: self.abort_reason.clone(),
            started_at_ms: millis_since_epoch(self.started_at),
            duration_ms: self.duration().as_millis() as u64,
            negotiated: self.state.negotiated().clone(),
            actions,
        }
    }
}

fn millis_since_epoch(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub executed_as_planned: bool,
    pub status: ExecutorStatus,
    pub abort_reason: Option<String>,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    pub negotiated: Negotiated,
    pub actions: Vec<ActionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub index: usize,
    pub action: &'static str,
    /// `None` for actions that never ran.
    pub outcome: Option<ActionOutcome>,
    pub as_planned: bool,
    pub planned: Vec<LayerPlan>,
    pub layers: Vec<LayerSummary>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerPlan {
    pub layer: LayerType,
    pub send: bool,
    pub kinds: Vec<UnitKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerSummary {
    pub layer: LayerType,
    pub units: Vec<UnitSummary>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSummary {
    pub kind: UnitKind,
    pub name: &'static str,
    /// Hex of the unit's encoding.
    pub bytes: Option<String>,
}
