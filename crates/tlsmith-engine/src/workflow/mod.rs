//! Scripted workflows: actions, the trace that records them and the
//! executor that runs them against a layer stack.
//!
//! Actions run strictly in order, each one resolved against the connection
//! state left by the previous ones. An action whose precondition does not
//! hold is skipped without failing the trace; only a failed transport aborts
//! it. Every execution yields an [`ExecutionResult`].

mod action;
mod executor;
mod result;
mod trace;

pub use action::{NormalizedAction, UnitSelector, WorkflowAction};
pub use executor::{CancelHandle, ExecutorStatus, WorkflowExecutor};
pub use result::{ActionSummary, ExecutionResult, LayerPlan, LayerSummary, TraceSummary, UnitSummary};
pub use trace::{ActionOutcome, TraceEntry, WorkflowTrace};
