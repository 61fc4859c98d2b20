//! Runs a workflow trace against one connection.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::action::{NormalizedAction, WorkflowAction};
use super::result::ExecutionResult;
use super::trace::{ActionOutcome, TraceEntry, WorkflowTrace};
use crate::layer::LayerStack;
use crate::state::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutorStatus {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Requests that a running executor stop before its next action.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Closes the stack's transport however execution ends.
struct StackGuard(LayerStack);

impl Deref for StackGuard {
    type Target = LayerStack;

    fn deref(&self) -> &LayerStack {
        &self.0
    }
}

impl DerefMut for StackGuard {
    fn deref_mut(&mut self) -> &mut LayerStack {
        &mut self.0
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        self.0.close();
        debug!("transport released");
    }
}

/// Drives the actions of a [`WorkflowTrace`] through a [`LayerStack`],
/// strictly in order.
#[derive(Debug)]
pub struct WorkflowExecutor {
    trace: WorkflowTrace,
    stack: LayerStack,
    state: ConnectionState,
    status: ExecutorStatus,
    cancel: CancelHandle,
}

impl WorkflowExecutor {
    pub fn new(trace: WorkflowTrace, stack: LayerStack, state: ConnectionState) -> Self {
        Self {
            trace,
            stack,
            state,
            status: ExecutorStatus::Idle,
            cancel: CancelHandle::default(),
        }
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run every action and report how execution compared with the plan.
    /// The transport is closed before this returns.
    pub fn execute(self) -> ExecutionResult {
        let Self {
            mut trace,
            stack,
            mut state,
            status,
            cancel,
        } = self;
        info!(
            from = ?status,
            to = ?ExecutorStatus::Running,
            actions = trace.len(),
            role = ?state.role(),
            "executor state"
        );
        let mut stack = StackGuard(stack);
        let started_at = SystemTime::now();
        let mut abort_reason = None;
        trace.reset();

        for index in 0..trace.len() {
            if cancel.is_cancelled() {
                abort_reason = Some("cancelled".to_string());
                break;
            }
            let action = trace.actions()[index].clone();
            state.begin_action(index);
            stack.begin_action();
            let entry = run_action(index, &action, &mut stack, &mut state);
            info!(
                index,
                action = action.name(),
                outcome = ?entry.outcome,
                as_planned = entry.as_planned,
                "action finished"
            );
            let failure = match &entry.outcome {
                ActionOutcome::TransportFailure { reason } => Some(reason.clone()),
                _ => None,
            };
            trace.record(entry);
            if failure.is_some() {
                abort_reason = failure;
                break;
            }
        }
        drop(stack);

        let status = if abort_reason.is_some() {
            ExecutorStatus::Aborted
        } else {
            ExecutorStatus::Completed
        };
        let executed_as_planned = trace.executed_as_planned();
        info!(
            from = ?ExecutorStatus::Running,
            to = ?status,
            executed_as_planned,
            reason = ?abort_reason,
            "executor state"
        );
        ExecutionResult {
            executed_as_planned,
            status,
            abort_reason,
            state,
            trace,
            started_at,
            finished_at: SystemTime::now(),
        }
    }
}

fn run_action(
    index: usize,
    action: &WorkflowAction,
    stack: &mut LayerStack,
    state: &mut ConnectionState,
) -> TraceEntry {
    let started = Instant::now();
    let normalized = match action.normalize(state) {
        Ok(normalized) => normalized,
        Err(skip) => {
            debug!(index, reason = %skip.reason, "action skipped");
            return TraceEntry {
                index,
                outcome: ActionOutcome::Skipped {
                    reason: skip.reason,
                },
                plan: Vec::new(),
                results: stack.take_results(),
                errors: Vec::new(),
                as_planned: true,
                elapsed: started.elapsed(),
            };
        }
    };
    let plan = normalized.plan().to_vec();
    let executed = match normalized {
        NormalizedAction::Send(configs) => stack.send(configs, state).map(|()| true),
        NormalizedAction::Receive(configs) => stack.receive(&configs, state).map(|()| true),
        NormalizedAction::ResendFlight => stack.retransmit(state),
        NormalizedAction::Wait(duration) => {
            std::thread::sleep(duration);
            Ok(true)
        }
    };
    let results = stack.take_results();
    let mut errors = Vec::new();
    let outcome = match executed {
        Ok(true) => ActionOutcome::Executed,
        Ok(false) => ActionOutcome::Skipped {
            reason: "no flight to resend".into(),
        },
        Err(err) if err.is_transport_failure() => {
            warn!(index, error = %err, "transport failure");
            ActionOutcome::TransportFailure {
                reason: err.to_string(),
            }
        }
        Err(err) => {
            warn!(index, error = %err, "action failed");
            errors.push(err.to_string());
            ActionOutcome::Executed
        }
    };
    let as_planned = match outcome {
        ActionOutcome::Executed => errors.is_empty() && TraceEntry::matches_plan(&plan, &results),
        ActionOutcome::Skipped { .. } => true,
        ActionOutcome::TransportFailure { .. } => false,
    };
    TraceEntry {
        index,
        outcome,
        plan,
        results,
        errors,
        as_planned,
        elapsed: started.elapsed(),
    }
}
