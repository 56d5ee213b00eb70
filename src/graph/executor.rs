//! Bounded worker pool executing a frozen plan

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use anyhow::anyhow;
use tracing::{debug, info_span, warn, Span};

use super::plan::{ExecutionPlan, Next, NodeOutcome};
use crate::build_tree::ExportOutcome;
use crate::error::{BuildFailure, Result};
use crate::locks::ProjectAccess;
use crate::node::{NodeKey, NodeKind};
use crate::services::BuildServices;
use crate::task::{ProjectId, TaskContext};

/// Execute every node of `plan`, blocking until all reached a terminal state.
///
/// Up to `max_workers` threads pull ready nodes; the calling thread is one of
/// them. Each worker runs inside the span that was current on the caller.
pub(crate) fn execute(plan: &ExecutionPlan, services: &BuildServices) -> Result<Vec<BuildFailure>> {
    if plan.is_empty() {
        let result = plan.take_result();
        services.coordinator().notify_changed();
        return result;
    }

    let workers = services.config().max_workers.clamp(1, plan.len());
    let span = Span::current();
    debug!(build = %plan.build(), nodes = plan.len(), workers, "Executing work graph");

    thread::scope(|scope| {
        for index in 1..workers {
            let span = span.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{index}", plan.build()))
                .spawn_scoped(scope, move || {
                    let _entered = span.enter();
                    worker_loop(plan, services);
                });
            if let Err(err) = spawned {
                warn!(build = %plan.build(), "Failed to spawn worker thread: {err}");
                break;
            }
        }
        worker_loop(plan, services);
    });

    let result = plan.take_result();
    services.coordinator().notify_changed();
    result
}

fn worker_loop(plan: &ExecutionPlan, services: &BuildServices) {
    let coordinator = services.coordinator();
    let thread = thread::current().id();

    loop {
        let next = coordinator.wait_for(|table| {
            let mut state = plan.lock_state();
            plan.select_next(&mut state, table, services, thread)
        });
        let (index, keys) = match next {
            Next::Run { index, keys } => (index, keys),
            Next::Done => return,
        };

        let outcome = run_node(plan, index, services);

        {
            let mut table = coordinator.lock_table();
            let mut state = plan.lock_state();
            plan.finish(&mut state, index, outcome, services);
            table.release_all(&keys, thread);
            table.release_lease(thread);
        }
        coordinator.notify_changed();
    }
}

fn run_node(plan: &ExecutionPlan, index: usize, services: &BuildServices) -> NodeOutcome {
    let node = plan.node(index);
    match &node.kind {
        NodeKind::Task(task) => {
            let span = info_span!("task", path = %node.key);
            let _entered = span.enter();

            let Some(action) = &task.action else {
                debug!("Task has no action");
                return NodeOutcome::Success;
            };
            let project = node
                .project
                .clone()
                .unwrap_or_else(|| ProjectId::new(plan.build().clone(), task.path().project()));
            let access = ProjectAccess::new(
                services.coordinator(),
                services.project_locks(),
                node.own_state_lock(services.project_locks()),
            );
            let ctx = TaskContext::new(task.path(), project, access);

            debug!("Running task");
            match panic::catch_unwind(AssertUnwindSafe(|| action.execute(&ctx))) {
                Ok(Ok(())) => NodeOutcome::Success,
                Ok(Err(err)) => NodeOutcome::Failure(err),
                Err(payload) => NodeOutcome::Failure(anyhow!(
                    "task panicked: {}",
                    panic_message(payload.as_ref())
                )),
            }
        }
        NodeKind::External(export) => {
            debug!(task = %node.key, "Waiting for task of another build");
            let outcome = services.worker_leases().blocking(|| export.wait());
            match outcome {
                ExportOutcome::Succeeded => NodeOutcome::Success,
                ExportOutcome::Failed | ExportOutcome::NotExecuted => {
                    if let NodeKey::External { build, path } = &node.key {
                        debug!(%build, %path, ?outcome, "Upstream task did not succeed");
                    }
                    NodeOutcome::UpstreamFailure
                }
            }
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
