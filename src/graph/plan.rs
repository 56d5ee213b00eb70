//! The frozen, executable form of a work graph
//!
//! An [`ExecutionPlan`] is built once by finalization. Its node set and edges
//! never change; only node states move forward, under the plan's state mutex.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;

use tracing::{debug, info, warn};

use crate::build_tree::{ExportOutcome, ExportedTask};
use crate::error::{BuildFailure, GraphError, Result};
use crate::locks::{LockTable, ProjectLocks, ResourceKey};
use crate::node::{NodeKey, NodeKind, NodeState, ResolvedMutations};
use crate::services::BuildServices;
use crate::task::{BuildId, ProjectId};

/// A scheduled node with everything execution needs, edges as plan indices
#[derive(Debug)]
pub(crate) struct PlannedNode {
    pub(crate) key: NodeKey,
    pub(crate) kind: NodeKind,
    pub(crate) ordinal: u32,
    pub(crate) required: bool,
    pub(crate) mutations: ResolvedMutations,
    /// Owning project, `None` for external nodes
    pub(crate) project: Option<ProjectId>,
    pub(crate) isolated: bool,
    pub(crate) shared_resources: BTreeSet<String>,
    pub(crate) ignore_failures: bool,
    /// Hard dependencies
    pub(crate) dependencies: Vec<usize>,
    /// Nodes that hard-depend on this one
    pub(crate) dependents: Vec<usize>,
    /// Ordering-only predecessors
    pub(crate) run_after: Vec<usize>,
    /// Nodes this finalizer runs after
    pub(crate) finalizes: Vec<usize>,
    /// Tasks of other builds this node must run after, if they run at all
    pub(crate) after_exports: Vec<ExportedTask>,
    pub(crate) export: Option<ExportedTask>,
}

impl PlannedNode {
    /// Lock keys to hold while the node runs
    pub(crate) fn lock_keys(&self, locks: &ProjectLocks) -> Vec<ResourceKey> {
        match &self.project {
            Some(project) => locks.task_locks(project, self.isolated, &self.shared_resources),
            None => Vec::new(),
        }
    }

    /// The project state lock a running task holds, if any
    pub(crate) fn own_state_lock(&self, locks: &ProjectLocks) -> Option<ResourceKey> {
        match &self.project {
            Some(project) if !self.isolated => Some(locks.state_lock(project)),
            _ => None,
        }
    }

    fn publish(&self, outcome: ExportOutcome) {
        if let Some(export) = &self.export {
            export.publish(outcome);
        }
    }
}

/// How a node's execution ended
#[derive(Debug)]
pub(crate) enum NodeOutcome {
    Success,
    Failure(anyhow::Error),
    /// An external node whose target in another build did not succeed
    UpstreamFailure,
}

/// What a worker should do next
#[derive(Debug)]
pub(crate) enum Next {
    Run { index: usize, keys: Vec<ResourceKey> },
    Done,
}

/// Whether a node that is not required is going to be needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Demand {
    Wanted,
    Pending,
    Unwanted,
}

#[derive(Debug)]
pub(crate) struct PlanState {
    states: Vec<NodeState>,
    /// Failed nodes whose failure is ignored
    tolerated: Vec<bool>,
    running: Vec<usize>,
    failures: Vec<BuildFailure>,
    /// Nodes not yet in a terminal state
    remaining: usize,
    error: Option<GraphError>,
}

impl PlanState {
    fn set(&mut self, index: usize, state: NodeState) -> Result<()> {
        let current = self.states[index];
        let next = current.try_transition(state)?;
        if !current.is_terminal() && next.is_terminal() {
            self.remaining -= 1;
        }
        self.states[index] = next;
        Ok(())
    }

    /// A dependency that lets its dependents run
    fn satisfies(&self, index: usize) -> bool {
        match self.states[index] {
            NodeState::Succeeded => true,
            NodeState::Failed => self.tolerated[index],
            _ => false,
        }
    }

    /// A dependency that stops its dependents from running
    fn blocks(&self, index: usize) -> bool {
        match self.states[index] {
            NodeState::Failed => !self.tolerated[index],
            NodeState::Skipped | NodeState::MustNotRun => true,
            _ => false,
        }
    }
}

/// A frozen work graph, shared by the workers executing it
#[derive(Debug)]
pub struct ExecutionPlan {
    build: BuildId,
    nodes: Vec<PlannedNode>,
    positions: HashMap<NodeKey, usize>,
    state: Mutex<PlanState>,
}

impl ExecutionPlan {
    pub(crate) fn new(build: BuildId, nodes: Vec<PlannedNode>) -> Self {
        let positions = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.key.clone(), index))
            .collect();
        let state = PlanState {
            states: vec![NodeState::Scheduled; nodes.len()],
            tolerated: vec![false; nodes.len()],
            running: Vec::new(),
            failures: Vec::new(),
            remaining: nodes.len(),
            error: None,
        };
        Self {
            build,
            nodes,
            positions,
            state: Mutex::new(state),
        }
    }

    pub fn build(&self) -> &BuildId {
        &self.build
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn node(&self, index: usize) -> &PlannedNode {
        &self.nodes[index]
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PlanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state_of(&self, key: &NodeKey) -> Option<NodeState> {
        let index = *self.positions.get(key)?;
        Some(self.lock_state().states[index])
    }

    /// Pick the next node for the calling worker, or `None` to wait.
    ///
    /// Called with the lock table held, so lease and lock acquisition happen
    /// atomically with the choice of node.
    pub(crate) fn select_next(
        &self,
        state: &mut PlanState,
        table: &mut LockTable,
        services: &BuildServices,
        thread: ThreadId,
    ) -> Option<Next> {
        // A relaxed pass only happens when the strict one leaves nothing to do
        for relaxed in [false, true] {
            match self.settle(state, services.stop_requested(), relaxed) {
                // Other builds may be ordered after exports published here
                Ok(true) => services.coordinator().notify_changed(),
                Ok(false) => {}
                Err(err) => {
                    state.error.get_or_insert(err);
                }
            }
            if state.error.is_some() || state.remaining == 0 {
                return Some(Next::Done);
            }

            let mut ready: Vec<usize> = (0..self.nodes.len())
                .filter(|&index| state.states[index] == NodeState::Ready)
                .collect();
            ready.sort_by_key(|&index| (self.nodes[index].ordinal, index));

            for &index in &ready {
                let node = &self.nodes[index];
                if state
                    .running
                    .iter()
                    .any(|&running| self.nodes[running].mutations.conflicts_with(&node.mutations))
                {
                    continue;
                }
                if !table.try_acquire_lease(thread) {
                    return None;
                }
                let keys = node.lock_keys(services.project_locks());
                if !table.try_acquire_all(&keys, thread) {
                    table.release_lease(thread);
                    continue;
                }
                if let Err(err) = state.set(index, NodeState::Running) {
                    table.release_all(&keys, thread);
                    table.release_lease(thread);
                    state.error.get_or_insert(err);
                    return Some(Next::Done);
                }
                state.running.push(index);
                return Some(Next::Run { index, keys });
            }

            if !ready.is_empty() || !state.running.is_empty() || self.awaits_other_builds(state) {
                return None;
            }
        }

        // Nothing can make progress
        self.skip_stuck(state);
        services.coordinator().notify_changed();
        Some(Next::Done)
    }

    /// Whether a waiting node is ordered after a task another build has not
    /// finished yet
    fn awaits_other_builds(&self, state: &PlanState) -> bool {
        (0..self.nodes.len()).any(|index| {
            state.states[index] == NodeState::Scheduled
                && self.nodes[index]
                    .after_exports
                    .iter()
                    .any(|export| export.outcome().is_none())
        })
    }

    /// Record the outcome of a node that was running
    pub(crate) fn finish(
        &self,
        state: &mut PlanState,
        index: usize,
        outcome: NodeOutcome,
        services: &BuildServices,
    ) {
        state.running.retain(|&running| running != index);
        let node = &self.nodes[index];

        let (next, published) = match outcome {
            NodeOutcome::Success => {
                debug!(task = %node.key, "Task succeeded");
                (NodeState::Succeeded, ExportOutcome::Succeeded)
            }
            NodeOutcome::Failure(error) if node.ignore_failures => {
                warn!(task = %node.key, "Task failed, ignoring: {error:#}");
                state.tolerated[index] = true;
                // Dependents in other builds proceed as local ones do
                (NodeState::Failed, ExportOutcome::Succeeded)
            }
            NodeOutcome::Failure(error) => {
                warn!(task = %node.key, "Task failed: {error:#}");
                if let NodeKey::Task(task) = &node.key {
                    state.failures.push(BuildFailure::TaskFailed {
                        task: task.clone(),
                        error,
                    });
                }
                if services.config().fail_fast && !services.stop_requested() {
                    info!(task = %node.key, "Stopping after first failure");
                    services.request_stop();
                }
                (NodeState::Failed, ExportOutcome::Failed)
            }
            NodeOutcome::UpstreamFailure => {
                debug!(task = %node.key, "Task in another build did not succeed");
                (NodeState::Failed, ExportOutcome::Failed)
            }
        };

        if let Err(err) = state.set(index, next) {
            state.error.get_or_insert(err);
        }
        node.publish(published);
    }

    /// Move waiting nodes forward until nothing changes. Returns whether any
    /// node moved.
    ///
    /// A relaxed pass lets a node run ahead of ordering predecessors that are
    /// not yet known to be needed.
    fn settle(&self, state: &mut PlanState, stop: bool, relaxed: bool) -> Result<bool> {
        let mut memo = vec![None; self.nodes.len()];
        let mut moved = false;
        loop {
            let mut changed = false;
            for index in 0..self.nodes.len() {
                let next = match state.states[index] {
                    NodeState::Ready if stop => Some(NodeState::Skipped),
                    NodeState::Scheduled => self.advance(index, state, stop, relaxed, &mut memo),
                    _ => None,
                };
                let Some(next) = next else {
                    continue;
                };

                state.set(index, next)?;
                changed = true;
                memo.fill(None);
                if next.is_terminal() {
                    debug!(task = %self.nodes[index].key, state = %next, "Task will not run");
                    self.nodes[index].publish(ExportOutcome::NotExecuted);
                }
            }
            if !changed {
                return Ok(moved);
            }
            moved = true;
        }
    }

    /// Next state of a scheduled node, if it can move
    fn advance(
        &self,
        index: usize,
        state: &PlanState,
        stop: bool,
        relaxed: bool,
        memo: &mut [Option<Demand>],
    ) -> Option<NodeState> {
        if stop {
            return Some(NodeState::Skipped);
        }
        let demand = self.demand(index, &state.states, memo);
        if demand == Demand::Unwanted {
            return Some(NodeState::MustNotRun);
        }

        let node = &self.nodes[index];
        if node.dependencies.iter().any(|&dep| state.blocks(dep)) {
            return Some(NodeState::Skipped);
        }
        if demand == Demand::Pending {
            return None;
        }

        let dependencies_done = node.dependencies.iter().all(|&dep| state.satisfies(dep));
        let finalized_done = node
            .finalizes
            .iter()
            .all(|&finalized| state.states[finalized].is_terminal());
        let ordering_done = node.run_after.iter().all(|&pred| {
            state.states[pred].is_terminal()
                || (relaxed && self.demand(pred, &state.states, memo) == Demand::Pending)
        });
        let other_builds_done = node
            .after_exports
            .iter()
            .all(|export| export.outcome().is_some());

        (dependencies_done && finalized_done && ordering_done && other_builds_done)
            .then_some(NodeState::Ready)
    }

    /// Required nodes are always wanted. A finalizer is wanted once a node it
    /// finalizes has executed, and other nodes are wanted while something
    /// wanted depends on them.
    fn demand(&self, index: usize, states: &[NodeState], memo: &mut [Option<Demand>]) -> Demand {
        if let Some(demand) = memo[index] {
            return demand;
        }

        let node = &self.nodes[index];
        let demand = if node.required {
            Demand::Wanted
        } else {
            let mut pending = false;
            let mut wanted = false;
            for &finalized in &node.finalizes {
                if states[finalized].executed() {
                    wanted = true;
                    break;
                }
                pending |= !states[finalized].is_terminal();
            }
            if !wanted {
                for &dependent in &node.dependents {
                    if states[dependent].is_terminal() {
                        continue;
                    }
                    match self.demand(dependent, states, memo) {
                        Demand::Wanted => {
                            wanted = true;
                            break;
                        }
                        Demand::Pending => pending = true,
                        Demand::Unwanted => {}
                    }
                }
            }
            if wanted {
                Demand::Wanted
            } else if pending {
                Demand::Pending
            } else {
                Demand::Unwanted
            }
        };

        memo[index] = Some(demand);
        demand
    }

    fn skip_stuck(&self, state: &mut PlanState) {
        for index in 0..self.nodes.len() {
            if matches!(state.states[index], NodeState::Scheduled | NodeState::Ready) {
                warn!(task = %self.nodes[index].key, "Task can never become ready, skipping");
                if let Err(err) = state.set(index, NodeState::Skipped) {
                    state.error.get_or_insert(err);
                }
                self.nodes[index].publish(ExportOutcome::NotExecuted);
            }
        }
    }

    /// Publish `NotExecuted` for every export that has no outcome yet
    pub(crate) fn abandon_exports(&self) {
        for node in &self.nodes {
            node.publish(ExportOutcome::NotExecuted);
        }
    }

    /// Collect the result of a completed run
    pub(crate) fn take_result(&self) -> Result<Vec<BuildFailure>> {
        self.abandon_exports();
        let mut state = self.lock_state();
        if let Some(err) = state.error.take() {
            return Err(err);
        }
        Ok(std::mem::take(&mut state.failures))
    }
}
