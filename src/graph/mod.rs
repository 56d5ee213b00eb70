//! Work graph: the scheduled nodes of one build
//!
//! A work graph is populated incrementally (tasks are queued, then scheduled
//! together with everything they depend on), finalized once, and executed
//! once. Finalization checks for cycles, resolves mutation info and freezes
//! the scheduled nodes into an [`ExecutionPlan`].

pub(crate) mod cycle;
pub(crate) mod executor;
pub mod plan;
pub(crate) mod resolver;


use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, info, trace};

use crate::build_tree::{CrossBuildRegistry, ExportOutcome, ExportedTask};
use crate::error::{BuildFailure, GraphError, Result};
use crate::node::{Node, NodeId, NodeKey, NodeKind, NodeState, ResolvedMutations};
use crate::services::BuildServices;
use crate::task::{BuildId, ProjectId, RelationshipKind, TaskPath, TaskRegistry};

use cycle::{check_for_cycles, reaches};
use plan::PlannedNode;
use resolver::{DependencyResolver, ResolvedTarget};

pub use plan::ExecutionPlan;

/// Lifecycle phase of a work graph. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphPhase {
    Populating,
    Finalized,
    Running,
    Completed,
}

impl fmt::Display for GraphPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphPhase::Populating => "populating",
            GraphPhase::Finalized => "finalized",
            GraphPhase::Running => "running",
            GraphPhase::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// The scheduled work of one build
pub struct WorkGraph {
    build: BuildId,
    tasks: Arc<TaskRegistry>,
    cross_build: Option<Weak<dyn CrossBuildRegistry>>,
    phase: GraphPhase,
    nodes: Vec<Node>,
    index: HashMap<NodeKey, NodeId>,
    /// Queued for execution, not yet merged into the scheduled set
    queued: BTreeSet<NodeId>,
    /// Every node that is part of the run
    scheduled: BTreeSet<NodeId>,
    next_ordinal: u32,
    /// Resolution errors, reported when the graph is finalized
    configuration_errors: Vec<GraphError>,
    exports: BTreeMap<TaskPath, ExportedTask>,
    plan: Option<Arc<ExecutionPlan>>,
}

impl WorkGraph {
    pub fn new(tasks: Arc<TaskRegistry>) -> Self {
        Self {
            build: tasks.build_id().clone(),
            tasks,
            cross_build: None,
            phase: GraphPhase::Populating,
            nodes: Vec::new(),
            index: HashMap::new(),
            queued: BTreeSet::new(),
            scheduled: BTreeSet::new(),
            next_ordinal: 0,
            configuration_errors: Vec::new(),
            exports: BTreeMap::new(),
            plan: None,
        }
    }

    /// Allow references to tasks of other builds
    pub fn with_cross_build(mut self, registry: Weak<dyn CrossBuildRegistry>) -> Self {
        self.cross_build = Some(registry);
        self
    }

    pub fn build(&self) -> &BuildId {
        &self.build
    }

    pub fn phase(&self) -> GraphPhase {
        self.phase
    }

    fn require_phase(&self, expected: GraphPhase, operation: &'static str) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(GraphError::illegal_state(
                operation,
                format!("work graph of build '{}' is {}", self.build, self.phase),
            ))
        }
    }

    /// Queue a batch of tasks and schedule it with its dependencies.
    ///
    /// Returns whether any node was added to the scheduled set.
    pub fn populate(&mut self, batch: &[TaskPath]) -> Result<bool> {
        self.schedule(batch)
    }

    /// Mark a task as requested. It joins the run at the next schedule.
    pub fn queue_for_execution(&mut self, path: &TaskPath) -> Result<()> {
        self.require_phase(GraphPhase::Populating, "queue tasks")?;
        let task = self.tasks.get(path).ok_or_else(|| {
            GraphError::configuration(path, format!("task not found in build '{}'", self.build))
        })?;
        let id = self.node_for(ResolvedTarget::Task(task));
        let node = &mut self.nodes[id.index()];
        if node.state == NodeState::NotScheduled {
            node.set_state(NodeState::Queued)?;
        }
        // A node scheduled only as a finalizer becomes required
        if !node.state.is_scheduled() || !node.required {
            self.queued.insert(id);
        }
        Ok(())
    }

    /// Queue `paths`, then schedule everything queued
    pub fn schedule(&mut self, paths: &[TaskPath]) -> Result<bool> {
        for path in paths {
            self.queue_for_execution(path)?;
        }
        self.schedule_queued()
    }

    /// Merge the queued tasks into the scheduled set, transitively
    /// scheduling their dependencies and finalizers.
    ///
    /// The batch gets its own ordinal. Returns whether anything was added
    /// or became required.
    pub fn schedule_queued(&mut self) -> Result<bool> {
        self.require_phase(GraphPhase::Populating, "schedule tasks")?;
        if self.queued.is_empty() {
            return Ok(false);
        }

        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;

        let batch = std::mem::take(&mut self.queued);
        let mut pending: VecDeque<(NodeId, bool)> = batch.into_iter().map(|id| (id, true)).collect();
        let mut added = 0;

        while let Some((id, required)) = pending.pop_front() {
            let node = &mut self.nodes[id.index()];
            let newly_required = required && !node.required;
            node.required |= required;

            if !node.state.is_scheduled() {
                node.set_state(NodeState::Scheduled)?;
                node.maybe_set_ordinal(ordinal);
                self.scheduled.insert(id);
                added += 1;
            } else if newly_required {
                added += 1;
            } else {
                continue;
            }

            self.resolve_relationships(id);

            let node = &self.nodes[id.index()];
            let required = node.required;
            let node_ordinal = node.ordinal;
            let dependencies: Vec<NodeId> = node.successors.dependencies.iter().copied().collect();
            pending.extend(node.successors.finalizers.iter().map(|&fin| (fin, false)));
            for dep in dependencies {
                if let Some(ordinal) = node_ordinal {
                    self.nodes[dep.index()].maybe_set_ordinal(ordinal);
                }
                pending.push_back((dep, required));
            }
        }

        debug!(build = %self.build, ordinal, added, "Scheduled tasks");
        Ok(added > 0)
    }

    /// Resolve a node's declared relationships into successor nodes, once
    fn resolve_relationships(&mut self, id: NodeId) {
        if self.nodes[id.index()].resolved {
            return;
        }
        self.nodes[id.index()].resolved = true;
        let NodeKind::Task(task) = self.nodes[id.index()].kind.clone() else {
            return;
        };

        let tasks = Arc::clone(&self.tasks);
        let build = self.build.clone();
        let cross_build = self.cross_build.as_ref().and_then(Weak::upgrade);
        let resolver = DependencyResolver::new(&build, &tasks, cross_build.as_deref());

        for kind in [
            RelationshipKind::Dependency,
            RelationshipKind::FinalizedBy,
            RelationshipKind::MustRunAfter,
            RelationshipKind::ShouldRunAfter,
        ] {
            let mut targets = Vec::new();
            if let Err(err) = resolver.resolve(&task, kind, |target| targets.push(target)) {
                debug!(task = %task.path(), "Failed to resolve task relationships: {err}");
                self.configuration_errors.push(err);
            }

            for target in targets {
                let target = self.node_for(target);
                self.nodes[id.index()].successors.get_mut(kind).insert(target);
                if kind == RelationshipKind::FinalizedBy {
                    self.nodes[target.index()].finalizes.insert(id);
                }
                trace!(from = %task.path(), to = %self.nodes[target.index()].key, ?kind, "Added edge");
            }
        }
    }

    /// The node for a resolved target, created on first reference
    fn node_for(&mut self, target: ResolvedTarget) -> NodeId {
        let (key, kind) = match target {
            ResolvedTarget::Task(task) => (NodeKey::Task(task.path().clone()), NodeKind::Task(task)),
            ResolvedTarget::External(export) => (
                NodeKey::External {
                    build: export.build().clone(),
                    path: export.path().clone(),
                },
                NodeKind::External(export),
            ),
        };
        if let Some(&id) = self.index.get(&key) {
            return id;
        }

        let id = NodeId::new(self.nodes.len());
        let mut node = Node::new(id, key.clone(), kind);
        // Nothing to resolve for a task of another build
        node.resolved = matches!(node.kind, NodeKind::External(_));
        self.nodes.push(node);
        self.index.insert(key, id);
        id
    }

    pub fn is_scheduled(&self, path: &TaskPath) -> bool {
        self.index
            .get(&NodeKey::Task(path.clone()))
            .is_some_and(|id| self.nodes[id.index()].state.is_scheduled())
    }

    /// Whether `path` is scheduled because it was requested or something
    /// requested depends on it
    pub fn is_required(&self, path: &TaskPath) -> bool {
        self.index
            .get(&NodeKey::Task(path.clone()))
            .is_some_and(|id| {
                let node = &self.nodes[id.index()];
                node.state.is_scheduled() && node.required
            })
    }

    /// Paths of every scheduled task of this build, in path order
    pub fn scheduled_tasks(&self) -> Vec<TaskPath> {
        let mut paths: Vec<TaskPath> = self
            .scheduled
            .iter()
            .filter_map(|id| match &self.nodes[id.index()].key {
                NodeKey::Task(path) => Some(path.clone()),
                NodeKey::External { .. } => None,
            })
            .collect();
        paths.sort();
        paths
    }

    /// Handle through which other builds wait for `path`.
    ///
    /// The task still has to be scheduled in this build.
    pub fn export(&mut self, path: &TaskPath) -> Result<ExportedTask> {
        if let Some(export) = self.exports.get(path) {
            return Ok(export.clone());
        }
        self.require_phase(GraphPhase::Populating, "export task")?;
        if !self.tasks.contains(path) {
            return Err(GraphError::configuration(
                path,
                format!("task not found in build '{}'", self.build),
            ));
        }
        let export = ExportedTask::new(self.build.clone(), path.clone());
        self.exports.insert(path.clone(), export.clone());
        Ok(export)
    }

    /// Current state of a task of this build
    pub fn state_of(&self, path: &TaskPath) -> Option<NodeState> {
        let key = NodeKey::Task(path.clone());
        if let Some(state) = self.plan.as_ref().and_then(|plan| plan.state_of(&key)) {
            return Some(state);
        }
        self.index.get(&key).map(|id| self.nodes[id.index()].state)
    }

    /// What each scheduled node waits for before it may start, by node key:
    /// hard dependencies, must-run-after predecessors (including tasks of
    /// other builds) and the nodes a finalizer finalizes
    pub fn execution_edges(&self) -> Vec<(NodeKey, Vec<NodeKey>)> {
        self.scheduled
            .iter()
            .map(|id| {
                let node = &self.nodes[id.index()];
                let mut waits: BTreeSet<NodeId> = node.successors.dependencies.clone();
                waits.extend(node.successors.must_run_after.iter().copied().filter(|succ| {
                    self.scheduled.contains(succ)
                        || matches!(self.nodes[succ.index()].kind, NodeKind::External(_))
                }));
                waits.extend(node.finalizes.iter().copied().filter(|f| self.scheduled.contains(f)));
                let targets = waits
                    .iter()
                    .map(|wait| self.nodes[wait.index()].key.clone())
                    .collect();
                (node.key.clone(), targets)
            })
            .collect()
    }

    /// Check for cycles and freeze the scheduled nodes.
    ///
    /// Fails if tasks are still queued, if any scheduled task's declaration
    /// is invalid, or if the scheduled nodes contain a cycle. Nothing runs
    /// once finalization has failed.
    pub fn finalize(&mut self) -> Result<()> {
        self.require_phase(GraphPhase::Populating, "finalize work graph")?;
        if !self.queued.is_empty() {
            return Err(GraphError::illegal_state(
                "finalize work graph",
                format!("{} queued tasks have not been scheduled", self.queued.len()),
            ));
        }
        if let Some(err) = self.configuration_errors.first() {
            return Err(err.clone());
        }

        let roots: Vec<NodeId> = self.scheduled.iter().copied().collect();
        let name = |id: NodeId| self.nodes[id.index()].key.to_string();
        check_for_cycles(
            &roots,
            |id| self.scheduled_successors(id, &[RelationshipKind::Dependency]),
            name,
        )?;

        let mut mutations: HashMap<NodeId, ResolvedMutations> = HashMap::new();
        for &id in &self.scheduled {
            let node = &self.nodes[id.index()];
            mutations.insert(id, node.kind.resolve_mutations(&node.key)?);
        }

        // Mandatory ordering would deadlock execution if it were circular
        let mut ordering: HashMap<NodeId, BTreeSet<NodeId>> = self
            .scheduled
            .iter()
            .map(|&id| {
                let mut preds: BTreeSet<NodeId> = self
                    .scheduled_successors(
                        id,
                        &[RelationshipKind::Dependency, RelationshipKind::MustRunAfter],
                    )
                    .into_iter()
                    .collect();
                preds.extend(
                    self.nodes[id.index()]
                        .finalizes
                        .iter()
                        .filter(|finalized| self.scheduled.contains(*finalized)),
                );
                (id, preds)
            })
            .collect();
        let ordering_successors = |ordering: &HashMap<NodeId, BTreeSet<NodeId>>, id: NodeId| -> Vec<NodeId> {
            ordering
                .get(&id)
                .map(|preds| preds.iter().copied().collect())
                .unwrap_or_default()
        };
        check_for_cycles(&roots, |id| ordering_successors(&ordering, id), name)?;

        let implicit = self.add_implicit_ordering(&mut ordering, &mutations, &ordering_successors);
        let accepted = self.add_should_run_after(&mut ordering, &ordering_successors);
        debug!(build = %self.build, implicit, accepted, "Added ordering hints");

        self.plan = Some(Arc::new(self.freeze(&ordering, &mut mutations)));
        self.phase = GraphPhase::Finalized;

        // Exports of tasks that never joined the run
        for (path, export) in &self.exports {
            if !self.is_scheduled(path) {
                export.publish(ExportOutcome::NotExecuted);
            }
        }

        info!(build = %self.build, nodes = self.scheduled.len(), "Work graph finalized");
        Ok(())
    }

    /// Scheduled successors of `id` over the given relationship kinds
    fn scheduled_successors(&self, id: NodeId, kinds: &[RelationshipKind]) -> Vec<NodeId> {
        let successors = &self.nodes[id.index()].successors;
        let mut found: Vec<NodeId> = kinds
            .iter()
            .flat_map(|&kind| successors.get(kind).iter().copied())
            .filter(|succ| self.scheduled.contains(succ))
            .collect();
        found.sort();
        found.dedup();
        found
    }

    /// A later batch must not reorder an earlier one: a node that destroys
    /// what an earlier-requested node produces runs after it, and vice versa.
    fn add_implicit_ordering(
        &self,
        ordering: &mut HashMap<NodeId, BTreeSet<NodeId>>,
        mutations: &HashMap<NodeId, ResolvedMutations>,
        successors: &impl Fn(&HashMap<NodeId, BTreeSet<NodeId>>, NodeId) -> Vec<NodeId>,
    ) -> usize {
        let mut added = 0;
        for &later in &self.scheduled {
            for &earlier in &self.scheduled {
                let (Some(later_ordinal), Some(earlier_ordinal)) =
                    (self.nodes[later.index()].ordinal, self.nodes[earlier.index()].ordinal)
                else {
                    continue;
                };
                if earlier_ordinal >= later_ordinal {
                    continue;
                }
                let (Some(l), Some(e)) = (mutations.get(&later), mutations.get(&earlier)) else {
                    continue;
                };
                if !l.conflicts_with(e) {
                    continue;
                }
                if !reaches(earlier, later, |id| successors(&*ordering, id)) {
                    ordering.entry(later).or_default().insert(earlier);
                    added += 1;
                }
            }
        }
        added
    }

    /// Accept should-run-after hints within one batch unless they would
    /// create a cycle
    fn add_should_run_after(
        &self,
        ordering: &mut HashMap<NodeId, BTreeSet<NodeId>>,
        successors: &impl Fn(&HashMap<NodeId, BTreeSet<NodeId>>, NodeId) -> Vec<NodeId>,
    ) -> usize {
        let mut accepted = 0;
        for &id in &self.scheduled {
            let node = &self.nodes[id.index()];
            for &pred in &self.scheduled_successors(id, &[RelationshipKind::ShouldRunAfter]) {
                if self.nodes[pred.index()].ordinal != node.ordinal {
                    trace!(task = %node.key, after = %self.nodes[pred.index()].key, "Ignoring ordering hint across batches");
                    continue;
                }
                if reaches(pred, id, |n| successors(&*ordering, n)) {
                    debug!(task = %node.key, after = %self.nodes[pred.index()].key, "Ignoring ordering hint that would create a cycle");
                    continue;
                }
                ordering.entry(id).or_default().insert(pred);
                accepted += 1;
            }
        }
        accepted
    }

    fn freeze(
        &self,
        ordering: &HashMap<NodeId, BTreeSet<NodeId>>,
        mutations: &mut HashMap<NodeId, ResolvedMutations>,
    ) -> ExecutionPlan {
        let position: HashMap<NodeId, usize> = self
            .scheduled
            .iter()
            .enumerate()
            .map(|(index, &id)| (id, index))
            .collect();
        let mut planned: Vec<PlannedNode> = Vec::with_capacity(self.scheduled.len());
        for &id in &self.scheduled {
            let node = &self.nodes[id.index()];
            let dependencies = positions(&node.successors.dependencies, &position);
            let finalizes = positions(&node.finalizes, &position);
            let run_after = ordering
                .get(&id)
                .map(|preds| {
                    let ordering_only = preds.iter().filter(|pred| {
                        !node.successors.dependencies.contains(*pred) && !node.finalizes.contains(*pred)
                    });
                    positions(ordering_only, &position)
                })
                .unwrap_or_default();

            let after_exports = node
                .successors
                .must_run_after
                .iter()
                .filter_map(|succ| match &self.nodes[succ.index()].kind {
                    NodeKind::External(export) => Some(export.clone()),
                    NodeKind::Task(_) => None,
                })
                .collect();

            let (project, isolated, shared_resources, ignore_failures, export) = match &node.kind {
                NodeKind::Task(task) => (
                    Some(ProjectId::new(self.build.clone(), task.path().project())),
                    task.isolated,
                    task.shared_resources.clone(),
                    task.ignore_failures,
                    self.exports.get(task.path()).cloned(),
                ),
                NodeKind::External(_) => (None, false, BTreeSet::new(), false, None),
            };

            planned.push(PlannedNode {
                key: node.key.clone(),
                kind: node.kind.clone(),
                ordinal: node.ordinal.unwrap_or_default(),
                required: node.required,
                mutations: mutations.remove(&id).unwrap_or_default(),
                project,
                isolated,
                shared_resources,
                ignore_failures,
                dependencies,
                dependents: Vec::new(),
                run_after,
                finalizes,
                after_exports,
                export,
            });
        }

        for index in 0..planned.len() {
            for dep in planned[index].dependencies.clone() {
                planned[dep].dependents.push(index);
            }
        }

        ExecutionPlan::new(self.build.clone(), planned)
    }

    /// Move a finalized graph to running and hand out its plan
    pub fn begin_execution(&mut self) -> Result<Arc<ExecutionPlan>> {
        self.require_phase(GraphPhase::Finalized, "execute work graph")?;
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| GraphError::illegal_state("execute work graph", "no plan was built"))?;
        self.phase = GraphPhase::Running;
        Ok(plan)
    }

    pub fn complete(&mut self) -> Result<()> {
        self.require_phase(GraphPhase::Running, "complete work graph")?;
        self.phase = GraphPhase::Completed;
        Ok(())
    }

    /// Execute the finalized graph on the calling thread and its workers.
    ///
    /// Returns every task failure of the run; an empty list means success.
    pub fn run_work(&mut self, services: &BuildServices) -> Result<Vec<BuildFailure>> {
        let plan = self.begin_execution()?;
        let result = executor::execute(&plan, services);
        self.complete()?;
        result
    }

    /// Publish `NotExecuted` to every export that has no outcome yet
    pub(crate) fn abandon_exports(&self) {
        for export in self.exports.values() {
            export.publish(ExportOutcome::NotExecuted);
        }
    }
}

/// Plan indices of `ids`, skipping nodes outside the plan
fn positions<'a>(
    ids: impl IntoIterator<Item = &'a NodeId>,
    position: &HashMap<NodeId, usize>,
) -> Vec<usize> {
    ids.into_iter()
        .filter_map(|id| position.get(id).copied())
        .collect()
}

impl fmt::Debug for WorkGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkGraph")
            .field("build", &self.build)
            .field("phase", &self.phase)
            .field("nodes", &self.nodes.len())
            .field("scheduled", &self.scheduled.len())
            .field("queued", &self.queued.len())
            .finish_non_exhaustive()
    }
}
