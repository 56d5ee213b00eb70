//! Coordination of several builds executing as one build tree
//!
//! Each build owns a [`BuildController`]. Builds refer to each other's tasks
//! through [`ExportedTask`] handles handed out by the tree's
//! [`CrossBuildRegistry`]; the referencing build waits on the handle while
//! the owning build runs the task.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak};

use tracing::{debug, info};

use crate::config::ExecutionConfig;
use crate::controller::{BuildController, ExecutorService};
use crate::error::{BuildFailure, GraphError, Result};
use crate::graph::cycle::check_for_cycles;
use crate::node::{NodeId, NodeKey};
use crate::services::BuildServices;
use crate::task::{BuildId, TaskPath, TaskRegistry};

/// Final outcome of an exported task, as seen by other builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    Succeeded,
    Failed,
    /// Skipped, must not run, or its build never executed
    NotExecuted,
}

struct ExportState {
    build: BuildId,
    path: TaskPath,
    outcome: Mutex<Option<ExportOutcome>>,
    published: Condvar,
}

/// Handle to a task of one build that other builds may depend on
#[derive(Clone)]
pub struct ExportedTask {
    state: Arc<ExportState>,
}

impl ExportedTask {
    pub fn new(build: BuildId, path: TaskPath) -> Self {
        Self {
            state: Arc::new(ExportState {
                build,
                path,
                outcome: Mutex::new(None),
                published: Condvar::new(),
            }),
        }
    }

    pub fn build(&self) -> &BuildId {
        &self.state.build
    }

    pub fn path(&self) -> &TaskPath {
        &self.state.path
    }

    /// Record the outcome and wake waiters. Only the first outcome sticks.
    pub(crate) fn publish(&self, outcome: ExportOutcome) {
        let mut current = self
            .state
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            debug!(task = %self.state.path, build = %self.state.build, ?outcome, "Publishing exported task outcome");
            *current = Some(outcome);
            self.state.published.notify_all();
        }
    }

    pub fn outcome(&self) -> Option<ExportOutcome> {
        *self
            .state
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the owning build publishes an outcome
    pub fn wait(&self) -> ExportOutcome {
        let mut current = self
            .state
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = *current {
                return outcome;
            }
            current = self
                .state
                .published
                .wait(current)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl fmt::Debug for ExportedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedTask")
            .field("build", &self.state.build)
            .field("path", &self.state.path)
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Looks up tasks of other builds in the same tree
pub trait CrossBuildRegistry: Send + Sync {
    /// Return a handle for `path` of `build`, queueing the task there
    fn exported_task(&self, build: &BuildId, path: &TaskPath) -> Result<ExportedTask>;

    /// Return a handle for `path` of `build` without requesting it. The
    /// outcome is `NotExecuted` unless something else schedules the task.
    fn observed_task(&self, build: &BuildId, path: &TaskPath) -> Result<ExportedTask>;
}

/// Every build controller of a tree, by build
#[derive(Default)]
pub struct BuildRegistry {
    builds: RwLock<BTreeMap<BuildId, Arc<BuildController>>>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, controller: Arc<BuildController>) -> Result<()> {
        let mut builds = self.builds.write().unwrap_or_else(PoisonError::into_inner);
        let build = controller.build().clone();
        if builds.contains_key(&build) {
            return Err(GraphError::configuration(
                format!("build '{build}'"),
                "build is already part of the build tree",
            ));
        }
        builds.insert(build, controller);
        Ok(())
    }

    pub fn get(&self, build: &BuildId) -> Option<Arc<BuildController>> {
        self.builds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(build)
            .cloned()
    }

    /// Controllers in build order
    pub fn controllers(&self) -> Vec<Arc<BuildController>> {
        self.builds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl CrossBuildRegistry for BuildRegistry {
    fn exported_task(&self, build: &BuildId, path: &TaskPath) -> Result<ExportedTask> {
        let controller = self
            .get(build)
            .ok_or_else(|| GraphError::UnknownBuild(build.clone()))?;
        controller.exported_task(path)
    }

    fn observed_task(&self, build: &BuildId, path: &TaskPath) -> Result<ExportedTask> {
        let controller = self
            .get(build)
            .ok_or_else(|| GraphError::UnknownBuild(build.clone()))?;
        controller.observed_task(path)
    }
}

impl fmt::Debug for BuildRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let builds: Vec<BuildId> = self
            .builds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("BuildRegistry").field("builds", &builds).finish()
    }
}

/// Drives every build of a tree through discovery, finalization and execution
#[derive(Debug)]
pub struct BuildTreeWorkGraph {
    services: BuildServices,
    registry: Arc<BuildRegistry>,
}

impl BuildTreeWorkGraph {
    pub fn new(config: ExecutionConfig) -> Self {
        Self::with_services(BuildServices::new(config))
    }

    pub fn with_services(services: BuildServices) -> Self {
        Self {
            services,
            registry: Arc::new(BuildRegistry::new()),
        }
    }

    pub fn services(&self) -> &BuildServices {
        &self.services
    }

    /// Add a build to the tree
    pub fn add_build(&self, tasks: Arc<TaskRegistry>) -> Result<Arc<BuildController>> {
        let registry: Arc<dyn CrossBuildRegistry> = self.registry.clone();
        let cross_build: Weak<dyn CrossBuildRegistry> = Arc::downgrade(&registry);
        let controller = Arc::new(BuildController::with_cross_build(
            tasks,
            self.services.clone(),
            cross_build,
        ));
        self.registry.insert(Arc::clone(&controller))?;
        Ok(controller)
    }

    pub fn controller(&self, build: &BuildId) -> Option<Arc<BuildController>> {
        self.registry.get(build)
    }

    /// Queue tasks of one build for execution
    pub fn request(&self, build: &BuildId, paths: &[TaskPath]) -> Result<()> {
        let controller = self
            .registry
            .get(build)
            .ok_or_else(|| GraphError::UnknownBuild(build.clone()))?;
        for path in paths {
            controller.queue_for_execution(path)?;
        }
        Ok(())
    }

    /// Schedule queued work in every build until no build discovers more.
    ///
    /// Scheduling one build can queue tasks in another through cross-build
    /// references, so the loop keeps polling until it goes quiet.
    pub fn schedule(&self) -> Result<()> {
        let mut round = 0;
        loop {
            round += 1;
            let mut progressed = false;
            for controller in self.registry.controllers() {
                progressed |= controller.schedule_queued_tasks()?;
            }
            if !progressed {
                debug!(rounds = round, "Build tree scheduling is quiescent");
                return Ok(());
            }
        }
    }

    /// Schedule, finalize and execute every build, returning all failures.
    ///
    /// A configuration or cycle error in any build aborts the run before any
    /// node executes.
    pub fn run(&self, executor: &dyn ExecutorService) -> Result<Vec<BuildFailure>> {
        self.services.clear_stop();
        self.schedule()?;

        let controllers = self.registry.controllers();
        for controller in &controllers {
            controller.finalize_work_graph()?;
        }
        self.check_cross_build_cycles(&controllers)?;

        info!(builds = controllers.len(), "Executing build tree");
        for controller in &controllers {
            controller.start_execution(executor)?;
        }

        let mut failures = Vec::new();
        for controller in &controllers {
            failures.extend(controller.await_completion()?);
        }
        for controller in &controllers {
            controller.stop()?;
        }
        Ok(failures)
    }

    /// Each build is acyclic on its own; a cycle may still run through
    /// exported tasks of several builds.
    fn check_cross_build_cycles(&self, controllers: &[Arc<BuildController>]) -> Result<()> {
        let mut ids: HashMap<(BuildId, TaskPath), NodeId> = HashMap::new();
        let mut names: Vec<String> = Vec::new();
        let mut edges: Vec<Vec<NodeId>> = Vec::new();

        let mut id_of = |build: &BuildId, path: &TaskPath, names: &mut Vec<String>, edges: &mut Vec<Vec<NodeId>>| {
            *ids.entry((build.clone(), path.clone())).or_insert_with(|| {
                let id = NodeId::new(names.len());
                names.push(format!("{path} (build '{build}')"));
                edges.push(Vec::new());
                id
            })
        };

        for controller in controllers {
            let build = controller.build().clone();
            for (from, targets) in controller.execution_edges() {
                let NodeKey::Task(from) = from else {
                    continue;
                };
                let from = id_of(&build, &from, &mut names, &mut edges);
                for target in targets {
                    let to = match target {
                        NodeKey::Task(path) => id_of(&build, &path, &mut names, &mut edges),
                        NodeKey::External { build: other, path } => {
                            id_of(&other, &path, &mut names, &mut edges)
                        }
                    };
                    edges[from.index()].push(to);
                }
            }
        }

        let roots: Vec<NodeId> = (0..names.len()).map(NodeId::new).collect();
        check_for_cycles(&roots, |id| edges[id.index()].clone(), |id| names[id.index()].clone())
    }
}
