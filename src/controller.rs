//! Per-build controller driving one build's participation in a build tree
//!
//! State machine (strictly forward):
//! - `DiscoveringTasks`: tasks are queued and scheduled, possibly repeatedly
//! - `ReadyToRun`: the work graph is finalized
//! - `RunningTasks`: execution was submitted to an executor
//! - `Finished`: completion was awaited and failures collected

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use anyhow::{anyhow, Context};
use tracing::{debug, info, Span};

use crate::build_tree::{CrossBuildRegistry, ExportedTask};
use crate::error::{BuildFailure, GraphError, Result};
use crate::graph::executor::{self, panic_message};
use crate::graph::WorkGraph;
use crate::node::{NodeKey, NodeState};
use crate::services::BuildServices;
use crate::task::{BuildId, TaskPath, TaskRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    DiscoveringTasks,
    ReadyToRun,
    RunningTasks,
    Finished,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::DiscoveringTasks => "discovering tasks",
            ControllerState::ReadyToRun => "ready to run",
            ControllerState::RunningTasks => "running tasks",
            ControllerState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Runs submitted jobs in the background
pub trait ExecutorService: Send + Sync {
    fn submit(&self, name: String, job: Box<dyn FnOnce() + Send + 'static>) -> anyhow::Result<()>;
}

/// Runs each job on a dedicated, named thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadExecutor;

impl ExecutorService for ThreadExecutor {
    fn submit(&self, name: String, job: Box<dyn FnOnce() + Send + 'static>) -> anyhow::Result<()> {
        thread::Builder::new()
            .name(name.clone())
            .spawn(job)
            .with_context(|| format!("Failed to spawn thread {name}"))?;
        Ok(())
    }
}

struct ControllerInner {
    state: ControllerState,
    /// Requested tasks not yet handed to the work graph
    queued: BTreeSet<TaskPath>,
    graph: WorkGraph,
}

#[derive(Default)]
struct CompletionState {
    finished: bool,
    /// A caller has taken responsibility for collecting the failures
    claimed: bool,
    failures: Vec<BuildFailure>,
}

/// Completion signal of a submitted execution
#[derive(Default)]
struct Completion {
    state: Mutex<CompletionState>,
    finished: Condvar,
}

impl Completion {
    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, failures: Vec<BuildFailure>) {
        let mut state = self.lock();
        state.failures.extend(failures);
        state.finished = true;
        self.finished.notify_all();
    }

    /// Reserve the failures for one caller. Returns false if another
    /// caller already did.
    fn claim(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.claimed, true)
    }

    fn wait(&self) -> Vec<BuildFailure> {
        let mut state = self.lock();
        while !state.finished {
            state = self
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        std::mem::take(&mut state.failures)
    }
}

/// Controls the work graph of one build
pub struct BuildController {
    build: BuildId,
    services: BuildServices,
    inner: Mutex<ControllerInner>,
    completion: Arc<Completion>,
}

impl BuildController {
    pub fn new(tasks: Arc<TaskRegistry>, services: BuildServices) -> Self {
        Self::from_graph(WorkGraph::new(tasks), services)
    }

    /// A controller whose tasks may reference tasks of other builds
    pub fn with_cross_build(
        tasks: Arc<TaskRegistry>,
        services: BuildServices,
        registry: Weak<dyn CrossBuildRegistry>,
    ) -> Self {
        Self::from_graph(WorkGraph::new(tasks).with_cross_build(registry), services)
    }

    fn from_graph(graph: WorkGraph, services: BuildServices) -> Self {
        Self {
            build: graph.build().clone(),
            services,
            inner: Mutex::new(ControllerInner {
                state: ControllerState::DiscoveringTasks,
                queued: BTreeSet::new(),
                graph,
            }),
            completion: Arc::new(Completion::default()),
        }
    }

    pub fn build(&self) -> &BuildId {
        &self.build
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in(
        &self,
        expected: ControllerState,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, ControllerInner>> {
        let inner = self.lock();
        if inner.state != expected {
            return Err(GraphError::illegal_state(
                operation,
                format!("build '{}' is {}", self.build, inner.state),
            ));
        }
        Ok(inner)
    }

    /// Request a task. Requesting an already scheduled task does nothing.
    pub fn queue_for_execution(&self, path: &TaskPath) -> Result<()> {
        let mut inner = self.lock_in(ControllerState::DiscoveringTasks, "queue tasks")?;
        if !inner.graph.is_required(path) {
            inner.queued.insert(path.clone());
        }
        Ok(())
    }

    /// Give `configurator` direct access to the work graph while tasks are
    /// still being discovered
    pub fn populate_work_graph<T>(&self, configurator: impl FnOnce(&mut WorkGraph) -> Result<T>) -> Result<T> {
        let mut inner = self.lock_in(ControllerState::DiscoveringTasks, "populate work graph")?;
        configurator(&mut inner.graph)
    }

    /// Schedule queued tasks. Returns whether the work graph grew.
    pub fn schedule_queued_tasks(&self) -> Result<bool> {
        let mut inner = self.lock_in(ControllerState::DiscoveringTasks, "schedule tasks")?;
        let ControllerInner { queued, graph, .. } = &mut *inner;
        queued.retain(|path| !graph.is_required(path));
        if queued.is_empty() {
            return Ok(false);
        }

        let batch: Vec<TaskPath> = std::mem::take(queued).into_iter().collect();
        debug!(build = %self.build, tasks = batch.len(), "Scheduling queued tasks");
        graph.schedule(&batch)
    }

    /// Check the scheduled work for cycles and freeze it
    pub fn finalize_work_graph(&self) -> Result<()> {
        let mut inner = self.lock_in(ControllerState::DiscoveringTasks, "finalize work graph")?;
        if !inner.queued.is_empty() {
            return Err(GraphError::illegal_state(
                "finalize work graph",
                format!("{} tasks of build '{}' are queued but not scheduled", inner.queued.len(), self.build),
            ));
        }
        inner.graph.finalize()?;
        inner.state = ControllerState::ReadyToRun;
        // Finalizing publishes exports of tasks that will not run
        self.services.coordinator().notify_changed();
        Ok(())
    }

    /// Submit execution of the finalized work graph. Does not block.
    ///
    /// The span current on the calling thread becomes the parent of all
    /// execution spans.
    pub fn start_execution(&self, executor: &dyn ExecutorService) -> Result<()> {
        let mut inner = self.lock_in(ControllerState::ReadyToRun, "start execution")?;
        let plan = inner.graph.begin_execution()?;
        inner.state = ControllerState::RunningTasks;
        drop(inner);

        let build = self.build.clone();
        let services = self.services.clone();
        let completion = Arc::clone(&self.completion);
        let span = Span::current();
        let job_plan = Arc::clone(&plan);

        let job = move || {
            let _entered = span.enter();
            let result = panic::catch_unwind(AssertUnwindSafe(|| executor::execute(&job_plan, &services)));
            let failures = match result {
                Ok(Ok(failures)) => failures,
                Ok(Err(err)) => vec![BuildFailure::ExecutionAborted {
                    build: build.clone(),
                    error: err.into(),
                }],
                Err(payload) => vec![BuildFailure::ExecutionAborted {
                    build: build.clone(),
                    error: anyhow!("execution panicked: {}", panic_message(payload.as_ref())),
                }],
            };
            job_plan.abandon_exports();
            services.coordinator().notify_changed();
            info!(build = %build, failures = failures.len(), "Build execution finished");
            completion.finish(failures);
        };

        if let Err(error) = executor.submit(format!("build-{}", self.build), Box::new(job)) {
            plan.abandon_exports();
            self.services.coordinator().notify_changed();
            self.completion.finish(vec![BuildFailure::ExecutionAborted {
                build: self.build.clone(),
                error,
            }]);
        }
        Ok(())
    }

    /// Wait for submitted execution to finish and return its failures.
    ///
    /// Any worker lease held by the calling thread is released while waiting.
    pub fn await_completion(&self) -> Result<Vec<BuildFailure>> {
        {
            let _inner = self.lock_in(ControllerState::RunningTasks, "await completion")?;
            if !self.completion.claim() {
                return Err(GraphError::illegal_state(
                    "await completion",
                    format!("completion of build '{}' is already being awaited", self.build),
                ));
            }
        }

        let completion = Arc::clone(&self.completion);
        let failures = self.services.worker_leases().blocking(|| completion.wait());

        let mut inner = self.lock();
        inner.graph.complete()?;
        inner.state = ControllerState::Finished;
        debug!(build = %self.build, failures = failures.len(), "Build completed");
        Ok(failures)
    }

    /// Release the controller. Not allowed while tasks are running.
    pub fn stop(&self) -> Result<()> {
        let inner = self.lock();
        if inner.state == ControllerState::RunningTasks {
            return Err(GraphError::illegal_state(
                "stop build controller",
                format!("build '{}' is {}", self.build, inner.state),
            ));
        }
        inner.graph.abandon_exports();
        self.services.coordinator().notify_changed();
        Ok(())
    }

    /// Handle for another build to wait on `path` of this build. Queues the
    /// task here if needed.
    pub fn exported_task(&self, path: &TaskPath) -> Result<ExportedTask> {
        let mut inner = self.lock();
        let export = inner.graph.export(path)?;
        if inner.state == ControllerState::DiscoveringTasks && !inner.graph.is_required(path) {
            inner.queued.insert(path.clone());
        }
        Ok(export)
    }

    /// Handle for another build to order itself after `path` of this
    /// build. Does not request the task.
    pub fn observed_task(&self, path: &TaskPath) -> Result<ExportedTask> {
        self.lock().graph.export(path)
    }

    pub fn task_state(&self, path: &TaskPath) -> Option<NodeState> {
        self.lock().graph.state_of(path)
    }

    pub fn scheduled_tasks(&self) -> Vec<TaskPath> {
        self.lock().graph.scheduled_tasks()
    }

    pub(crate) fn execution_edges(&self) -> Vec<(NodeKey, Vec<NodeKey>)> {
        self.lock().graph.execution_edges()
    }
}

impl fmt::Debug for BuildController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildController")
            .field("build", &self.build)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
