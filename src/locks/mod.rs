//! Resource locks guarding project state, task execution and shared resources

pub mod coordinator;
pub mod lease;

use std::collections::BTreeSet;

use tracing::debug;

use crate::task::{BuildId, ProjectId};

pub use coordinator::{LockTable, ResourceLockCoordinator};
pub use lease::{WorkerLease, WorkerLeaseService};

/// Something only one thread may hold at a time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    /// General mutation of a project's state
    ProjectState(ProjectId),
    /// Running a non-isolated task body of a project
    TaskExecution(ProjectId),
    /// State lock shared by every project of a build when projects do not
    /// run in parallel
    BuildState(BuildId),
    /// Execution lock shared by every project of a build when projects do
    /// not run in parallel
    BuildExecution(BuildId),
    /// A named resource declared by tasks
    Shared(String),
}

/// Maps projects to the lock keys guarding them
#[derive(Debug, Clone)]
pub struct ProjectLocks {
    parallel_projects: bool,
}

impl ProjectLocks {
    pub fn new(parallel_projects: bool) -> Self {
        Self { parallel_projects }
    }

    pub fn parallel_projects(&self) -> bool {
        self.parallel_projects
    }

    pub fn state_lock(&self, project: &ProjectId) -> ResourceKey {
        if self.parallel_projects {
            ResourceKey::ProjectState(project.clone())
        } else {
            ResourceKey::BuildState(project.build.clone())
        }
    }

    pub fn execution_lock(&self, project: &ProjectId) -> ResourceKey {
        if self.parallel_projects {
            ResourceKey::TaskExecution(project.clone())
        } else {
            ResourceKey::BuildExecution(project.build.clone())
        }
    }

    /// Keys a task must hold while running, in acquisition order.
    ///
    /// Isolated tasks only take their shared resources.
    pub fn task_locks(
        &self,
        project: &ProjectId,
        isolated: bool,
        shared_resources: &BTreeSet<String>,
    ) -> Vec<ResourceKey> {
        let mut keys = Vec::with_capacity(shared_resources.len() + 2);
        if !isolated {
            keys.push(self.state_lock(project));
            keys.push(self.execution_lock(project));
        }
        keys.extend(shared_resources.iter().cloned().map(ResourceKey::Shared));
        keys
    }
}

/// Cross-project access for a running task
#[derive(Debug)]
pub struct ProjectAccess<'a> {
    coordinator: &'a ResourceLockCoordinator,
    locks: &'a ProjectLocks,
    /// State lock held by the running task, `None` for isolated tasks
    own_state: Option<ResourceKey>,
}

impl<'a> ProjectAccess<'a> {
    pub(crate) fn new(
        coordinator: &'a ResourceLockCoordinator,
        locks: &'a ProjectLocks,
        own_state: Option<ResourceKey>,
    ) -> Self {
        Self {
            coordinator,
            locks,
            own_state,
        }
    }

    /// Run `f` under the state lock of `target`.
    ///
    /// The caller's own state lock is released first and reacquired after
    /// `f` returns (or unwinds). Its task execution lock stays held, so no
    /// other task of the caller's project can start in between. When
    /// projects do not run in parallel, every project of one build shares a
    /// state lock: access within the build needs no swap, access to another
    /// build releases the caller's build state lock.
    pub fn with_project_state<T>(&self, target: &ProjectId, f: impl FnOnce() -> T) -> T {
        let target_key = self.locks.state_lock(target);
        if self.own_state.as_ref() == Some(&target_key) {
            return f();
        }

        if let Some(own) = &self.own_state {
            self.coordinator.release(std::slice::from_ref(own));
        }
        debug!(project = %target, "Acquiring state lock of another project");
        self.coordinator.acquire(std::slice::from_ref(&target_key));

        let _restore = RestoreOwnState {
            coordinator: self.coordinator,
            target: target_key,
            own: self.own_state.clone(),
        };
        f()
    }
}

struct RestoreOwnState<'a> {
    coordinator: &'a ResourceLockCoordinator,
    target: ResourceKey,
    own: Option<ResourceKey>,
}

impl Drop for RestoreOwnState<'_> {
    fn drop(&mut self) {
        self.coordinator.release(std::slice::from_ref(&self.target));
        if let Some(own) = &self.own {
            self.coordinator.acquire(std::slice::from_ref(own));
        }
    }
}
