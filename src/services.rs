//! Services shared by every build executing in one build tree

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ExecutionConfig;
use crate::locks::{ProjectLocks, ResourceLockCoordinator, WorkerLeaseService};

#[derive(Debug, Clone)]
pub struct BuildServices {
    config: ExecutionConfig,
    coordinator: Arc<ResourceLockCoordinator>,
    project_locks: ProjectLocks,
    /// Set once a failure is observed while running with `fail_fast`,
    /// cleared when a build tree starts a run
    stop_requested: Arc<AtomicBool>,
}

impl BuildServices {
    pub fn new(config: ExecutionConfig) -> Self {
        let coordinator = Arc::new(ResourceLockCoordinator::new(config.max_workers));
        let project_locks = ProjectLocks::new(config.parallel_projects);
        Self {
            config,
            coordinator,
            project_locks,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ResourceLockCoordinator> {
        &self.coordinator
    }

    pub fn project_locks(&self) -> &ProjectLocks {
        &self.project_locks
    }

    pub fn worker_leases(&self) -> WorkerLeaseService {
        WorkerLeaseService::new(Arc::clone(&self.coordinator))
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Ask every build to stop starting new nodes
    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.coordinator.notify_changed();
    }

    /// Forget a stop requested by an earlier run
    pub(crate) fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
    }
}

impl Default for BuildServices {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}
