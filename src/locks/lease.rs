//! Worker leases: the bounded capacity shared by every build of a tree

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use super::coordinator::ResourceLockCoordinator;

/// Hands out worker capacity backed by the lock coordinator
#[derive(Debug, Clone)]
pub struct WorkerLeaseService {
    coordinator: Arc<ResourceLockCoordinator>,
}

impl WorkerLeaseService {
    pub fn new(coordinator: Arc<ResourceLockCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn max_workers(&self) -> usize {
        self.coordinator.lock_table().max_leases()
    }

    /// Block until the current thread holds a worker lease
    pub fn acquire(&self) -> WorkerLease {
        let current = thread::current().id();
        self.coordinator
            .wait_for(|table| table.try_acquire_lease(current).then_some(()));
        WorkerLease {
            service: self.clone(),
            _not_send: PhantomData,
        }
    }

    pub fn holds_lease(&self) -> bool {
        self.coordinator
            .lock_table()
            .holds_lease(thread::current().id())
    }

    /// Run `f` without holding a worker lease.
    ///
    /// Any lease held by the current thread is given back for the duration,
    /// so other work can use the capacity while this thread blocks, and is
    /// reacquired before returning.
    pub fn blocking<T>(&self, f: impl FnOnce() -> T) -> T {
        let current = thread::current().id();
        let surrendered = self.coordinator.lock_table().surrender_leases(current);
        if surrendered == 0 {
            return f();
        }
        debug!("Releasing worker lease while blocked");
        self.coordinator.notify_changed();

        let restore = RestoreLease {
            coordinator: &self.coordinator,
            count: surrendered,
        };
        let result = f();
        drop(restore);
        result
    }
}

/// Reacquires surrendered leases, also when the blocking closure unwinds
struct RestoreLease<'a> {
    coordinator: &'a ResourceLockCoordinator,
    count: usize,
}

impl Drop for RestoreLease<'_> {
    fn drop(&mut self) {
        let current = thread::current().id();
        let count = self.count;
        self.coordinator
            .wait_for(|table| table.try_restore_leases(current, count).then_some(()));
    }
}

/// A held worker lease, released on drop by the thread that acquired it
#[derive(Debug)]
pub struct WorkerLease {
    service: WorkerLeaseService,
    _not_send: PhantomData<*const ()>,
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let coordinator = &self.service.coordinator;
        coordinator
            .lock_table()
            .release_lease(thread::current().id());
        coordinator.notify_changed();
    }
}
