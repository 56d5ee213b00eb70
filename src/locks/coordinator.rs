//! Coordination of resource locks and worker leases
//!
//! Every lock and worker lease in a build tree is tracked in one table behind
//! a single mutex. A thread either acquires everything it asks for or
//! nothing, and waits on the shared condition variable until the table
//! changes. This keeps multi-lock acquisition free of lock-order deadlocks.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{trace, warn};

use super::ResourceKey;

/// Owner bookkeeping for locks and worker leases
#[derive(Debug)]
pub struct LockTable {
    owners: HashMap<ResourceKey, ThreadId>,
    max_leases: usize,
    /// Lease holders and their re-entrant hold count
    lease_holders: HashMap<ThreadId, usize>,
}

impl LockTable {
    fn new(max_leases: usize) -> Self {
        Self {
            owners: HashMap::new(),
            max_leases: max_leases.max(1),
            lease_holders: HashMap::new(),
        }
    }

    pub fn is_free(&self, key: &ResourceKey) -> bool {
        !self.owners.contains_key(key)
    }

    pub fn owner(&self, key: &ResourceKey) -> Option<ThreadId> {
        self.owners.get(key).copied()
    }

    /// Acquire every key for `thread`, or none of them.
    pub fn try_acquire_all(&mut self, keys: &[ResourceKey], thread: ThreadId) -> bool {
        if !keys.iter().all(|key| self.is_free(key)) {
            return false;
        }
        for key in keys {
            self.owners.insert(key.clone(), thread);
        }
        true
    }

    /// Release keys held by `thread`. Keys held by other threads are left alone.
    pub fn release_all(&mut self, keys: &[ResourceKey], thread: ThreadId) {
        for key in keys {
            match self.owners.get(key) {
                Some(owner) if *owner == thread => {
                    self.owners.remove(key);
                }
                Some(owner) => {
                    warn!(?key, ?owner, ?thread, "Refusing to release a lock held by another thread");
                }
                None => {
                    warn!(?key, ?thread, "Released a lock that was not held");
                }
            }
        }
    }

    pub fn leases_in_use(&self) -> usize {
        self.lease_holders.len()
    }

    pub fn max_leases(&self) -> usize {
        self.max_leases
    }

    pub fn holds_lease(&self, thread: ThreadId) -> bool {
        self.lease_holders.contains_key(&thread)
    }

    /// Take a worker lease for `thread`. A thread that already holds a lease
    /// takes it again without using more capacity.
    pub fn try_acquire_lease(&mut self, thread: ThreadId) -> bool {
        if let Some(count) = self.lease_holders.get_mut(&thread) {
            *count += 1;
            return true;
        }
        if self.lease_holders.len() >= self.max_leases {
            return false;
        }
        self.lease_holders.insert(thread, 1);
        true
    }

    pub fn release_lease(&mut self, thread: ThreadId) {
        match self.lease_holders.get_mut(&thread) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.lease_holders.remove(&thread);
            }
            None => warn!(?thread, "Released a worker lease that was not held"),
        }
    }

    /// Give up every lease hold of `thread`, returning the hold count
    pub(crate) fn surrender_leases(&mut self, thread: ThreadId) -> usize {
        self.lease_holders.remove(&thread).unwrap_or(0)
    }

    /// Restore a surrendered hold count once capacity is available
    pub(crate) fn try_restore_leases(&mut self, thread: ThreadId, count: usize) -> bool {
        if count == 0 {
            return true;
        }
        if self.lease_holders.len() >= self.max_leases {
            return false;
        }
        self.lease_holders.insert(thread, count);
        true
    }
}

/// The single monitor guarding all locks of a build tree
#[derive(Debug)]
pub struct ResourceLockCoordinator {
    table: Mutex<LockTable>,
    changed: Condvar,
}

impl ResourceLockCoordinator {
    pub fn new(max_workers: usize) -> Self {
        Self {
            table: Mutex::new(LockTable::new(max_workers)),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake every thread waiting for the table to change
    pub(crate) fn notify_changed(&self) {
        self.changed.notify_all();
    }

    /// Run `attempt` against the table until it yields a value, waiting for
    /// the table to change between attempts.
    pub(crate) fn wait_for<T>(&self, mut attempt: impl FnMut(&mut LockTable) -> Option<T>) -> T {
        let mut table = self.lock_table();
        loop {
            if let Some(value) = attempt(&mut table) {
                return value;
            }
            table = self
                .changed
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the current thread holds every key
    pub fn acquire(&self, keys: &[ResourceKey]) {
        let thread = thread::current().id();
        trace!(?keys, "Acquiring locks");
        self.wait_for(|table| table.try_acquire_all(keys, thread).then_some(()));
    }

    /// Acquire every key if all are free right now
    pub fn try_acquire(&self, keys: &[ResourceKey]) -> bool {
        let thread = thread::current().id();
        self.lock_table().try_acquire_all(keys, thread)
    }

    /// Release keys held by the current thread
    pub fn release(&self, keys: &[ResourceKey]) {
        let thread = thread::current().id();
        trace!(?keys, "Releasing locks");
        self.lock_table().release_all(keys, thread);
        self.notify_changed();
    }

    pub fn holds(&self, key: &ResourceKey) -> bool {
        self.lock_table().owner(key) == Some(thread::current().id())
    }
}
