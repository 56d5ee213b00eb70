//! The set of tasks known to one build

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{BuildId, TaskDefinition, TaskPath};
use crate::error::{GraphError, Result};

/// All tasks declared by a build, keyed by path.
///
/// Tasks may be registered while the work graph is being populated, for
/// example by a reference provider that creates tasks on demand.
#[derive(Debug)]
pub struct TaskRegistry {
    build: BuildId,
    tasks: RwLock<BTreeMap<TaskPath, Arc<TaskDefinition>>>,
}

impl TaskRegistry {
    pub fn new(build: BuildId) -> Self {
        Self {
            build,
            tasks: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build
    }

    /// Register a task. Paths are unique within a build.
    pub fn register(&self, task: TaskDefinition) -> Result<Arc<TaskDefinition>> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(task.path()) {
            return Err(GraphError::configuration(
                task.path(),
                format!("a task with this path already exists in build '{}'", self.build),
            ));
        }
        let task = Arc::new(task);
        tasks.insert(task.path().clone(), Arc::clone(&task));
        Ok(task)
    }

    pub fn get(&self, path: &TaskPath) -> Option<Arc<TaskDefinition>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn contains(&self, path: &TaskPath) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }

    /// Tasks whose path matches `pattern`, in path order
    pub fn matching(&self, pattern: &glob::Pattern) -> Vec<Arc<TaskDefinition>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(path, _)| pattern.matches(&path.to_string()))
            .map(|(_, task)| Arc::clone(task))
            .collect()
    }

    pub fn paths(&self) -> Vec<TaskPath> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
