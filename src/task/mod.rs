//! Task declarations consumed by the work graph
//!
//! Tasks are declared by an embedding build tool. The engine only sees their
//! identity, their relationships to other tasks, the paths they touch and an
//! action to run.

pub mod registry;


use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::locks::ProjectAccess;
use crate::node::mutations::DeclaredMutations;

pub use registry::TaskRegistry;

/// Identity of one build taking part in a build tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildId(String);

impl BuildId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A project within a build, the unit of mutable state guarded by project locks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId {
    pub build: BuildId,
    pub path: String,
}

impl ProjectId {
    pub fn new(build: BuildId, path: impl Into<String>) -> Self {
        Self {
            build,
            path: path.into(),
        }
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project '{}' (build '{}')", self.path, self.build)
    }
}

/// Fully qualified task path, `:` for the root project.
///
/// `:compile` is task `compile` of the root project, `:lib:core:test` is task
/// `test` of project `:lib:core`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskPath {
    project: String,
    name: String,
}

impl TaskPath {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }

    /// Parse an absolute task path such as `:app:compile`.
    pub fn parse(path: &str) -> Option<Self> {
        if !path.starts_with(':') {
            return None;
        }
        let split = path.rfind(':')?;
        let name = &path[split + 1..];
        if name.is_empty() {
            return None;
        }
        let project = if split == 0 { ":" } else { &path[..split] };
        Some(Self::new(project, name))
    }

    /// Resolve a reference string relative to this task's project.
    ///
    /// Absolute references start with `:`; anything else names a task in the
    /// same project.
    pub fn resolve(&self, reference: &str) -> Option<Self> {
        if reference.starts_with(':') {
            Self::parse(reference)
        } else if reference.is_empty() || reference.contains(':') {
            None
        } else {
            Some(Self::new(self.project.clone(), reference))
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.project == ":" {
            write!(f, ":{}", self.name)
        } else {
            write!(f, "{}:{}", self.project, self.name)
        }
    }
}

/// Lazily evaluated collection of references
pub type ReferenceProvider = Arc<dyn Fn() -> Vec<TaskReference> + Send + Sync>;

/// An abstract reference from one task to others, resolved when the
/// referencing task is scheduled.
#[derive(Clone)]
pub enum TaskReference {
    /// A task path, relative to the referencing task's project unless it starts with `:`
    Path(String),
    /// Every task of the build whose path matches the pattern
    Matching(glob::Pattern),
    /// References computed on demand; the provider may register new tasks
    Provider(ReferenceProvider),
    /// A task of another build in the same build tree
    InBuild { build: BuildId, path: TaskPath },
}

impl TaskReference {
    pub fn path(path: impl Into<String>) -> Self {
        Self::Path(path.into())
    }

    pub fn matching(pattern: &str) -> Result<Self, glob::PatternError> {
        Ok(Self::Matching(glob::Pattern::new(pattern)?))
    }

    pub fn provider<F>(provider: F) -> Self
    where
        F: Fn() -> Vec<TaskReference> + Send + Sync + 'static,
    {
        Self::Provider(Arc::new(provider))
    }

    pub fn in_build(build: BuildId, path: TaskPath) -> Self {
        Self::InBuild { build, path }
    }
}

impl From<&str> for TaskReference {
    fn from(path: &str) -> Self {
        Self::Path(path.to_string())
    }
}

impl From<&TaskPath> for TaskReference {
    fn from(path: &TaskPath) -> Self {
        Self::Path(path.to_string())
    }
}

impl fmt::Debug for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Matching(pattern) => f.debug_tuple("Matching").field(&pattern.as_str()).finish(),
            Self::Provider(_) => f.write_str("Provider(..)"),
            Self::InBuild { build, path } => f
                .debug_struct("InBuild")
                .field("build", build)
                .field("path", path)
                .finish(),
        }
    }
}

/// The relationship kinds a task may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    Dependency,
    FinalizedBy,
    MustRunAfter,
    ShouldRunAfter,
}

/// The side effect performed when a task runs
pub trait TaskAction: Send + Sync {
    fn execute(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()>;
}

impl<F> TaskAction for F
where
    F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Handed to a running task action
pub struct TaskContext<'a> {
    path: &'a TaskPath,
    project: ProjectId,
    access: ProjectAccess<'a>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(path: &'a TaskPath, project: ProjectId, access: ProjectAccess<'a>) -> Self {
        Self {
            path,
            project,
            access,
        }
    }

    pub fn path(&self) -> &TaskPath {
        self.path
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// Run `f` while holding the state lock of another project.
    ///
    /// The running task's own project state lock is released for the
    /// duration and reacquired afterwards.
    pub fn with_project_state<T>(&self, project: &ProjectId, f: impl FnOnce() -> T) -> T {
        self.access.with_project_state(project, f)
    }
}

/// A declared unit of work
pub struct TaskDefinition {
    path: TaskPath,
    pub(crate) dependencies: Vec<TaskReference>,
    pub(crate) finalized_by: Vec<TaskReference>,
    pub(crate) must_run_after: Vec<TaskReference>,
    pub(crate) should_run_after: Vec<TaskReference>,
    pub(crate) mutations: DeclaredMutations,
    pub(crate) shared_resources: BTreeSet<String>,
    pub(crate) isolated: bool,
    pub(crate) ignore_failures: bool,
    pub(crate) action: Option<Arc<dyn TaskAction>>,
}

impl TaskDefinition {
    pub fn new(path: TaskPath) -> Self {
        Self {
            path,
            dependencies: Vec::new(),
            finalized_by: Vec::new(),
            must_run_after: Vec::new(),
            should_run_after: Vec::new(),
            mutations: DeclaredMutations::default(),
            shared_resources: BTreeSet::new(),
            isolated: false,
            ignore_failures: false,
            action: None,
        }
    }

    pub fn depends_on(mut self, reference: impl Into<TaskReference>) -> Self {
        self.dependencies.push(reference.into());
        self
    }

    pub fn finalized_by(mut self, reference: impl Into<TaskReference>) -> Self {
        self.finalized_by.push(reference.into());
        self
    }

    pub fn must_run_after(mut self, reference: impl Into<TaskReference>) -> Self {
        self.must_run_after.push(reference.into());
        self
    }

    pub fn should_run_after(mut self, reference: impl Into<TaskReference>) -> Self {
        self.should_run_after.push(reference.into());
        self
    }

    pub fn outputs(mut self, path: impl Into<PathBuf>) -> Self {
        self.mutations.outputs.push(path.into());
        self
    }

    pub fn inputs(mut self, path: impl Into<PathBuf>) -> Self {
        self.mutations.inputs.push(path.into());
        self
    }

    pub fn local_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.mutations.local_state.push(path.into());
        self
    }

    pub fn destroys(mut self, path: impl Into<PathBuf>) -> Self {
        self.mutations.destroyables.push(path.into());
        self
    }

    /// Require exclusive use of a named resource while running
    pub fn uses_shared_resource(mut self, name: impl Into<String>) -> Self {
        self.shared_resources.insert(name.into());
        self
    }

    /// Mark the task as not touching mutable project state, so it runs
    /// without holding its project's locks
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    /// Tolerate failures of this task: they are logged, not reported, and
    /// dependents still run
    pub fn ignore_failures(mut self) -> Self {
        self.ignore_failures = true;
        self
    }

    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn with_action(mut self, action: Arc<dyn TaskAction>) -> Self {
        self.action = Some(action);
        self
    }

    pub fn path(&self) -> &TaskPath {
        &self.path
    }

    pub fn relationship(&self, kind: RelationshipKind) -> &[TaskReference] {
        match kind {
            RelationshipKind::Dependency => &self.dependencies,
            RelationshipKind::FinalizedBy => &self.finalized_by,
            RelationshipKind::MustRunAfter => &self.must_run_after,
            RelationshipKind::ShouldRunAfter => &self.should_run_after,
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("path", &self.path)
            .field("dependencies", &self.dependencies)
            .field("finalized_by", &self.finalized_by)
            .field("must_run_after", &self.must_run_after)
            .field("should_run_after", &self.should_run_after)
            .field("mutations", &self.mutations)
            .field("isolated", &self.isolated)
            .finish_non_exhaustive()
    }
}
