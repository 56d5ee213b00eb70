//! Resolution of declared task references into concrete targets

use std::sync::Arc;

use tracing::trace;

use crate::build_tree::{CrossBuildRegistry, ExportedTask};
use crate::error::{GraphError, Result};
use crate::task::{BuildId, RelationshipKind, TaskDefinition, TaskReference, TaskRegistry};

/// Providers may expand into further providers; past this depth the
/// expansion is treated as runaway recursion.
const MAX_PROVIDER_DEPTH: usize = 32;

/// A reference resolved to something the work graph can hold a node for
#[derive(Debug, Clone)]
pub(crate) enum ResolvedTarget {
    Task(Arc<TaskDefinition>),
    External(ExportedTask),
}

/// Turns a task's declared relationships into resolved targets
pub(crate) struct DependencyResolver<'a> {
    build: &'a BuildId,
    tasks: &'a TaskRegistry,
    cross_build: Option<&'a dyn CrossBuildRegistry>,
}

impl<'a> DependencyResolver<'a> {
    pub(crate) fn new(
        build: &'a BuildId,
        tasks: &'a TaskRegistry,
        cross_build: Option<&'a dyn CrossBuildRegistry>,
    ) -> Self {
        Self {
            build,
            tasks,
            cross_build,
        }
    }

    /// Resolve every reference of `kind` declared by `task`, handing each
    /// target to `on_target` in declaration order.
    ///
    /// Errors are attributed to `task`.
    pub(crate) fn resolve(
        &self,
        task: &TaskDefinition,
        kind: RelationshipKind,
        mut on_target: impl FnMut(ResolvedTarget),
    ) -> Result<()> {
        for reference in task.relationship(kind) {
            self.resolve_reference(task, kind, reference, 0, &mut on_target)?;
        }
        Ok(())
    }

    fn resolve_reference(
        &self,
        task: &TaskDefinition,
        kind: RelationshipKind,
        reference: &TaskReference,
        depth: usize,
        on_target: &mut impl FnMut(ResolvedTarget),
    ) -> Result<()> {
        match reference {
            TaskReference::Path(path) => {
                let resolved = task.path().resolve(path).ok_or_else(|| {
                    GraphError::configuration(task.path(), format!("invalid task path '{path}'"))
                })?;
                let target = self.tasks.get(&resolved).ok_or_else(|| {
                    GraphError::configuration(
                        task.path(),
                        format!("task '{resolved}' not found in build '{}'", self.build),
                    )
                })?;
                trace!(from = %task.path(), to = %resolved, "Resolved task reference");
                on_target(ResolvedTarget::Task(target));
            }
            TaskReference::Matching(pattern) => {
                for target in self.tasks.matching(pattern) {
                    on_target(ResolvedTarget::Task(target));
                }
            }
            TaskReference::Provider(provider) => {
                if depth >= MAX_PROVIDER_DEPTH {
                    return Err(GraphError::configuration(
                        task.path(),
                        "task reference providers nest too deeply",
                    ));
                }
                for provided in provider() {
                    self.resolve_reference(task, kind, &provided, depth + 1, on_target)?;
                }
            }
            TaskReference::InBuild { build, path } => {
                if build == self.build {
                    let target = self.tasks.get(path).ok_or_else(|| {
                        GraphError::configuration(
                            task.path(),
                            format!("task '{path}' not found in build '{build}'"),
                        )
                    })?;
                    on_target(ResolvedTarget::Task(target));
                    return Ok(());
                }
                let registry = self.cross_build.ok_or_else(|| {
                    GraphError::configuration(
                        task.path(),
                        format!("cannot reference task '{path}' of build '{build}' outside a build tree"),
                    )
                })?;
                // Ordering never requests the other task; finalizers must be local
                let handle = match kind {
                    RelationshipKind::Dependency => registry.exported_task(build, path),
                    RelationshipKind::MustRunAfter | RelationshipKind::ShouldRunAfter => {
                        registry.observed_task(build, path)
                    }
                    RelationshipKind::FinalizedBy => {
                        return Err(GraphError::configuration(
                            task.path(),
                            format!(
                                "task '{path}' of build '{build}' cannot finalize a task of build '{}'",
                                self.build
                            ),
                        ));
                    }
                };
                let exported = handle.map_err(|err| match err {
                    GraphError::UnknownBuild(_) | GraphError::Configuration { .. } => {
                        GraphError::configuration(task.path(), err.to_string())
                    }
                    other => other,
                })?;
                on_target(ResolvedTarget::External(exported));
            }
        }
        Ok(())
    }
}
