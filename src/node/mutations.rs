//! Paths a node touches, declared and resolved
//!
//! Declared mutations live on the task definition. They are turned into
//! [`ResolvedMutations`] exactly once, when the work graph is finalized, and
//! only the resolved form is visible to execution.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{GraphError, Result};

/// Paths as declared by a task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredMutations {
    pub outputs: Vec<PathBuf>,
    pub inputs: Vec<PathBuf>,
    pub local_state: Vec<PathBuf>,
    pub destroyables: Vec<PathBuf>,
}

impl DeclaredMutations {
    /// Validate and summarize the declaration.
    ///
    /// A node that destroys paths must not also produce outputs, consume input
    /// files or keep local state.
    pub fn resolve(&self, node: impl fmt::Display) -> Result<ResolvedMutations> {
        if !self.destroyables.is_empty() {
            let mut conflicts = Vec::new();
            if !self.outputs.is_empty() {
                conflicts.push("outputs");
            }
            if !self.inputs.is_empty() {
                conflicts.push("input files");
            }
            if !self.local_state.is_empty() {
                conflicts.push("local state");
            }
            if !conflicts.is_empty() {
                return Err(GraphError::configuration(
                    node,
                    format!(
                        "a task that destroys files cannot also declare {}",
                        conflicts.join(" or ")
                    ),
                ));
            }
        }

        Ok(ResolvedMutations {
            output_paths: self
                .outputs
                .iter()
                .chain(&self.local_state)
                .cloned()
                .collect(),
            destroyable_paths: self.destroyables.iter().cloned().collect(),
            has_file_inputs: !self.inputs.is_empty(),
            has_local_state: !self.local_state.is_empty(),
        })
    }
}

/// Summary of what a scheduled node produces and removes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedMutations {
    /// Outputs and local state
    pub output_paths: BTreeSet<PathBuf>,
    pub destroyable_paths: BTreeSet<PathBuf>,
    pub has_file_inputs: bool,
    pub has_local_state: bool,
}

impl ResolvedMutations {
    /// True if one side destroys something the other produces
    pub fn conflicts_with(&self, other: &ResolvedMutations) -> bool {
        any_overlap(&self.destroyable_paths, &other.output_paths)
            || any_overlap(&self.output_paths, &other.destroyable_paths)
    }

    pub fn is_empty(&self) -> bool {
        self.output_paths.is_empty() && self.destroyable_paths.is_empty()
    }
}

fn any_overlap(left: &BTreeSet<PathBuf>, right: &BTreeSet<PathBuf>) -> bool {
    left.iter().any(|l| right.iter().any(|r| overlaps(l, r)))
}

/// Two paths overlap when one is the other or an ancestor of it
fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
