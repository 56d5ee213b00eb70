//! Nodes of a work graph
//!
//! Nodes live in an arena owned by their work graph and refer to each other
//! by [`NodeId`]. Relationships are plain index sets, so a graph containing a
//! cycle (a user error) is still an ordinary value that can be walked and
//! reported.

pub mod mutations;
pub mod state;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::build_tree::ExportedTask;
use crate::error::Result;
use crate::task::{BuildId, RelationshipKind, TaskDefinition, TaskPath};

pub use mutations::{DeclaredMutations, ResolvedMutations};
pub use state::NodeState;

/// Index of a node in its work graph's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Stable identity of a node, used for deduplication and deterministic ordering
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKey {
    Task(TaskPath),
    /// A task owned by another build of the tree
    External { build: BuildId, path: TaskPath },
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Task(path) => write!(f, "{path}"),
            NodeKey::External { build, path } => write!(f, "{path} (build '{build}')"),
        }
    }
}

/// The kind of work a node performs
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A task of this build
    Task(Arc<TaskDefinition>),
    /// Waits for a task that another build executes
    External(ExportedTask),
}

impl NodeKind {
    /// Resolve the node's mutation info. External nodes touch nothing locally.
    pub fn resolve_mutations(&self, key: &NodeKey) -> Result<ResolvedMutations> {
        match self {
            NodeKind::Task(task) => task.mutations.resolve(key),
            NodeKind::External(_) => Ok(ResolvedMutations::default()),
        }
    }
}

/// Successor sets of a node, one per relationship kind
#[derive(Debug, Clone, Default)]
pub struct Relationships {
    pub dependencies: BTreeSet<NodeId>,
    pub finalizers: BTreeSet<NodeId>,
    pub must_run_after: BTreeSet<NodeId>,
    pub should_run_after: BTreeSet<NodeId>,
}

impl Relationships {
    pub fn get(&self, kind: RelationshipKind) -> &BTreeSet<NodeId> {
        match kind {
            RelationshipKind::Dependency => &self.dependencies,
            RelationshipKind::FinalizedBy => &self.finalizers,
            RelationshipKind::MustRunAfter => &self.must_run_after,
            RelationshipKind::ShouldRunAfter => &self.should_run_after,
        }
    }

    pub(crate) fn get_mut(&mut self, kind: RelationshipKind) -> &mut BTreeSet<NodeId> {
        match kind {
            RelationshipKind::Dependency => &mut self.dependencies,
            RelationshipKind::FinalizedBy => &mut self.finalizers,
            RelationshipKind::MustRunAfter => &mut self.must_run_after,
            RelationshipKind::ShouldRunAfter => &mut self.should_run_after,
        }
    }
}

/// A schedulable unit of work
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) key: NodeKey,
    pub(crate) kind: NodeKind,
    pub(crate) state: NodeState,
    /// Earliest batch that scheduled the node or something depending on it
    pub(crate) ordinal: Option<u32>,
    /// Requested directly or needed as a dependency; false for nodes that are
    /// only in the graph because they finalize something
    pub(crate) required: bool,
    pub(crate) successors: Relationships,
    /// Back-references to the nodes this node finalizes
    pub(crate) finalizes: BTreeSet<NodeId>,
    /// Relationships have been resolved from the declaration
    pub(crate) resolved: bool,
}

impl Node {
    pub(crate) fn new(id: NodeId, key: NodeKey, kind: NodeKind) -> Self {
        Self {
            id,
            key,
            kind,
            state: NodeState::NotScheduled,
            ordinal: None,
            required: false,
            successors: Relationships::default(),
            finalizes: BTreeSet::new(),
            resolved: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn ordinal(&self) -> Option<u32> {
        self.ordinal
    }

    pub fn successors(&self) -> &Relationships {
        &self.successors
    }

    pub fn finalizes(&self) -> &BTreeSet<NodeId> {
        &self.finalizes
    }

    /// Move the node into an earlier batch. A dependency never runs in a
    /// later batch than a node that needs it.
    pub(crate) fn maybe_set_ordinal(&mut self, ordinal: u32) {
        if !matches!(self.ordinal, Some(current) if current <= ordinal) {
            self.ordinal = Some(ordinal);
        }
    }

    pub(crate) fn set_state(&mut self, state: NodeState) -> Result<()> {
        self.state = self.state.try_transition(state)?;
        Ok(())
    }
}
