//! Node lifecycle states and the transitions between them

use std::fmt;

use crate::error::{GraphError, Result};

/// Status of a node in the execution lifecycle.
///
/// State machine transitions:
/// - `NotScheduled` -> `Queued` | `Scheduled` (requested, or discovered as a dependency)
/// - `Queued` -> `Scheduled` (when the queued set is merged into the graph)
/// - `Scheduled` -> `Ready` | `Skipped` | `MustNotRun`
/// - `Ready` -> `Running` | `Skipped` | `MustNotRun`
/// - `Running` -> `Succeeded` | `Failed`
/// - `Succeeded`, `Failed`, `Skipped` and `MustNotRun` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Known to the graph (referenced by something) but not part of the run
    NotScheduled,
    /// Requested for execution, not yet merged into the scheduled set
    Queued,
    /// Part of the run, waiting for its predecessors
    Scheduled,
    /// All predecessors are done; waiting for a worker and its locks
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Not executed because a dependency failed or the run stopped early
    Skipped,
    /// A finalizer whose finalized nodes never executed
    MustNotRun,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped | NodeState::MustNotRun
        )
    }

    /// Whether the node's action actually ran
    pub fn executed(&self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Failed)
    }

    pub fn is_scheduled(&self) -> bool {
        !matches!(self, NodeState::NotScheduled | NodeState::Queued)
    }

    pub fn can_transition_to(&self, new_state: &NodeState) -> bool {
        if self == new_state {
            return true;
        }

        match self {
            NodeState::NotScheduled => {
                matches!(new_state, NodeState::Queued | NodeState::Scheduled)
            }
            NodeState::Queued => matches!(new_state, NodeState::Scheduled),
            NodeState::Scheduled => matches!(
                new_state,
                NodeState::Ready | NodeState::Skipped | NodeState::MustNotRun
            ),
            NodeState::Ready => matches!(
                new_state,
                NodeState::Running | NodeState::Skipped | NodeState::MustNotRun
            ),
            NodeState::Running => {
                matches!(new_state, NodeState::Succeeded | NodeState::Failed)
            }
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped | NodeState::MustNotRun => {
                false
            }
        }
    }

    pub fn try_transition(&self, new_state: NodeState) -> Result<NodeState> {
        if self.can_transition_to(&new_state) {
            Ok(new_state)
        } else {
            Err(GraphError::illegal_state(
                "change node state",
                format!("transition {self} -> {new_state} is not allowed"),
            ))
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::NotScheduled => "NotScheduled",
            NodeState::Queued => "Queued",
            NodeState::Scheduled => "Scheduled",
            NodeState::Ready => "Ready",
            NodeState::Running => "Running",
            NodeState::Succeeded => "Succeeded",
            NodeState::Failed => "Failed",
            NodeState::Skipped => "Skipped",
            NodeState::MustNotRun => "MustNotRun",
        };
        f.write_str(name)
    }
}
