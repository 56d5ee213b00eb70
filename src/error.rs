//! Error types for graph construction and execution

use std::fmt;

use thiserror::Error;

use crate::task::{BuildId, TaskPath};

/// Result type alias using GraphError
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building, freezing or driving a work graph.
///
/// Node execution failures are not errors of this kind; they are collected
/// as [`BuildFailure`] values and returned once the run completes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A task declaration is invalid (unresolvable reference, conflicting mutations)
    #[error("Invalid configuration for {node}: {message}")]
    Configuration { node: String, message: String },

    /// The scheduled nodes contain a circular dependency
    #[error("Circular dependency between the following tasks:\n{rendered}")]
    Cycle {
        /// Every node on the reported cycle, in dependency order
        nodes: Vec<String>,
        /// Tree rendering of the cycle
        rendered: String,
    },

    /// An operation was invoked in a state that does not allow it.
    ///
    /// This always indicates a bug in the caller.
    #[error("Cannot {operation} while {state}")]
    IllegalState {
        operation: &'static str,
        state: String,
    },

    /// A cross-build reference named a build that is not part of the tree
    #[error("Unknown build: {0}")]
    UnknownBuild(BuildId),
}

impl GraphError {
    pub fn configuration(node: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::Configuration {
            node: node.to_string(),
            message: message.into(),
        }
    }

    pub fn illegal_state(operation: &'static str, state: impl fmt::Display) -> Self {
        Self::IllegalState {
            operation,
            state: state.to_string(),
        }
    }
}

/// A failure observed while executing a frozen work graph.
#[derive(Debug)]
pub enum BuildFailure {
    /// A task action returned an error or panicked
    TaskFailed { task: TaskPath, error: anyhow::Error },

    /// A whole build's execution job died before it could report per-task results
    ExecutionAborted { build: BuildId, error: anyhow::Error },
}

impl BuildFailure {
    /// The task that failed, if the failure is attributed to one.
    pub fn task(&self) -> Option<&TaskPath> {
        match self {
            BuildFailure::TaskFailed { task, .. } => Some(task),
            BuildFailure::ExecutionAborted { .. } => None,
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        match self {
            BuildFailure::TaskFailed { error, .. } => error,
            BuildFailure::ExecutionAborted { error, .. } => error,
        }
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildFailure::TaskFailed { task, error } => {
                write!(f, "Execution failed for task '{task}': {error:#}")
            }
            BuildFailure::ExecutionAborted { build, error } => {
                write!(f, "Execution of build '{build}' aborted: {error:#}")
            }
        }
    }
}

impl std::error::Error for BuildFailure {}
