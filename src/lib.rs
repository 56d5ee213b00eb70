pub mod build_tree;
pub mod config;
pub mod controller;
pub mod error;
pub mod graph;
pub mod locks;
pub mod node;
pub mod services;
pub mod task;

pub use build_tree::{BuildTreeWorkGraph, CrossBuildRegistry, ExportOutcome, ExportedTask};
pub use config::ExecutionConfig;
pub use controller::{BuildController, ControllerState, ExecutorService, ThreadExecutor};
pub use error::{BuildFailure, GraphError, Result};
pub use graph::{GraphPhase, WorkGraph};
pub use node::NodeState;
pub use services::BuildServices;
pub use task::{BuildId, ProjectId, TaskContext, TaskDefinition, TaskPath, TaskReference, TaskRegistry};
