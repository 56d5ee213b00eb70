//! Cycle detection tests
//!
//! A cycle anywhere in the scheduled work aborts the run before any task
//! executes.

use std::sync::Arc;

use weft::{BuildId, BuildTreeWorkGraph, GraphError, TaskReference, ThreadExecutor};

use super::helpers::*;

/// A -> B -> C -> A fails finalization with exactly {A, B, C}
#[test]
fn test_three_task_cycle_is_reported_and_nothing_runs() {
    init_tracing();
    let log = new_log();
    let tree = BuildTreeWorkGraph::new(workers(2));
    let registry = build(
        "main",
        vec![
            recording_task(":a", &log).depends_on("b"),
            recording_task(":b", &log).depends_on("c"),
            recording_task(":c", &log).depends_on("a"),
            recording_task(":d", &log),
        ],
    );
    tree.add_build(registry).unwrap();
    tree.request(&BuildId::new("main"), &[path(":d"), path(":a")])
        .unwrap();

    let err = tree.run(&ThreadExecutor).unwrap_err();
    match &err {
        GraphError::Cycle { nodes, .. } => {
            let mut nodes = nodes.clone();
            nodes.sort();
            assert_eq!(nodes, vec![":a", ":b", ":c"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().starts_with("Circular dependency between the following tasks:"));
    assert!(recorded(&log).is_empty());
}

#[test]
fn test_cycle_discovered_through_provider() {
    init_tracing();
    let log = new_log();
    let tree = BuildTreeWorkGraph::new(workers(2));
    let registry = build(
        "main",
        vec![
            recording_task(":a", &log)
                .depends_on(TaskReference::provider(|| vec![TaskReference::path("b")])),
            recording_task(":b", &log).depends_on("a"),
        ],
    );
    tree.add_build(registry).unwrap();
    tree.request(&BuildId::new("main"), &[path(":a")]).unwrap();

    assert!(matches!(
        tree.run(&ThreadExecutor),
        Err(GraphError::Cycle { .. })
    ));
    assert!(recorded(&log).is_empty());
}

/// Each build is acyclic, but the dependencies loop through both
#[test]
fn test_cycle_across_builds_is_reported() {
    init_tracing();
    let log = new_log();
    let tree = BuildTreeWorkGraph::new(workers(2));
    let app = build(
        "app",
        vec![recording_task(":a", &log)
            .depends_on(TaskReference::in_build(BuildId::new("lib"), path(":b")))],
    );
    let lib = build(
        "lib",
        vec![recording_task(":b", &log)
            .depends_on(TaskReference::in_build(BuildId::new("app"), path(":a")))],
    );
    tree.add_build(Arc::clone(&app)).unwrap();
    tree.add_build(Arc::clone(&lib)).unwrap();
    tree.request(&BuildId::new("app"), &[path(":a")]).unwrap();

    match tree.run(&ThreadExecutor).unwrap_err() {
        GraphError::Cycle { nodes, .. } => {
            assert_eq!(nodes.len(), 2);
            assert!(nodes.iter().any(|n| n.contains("build 'app'")));
            assert!(nodes.iter().any(|n| n.contains("build 'lib'")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(recorded(&log).is_empty());
}
