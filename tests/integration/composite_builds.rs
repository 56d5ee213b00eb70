//! Composite build tests
//!
//! Builds of one tree depend on each other's tasks through exported task
//! handles and share one pool of worker leases.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use weft::{
    BuildId, BuildTreeWorkGraph, ControllerState, ExportOutcome, GraphError, NodeState,
    TaskDefinition, TaskReference, ThreadExecutor,
};

use super::helpers::*;

fn lib_jar() -> TaskReference {
    TaskReference::in_build(BuildId::new("lib"), path(":jar"))
}

fn tree_with(max_workers: usize, log: &Log, jar_fails: bool) -> BuildTreeWorkGraph {
    init_tracing();
    let tree = BuildTreeWorkGraph::new(workers(max_workers));
    let jar = if jar_fails {
        failing_task(":jar", log)
    } else {
        recording_task(":jar", log)
    };
    tree.add_build(build("lib", vec![recording_task(":compile", log), jar.depends_on("compile")]))
        .unwrap();
    tree.add_build(build(
        "app",
        vec![recording_task(":app:compile", log).depends_on(lib_jar())],
    ))
    .unwrap();
    tree.request(&BuildId::new("app"), &[path(":app:compile")])
        .unwrap();
    tree
}

#[test]
fn test_task_of_included_build_runs_first() {
    let log = new_log();
    let tree = tree_with(2, &log, false);

    let failures = tree.run(&ThreadExecutor).unwrap();
    assert!(failures.is_empty());
    assert_eq!(recorded(&log), vec![":compile", ":jar", ":app:compile"]);

    let lib = tree.controller(&BuildId::new("lib")).unwrap();
    assert_eq!(lib.task_state(&path(":jar")), Some(NodeState::Succeeded));
    assert_eq!(lib.state(), ControllerState::Finished);
    assert_eq!(
        lib.exported_task(&path(":jar")).unwrap().outcome(),
        Some(ExportOutcome::Succeeded)
    );
}

/// The waiting node gives up its lease, so one worker is enough
#[test]
fn test_cross_build_wait_with_single_worker() {
    let log = new_log();
    let tree = tree_with(1, &log, false);

    let failures = tree.run(&ThreadExecutor).unwrap();
    assert!(failures.is_empty());
    assert_eq!(recorded(&log), vec![":compile", ":jar", ":app:compile"]);
}

#[test]
fn test_failed_upstream_task_skips_dependents() {
    let log = new_log();
    let tree = tree_with(2, &log, true);

    let failures = tree.run(&ThreadExecutor).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].task(), Some(&path(":jar")));
    assert_eq!(recorded(&log), vec![":compile", ":jar"]);

    let app = tree.controller(&BuildId::new("app")).unwrap();
    assert_eq!(app.task_state(&path(":app:compile")), Some(NodeState::Skipped));
}

#[test]
fn test_reference_to_unknown_build_is_configuration_error() {
    init_tracing();
    let log = new_log();
    let tree = BuildTreeWorkGraph::new(workers(2));
    tree.add_build(build(
        "app",
        vec![recording_task(":compile", &log)
            .depends_on(TaskReference::in_build(BuildId::new("missing"), path(":jar")))],
    ))
    .unwrap();
    tree.request(&BuildId::new("app"), &[path(":compile")]).unwrap();

    match tree.run(&ThreadExecutor).unwrap_err() {
        GraphError::Configuration { node, message } => {
            assert_eq!(node, ":compile");
            assert!(message.contains("missing"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(recorded(&log).is_empty());
}

#[test]
fn test_request_for_unknown_build_fails() {
    let tree = BuildTreeWorkGraph::new(workers(1));
    assert_eq!(
        tree.request(&BuildId::new("nope"), &[path(":a")]).unwrap_err(),
        GraphError::UnknownBuild(BuildId::new("nope"))
    );
}

#[test]
fn test_scheduling_is_quiescent_after_discovery() {
    let log = new_log();
    let tree = tree_with(2, &log, false);
    tree.schedule().unwrap();

    let lib = tree.controller(&BuildId::new("lib")).unwrap();
    assert_eq!(lib.scheduled_tasks(), vec![path(":compile"), path(":jar")]);
    assert!(!lib.schedule_queued_tasks().unwrap());

    let app = tree.controller(&BuildId::new("app")).unwrap();
    assert!(!app.schedule_queued_tasks().unwrap());
}

#[test]
fn test_ordering_on_other_build_does_not_request_its_task() {
    init_tracing();
    let log = new_log();
    let tree = BuildTreeWorkGraph::new(workers(2));
    tree.add_build(build("lib", vec![recording_task(":jar", &log)]))
        .unwrap();
    tree.add_build(build(
        "app",
        vec![
            recording_task(":app:compile", &log)
                .must_run_after(lib_jar())
                .should_run_after(lib_jar()),
            recording_task(":app:other", &log),
        ],
    ))
    .unwrap();
    tree.request(&BuildId::new("app"), &[path(":app:compile"), path(":app:other")])
        .unwrap();

    assert!(tree.run(&ThreadExecutor).unwrap().is_empty());
    let mut order = recorded(&log);
    order.sort();
    assert_eq!(order, vec![":app:compile", ":app:other"]);

    let lib = tree.controller(&BuildId::new("lib")).unwrap();
    assert!(lib.scheduled_tasks().is_empty());
    assert_eq!(
        lib.observed_task(&path(":jar")).unwrap().outcome(),
        Some(ExportOutcome::NotExecuted)
    );
}

#[test]
fn test_must_run_after_task_of_other_build_is_enforced() {
    init_tracing();
    let log = new_log();
    let jar_log = Arc::clone(&log);
    let slow_jar = TaskDefinition::new(path(":jar")).action(move |_ctx| {
        thread::sleep(Duration::from_millis(50));
        jar_log.lock().unwrap().push(":jar".to_string());
        Ok(())
    });

    let tree = BuildTreeWorkGraph::new(workers(2));
    tree.add_build(build("lib", vec![slow_jar])).unwrap();
    tree.add_build(build(
        "app",
        vec![recording_task(":app:compile", &log).must_run_after(lib_jar())],
    ))
    .unwrap();
    tree.request(&BuildId::new("lib"), &[path(":jar")]).unwrap();
    tree.request(&BuildId::new("app"), &[path(":app:compile")]).unwrap();

    assert!(tree.run(&ThreadExecutor).unwrap().is_empty());
    assert_eq!(recorded(&log), vec![":jar", ":app:compile"]);
}

#[test]
fn test_finalizer_from_other_build_is_rejected() {
    init_tracing();
    let log = new_log();
    let tree = BuildTreeWorkGraph::new(workers(2));
    tree.add_build(build("lib", vec![recording_task(":cleanup", &log)]))
        .unwrap();
    tree.add_build(build(
        "app",
        vec![recording_task(":app:compile", &log).finalized_by(TaskReference::in_build(
            BuildId::new("lib"),
            path(":cleanup"),
        ))],
    ))
    .unwrap();
    tree.request(&BuildId::new("app"), &[path(":app:compile")]).unwrap();

    match tree.run(&ThreadExecutor).unwrap_err() {
        GraphError::Configuration { node, message } => {
            assert_eq!(node, ":app:compile");
            assert!(message.contains(":cleanup"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(recorded(&log).is_empty());
    let lib = tree.controller(&BuildId::new("lib")).unwrap();
    assert!(lib.scheduled_tasks().is_empty());
}

#[test]
fn test_must_run_after_cycle_across_builds_is_rejected() {
    init_tracing();
    let log = new_log();
    let tree = BuildTreeWorkGraph::new(workers(2));
    tree.add_build(build(
        "lib",
        vec![recording_task(":jar", &log).depends_on(TaskReference::in_build(
            BuildId::new("app"),
            path(":app:compile"),
        ))],
    ))
    .unwrap();
    tree.add_build(build(
        "app",
        vec![recording_task(":app:compile", &log).must_run_after(lib_jar())],
    ))
    .unwrap();
    tree.request(&BuildId::new("lib"), &[path(":jar")]).unwrap();

    assert!(matches!(
        tree.run(&ThreadExecutor),
        Err(GraphError::Cycle { .. })
    ));
    assert!(recorded(&log).is_empty());
}
