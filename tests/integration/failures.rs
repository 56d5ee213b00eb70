//! Failure collection tests
//!
//! Task failures are collected rather than aborting the run. With
//! `fail_fast`, no new task starts once a failure is observed.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::bail;
use serial_test::serial;

use weft::{BuildId, BuildServices, BuildTreeWorkGraph, NodeState, TaskDefinition, ThreadExecutor};

use super::helpers::*;

fn two_subgraphs(log: &Log) -> Vec<TaskDefinition> {
    vec![
        failing_task(":a:fail", log),
        recording_task(":b:one", log),
        recording_task(":b:two", log).depends_on(":b:one"),
    ]
}

#[test]
fn test_independent_subgraph_completes_without_fail_fast() {
    let log = new_log();
    let (tree, failures) = run_single_build(workers(1), two_subgraphs(&log), &[":a:fail", ":b:two"]);

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].task(), Some(&path(":a:fail")));
    assert_eq!(recorded(&log), vec![":a:fail", ":b:one", ":b:two"]);

    let controller = tree.controller(&BuildId::new("main")).unwrap();
    assert_eq!(controller.task_state(&path(":b:two")), Some(NodeState::Succeeded));
}

#[test]
fn test_fail_fast_starts_no_new_tasks() {
    let log = new_log();
    let config = workers(1).with_fail_fast(true);
    let (tree, failures) = run_single_build(config, two_subgraphs(&log), &[":a:fail", ":b:two"]);

    assert_eq!(failures.len(), 1);
    assert_eq!(recorded(&log), vec![":a:fail"]);

    let controller = tree.controller(&BuildId::new("main")).unwrap();
    assert_eq!(controller.task_state(&path(":b:one")), Some(NodeState::Skipped));
    assert_eq!(controller.task_state(&path(":b:two")), Some(NodeState::Skipped));
}

/// A task already running when the failure happens is allowed to finish
#[test]
#[serial]
fn test_fail_fast_drains_running_tasks() {
    let log = new_log();
    let barrier = Arc::new(Barrier::new(2));

    let slow_log = Arc::clone(&log);
    let slow_barrier = Arc::clone(&barrier);
    let slow = TaskDefinition::new(path(":x:slow")).action(move |_ctx| {
        slow_barrier.wait();
        thread::sleep(Duration::from_millis(100));
        slow_log.lock().unwrap().push(":x:slow".to_string());
        Ok(())
    });

    let fail_barrier = Arc::clone(&barrier);
    let fail = TaskDefinition::new(path(":y:fail")).action(move |_ctx| {
        fail_barrier.wait();
        bail!("broken")
    });

    let tasks = vec![slow, fail, recording_task(":x:after", &log).depends_on(":x:slow")];
    let config = workers(2).with_fail_fast(true);
    let (tree, failures) = run_single_build(config, tasks, &[":x:after", ":y:fail"]);

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].task(), Some(&path(":y:fail")));
    assert_eq!(recorded(&log), vec![":x:slow"]);

    let controller = tree.controller(&BuildId::new("main")).unwrap();
    assert_eq!(controller.task_state(&path(":x:slow")), Some(NodeState::Succeeded));
    assert_eq!(controller.task_state(&path(":x:after")), Some(NodeState::Skipped));
}

#[test]
fn test_every_failure_is_reported() {
    let log = new_log();
    let (_tree, failures) = run_single_build(
        workers(3),
        vec![
            failing_task(":a:test", &log),
            failing_task(":b:test", &log),
            failing_task(":c:test", &log),
            recording_task(":check", &log)
                .depends_on(":a:test")
                .depends_on(":b:test")
                .depends_on(":c:test"),
        ],
        &[":check"],
    );

    let mut failed: Vec<String> = failures
        .iter()
        .filter_map(|failure| failure.task().map(ToString::to_string))
        .collect();
    failed.sort();
    assert_eq!(failed, vec![":a:test", ":b:test", ":c:test"]);
    assert!(!recorded(&log).contains(&":check".to_string()));
    assert!(failures[0].to_string().starts_with("Execution failed for task"));
}

/// A finalizer of a task that never executed is itself never executed
#[test]
fn test_finalizer_of_skipped_task_must_not_run() {
    let log = new_log();
    let (tree, failures) = run_single_build(
        workers(2),
        vec![
            failing_task(":compile", &log),
            recording_task(":test", &log)
                .depends_on("compile")
                .finalized_by("cleanup"),
            recording_task(":cleanup", &log),
        ],
        &[":test"],
    );

    assert_eq!(failures.len(), 1);
    let controller = tree.controller(&BuildId::new("main")).unwrap();
    assert_eq!(controller.task_state(&path(":test")), Some(NodeState::Skipped));
    assert_eq!(controller.task_state(&path(":cleanup")), Some(NodeState::MustNotRun));
    assert_eq!(recorded(&log), vec![":compile"]);
}

#[test]
fn test_finalizer_runs_after_failure() {
    let log = new_log();
    let (_tree, failures) = run_single_build(
        workers(2),
        vec![
            failing_task(":test", &log).finalized_by("report"),
            recording_task(":report", &log),
        ],
        &[":test"],
    );

    assert_eq!(failures.len(), 1);
    assert_eq!(recorded(&log), vec![":test", ":report"]);
}

/// A stop requested by one fail-fast run does not leak into the next run
/// sharing the same services
#[test]
fn test_services_are_reusable_after_fail_fast_stop() {
    init_tracing();
    let services = BuildServices::new(workers(1).with_fail_fast(true));

    let first_log = new_log();
    let first = BuildTreeWorkGraph::with_services(services.clone());
    first
        .add_build(build("first", vec![failing_task(":broken", &first_log)]))
        .unwrap();
    first.request(&BuildId::new("first"), &[path(":broken")]).unwrap();
    assert_eq!(first.run(&ThreadExecutor).unwrap().len(), 1);
    assert!(services.stop_requested());

    let second_log = new_log();
    let second = BuildTreeWorkGraph::with_services(services.clone());
    second
        .add_build(build("second", vec![recording_task(":ok", &second_log)]))
        .unwrap();
    second.request(&BuildId::new("second"), &[path(":ok")]).unwrap();
    assert!(second.run(&ThreadExecutor).unwrap().is_empty());
    assert_eq!(recorded(&second_log), vec![":ok"]);
}
