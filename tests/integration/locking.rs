//! Lock discipline tests
//!
//! Project locks, shared resources and worker leases observed through task
//! overlap.

use std::sync::{Arc, Mutex};

use serial_test::serial;

use weft::locks::ResourceKey;
use weft::{BuildId, BuildTreeWorkGraph, ProjectId, TaskDefinition, ThreadExecutor};

use super::helpers::*;

fn run_concurrently(config: weft::ExecutionConfig, tasks: Vec<TaskDefinition>, requested: &[&str]) {
    let (_tree, failures) = run_single_build(config, tasks, requested);
    assert!(failures.is_empty());
}

#[test]
#[serial]
fn test_tasks_of_one_project_do_not_overlap() {
    let concurrency = Concurrency::default();
    run_concurrently(
        workers(2),
        vec![concurrency.task(":p:one"), concurrency.task(":p:two")],
        &[":p:one", ":p:two"],
    );
    assert_eq!(concurrency.peak(), 1);
}

#[test]
#[serial]
fn test_tasks_of_different_projects_overlap() {
    let concurrency = Concurrency::default();
    run_concurrently(
        workers(2),
        vec![concurrency.task(":a:one"), concurrency.task(":b:two")],
        &[":a:one", ":b:two"],
    );
    assert_eq!(concurrency.peak(), 2);
}

#[test]
#[serial]
fn test_isolated_tasks_of_one_project_overlap() {
    let concurrency = Concurrency::default();
    run_concurrently(
        workers(2),
        vec![
            concurrency.task(":p:one").isolated(),
            concurrency.task(":p:two").isolated(),
        ],
        &[":p:one", ":p:two"],
    );
    assert_eq!(concurrency.peak(), 2);
}

#[test]
#[serial]
fn test_shared_resource_is_exclusive() {
    let concurrency = Concurrency::default();
    run_concurrently(
        workers(2),
        vec![
            concurrency.task(":a:serve").isolated().uses_shared_resource("port-8080"),
            concurrency.task(":b:serve").isolated().uses_shared_resource("port-8080"),
        ],
        &[":a:serve", ":b:serve"],
    );
    assert_eq!(concurrency.peak(), 1);
}

#[test]
#[serial]
fn test_projects_share_one_lock_without_parallel_projects() {
    let concurrency = Concurrency::default();
    run_concurrently(
        workers(2).with_parallel_projects(false),
        vec![concurrency.task(":a:one"), concurrency.task(":b:two")],
        &[":a:one", ":b:two"],
    );
    assert_eq!(concurrency.peak(), 1);
}

/// The coarse lock covers one build, so builds of a tree still overlap
#[test]
#[serial]
fn test_builds_run_in_parallel_without_parallel_projects() {
    init_tracing();
    let concurrency = Concurrency::default();
    let tree = BuildTreeWorkGraph::new(workers(2).with_parallel_projects(false));
    tree.add_build(build("a", vec![concurrency.task(":work")])).unwrap();
    tree.add_build(build("b", vec![concurrency.task(":work")])).unwrap();
    tree.request(&BuildId::new("a"), &[path(":work")]).unwrap();
    tree.request(&BuildId::new("b"), &[path(":work")]).unwrap();

    assert!(tree.run(&ThreadExecutor).unwrap().is_empty());
    assert_eq!(concurrency.peak(), 2);
}

/// Reading another project's state swaps the project state locks and keeps
/// the task execution lock
#[test]
fn test_cross_project_access_swaps_state_locks() {
    init_tracing();
    let tree = BuildTreeWorkGraph::new(workers(2));
    let services = tree.services().clone();
    let observed = Arc::new(Mutex::new(None));

    let seen = Arc::clone(&observed);
    let task = TaskDefinition::new(path(":a:sync")).action(move |ctx| {
        let main = BuildId::new("main");
        let own = ResourceKey::ProjectState(ProjectId::new(main.clone(), ":a"));
        let execution = ResourceKey::TaskExecution(ProjectId::new(main.clone(), ":a"));
        let other = ProjectId::new(main, ":b");
        let other_key = ResourceKey::ProjectState(other.clone());
        let coordinator = services.coordinator();

        let inside = ctx.with_project_state(&other, || {
            (
                coordinator.holds(&other_key),
                coordinator.holds(&own),
                coordinator.holds(&execution),
            )
        });
        let after = (coordinator.holds(&own), coordinator.holds(&other_key));
        *seen.lock().unwrap() = Some((inside, after));
        Ok(())
    });

    tree.add_build(build("main", vec![task])).unwrap();
    tree.request(&BuildId::new("main"), &[path(":a:sync")]).unwrap();
    assert!(tree.run(&ThreadExecutor).unwrap().is_empty());

    let (inside, after) = observed.lock().unwrap().take().unwrap();
    assert_eq!(inside, (true, false, true));
    assert_eq!(after, (true, false));
}

/// Awaiting completion lends the caller's lease to the build's workers
#[test]
fn test_awaiting_caller_releases_its_worker_lease() {
    init_tracing();
    let log = new_log();
    let tree = BuildTreeWorkGraph::new(workers(1));
    tree.add_build(build("main", vec![recording_task(":a", &log)]))
        .unwrap();
    tree.request(&BuildId::new("main"), &[path(":a")]).unwrap();

    let leases = tree.services().worker_leases();
    let _lease = leases.acquire();
    let failures = tree.run(&ThreadExecutor).unwrap();

    assert!(failures.is_empty());
    assert_eq!(recorded(&log), vec![":a"]);
    assert!(leases.holds_lease());
}
