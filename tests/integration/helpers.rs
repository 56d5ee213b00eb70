//! Shared test helpers for build execution integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::bail;
use tracing_subscriber::EnvFilter;

use weft::{
    BuildFailure, BuildId, BuildTreeWorkGraph, ExecutionConfig, TaskDefinition, TaskPath,
    TaskRegistry, ThreadExecutor,
};

/// Execution log shared by the tasks of a test
pub type Log = Arc<Mutex<Vec<String>>>;

/// Install a test-friendly subscriber, honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn path(p: &str) -> TaskPath {
    TaskPath::parse(p).expect("Invalid task path")
}

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn recorded(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Test helper: a task that appends its path to the log
pub fn recording_task(p: &str, log: &Log) -> TaskDefinition {
    let log = Arc::clone(log);
    let name = p.to_string();
    TaskDefinition::new(path(p)).action(move |_ctx| {
        log.lock().unwrap().push(name.clone());
        Ok(())
    })
}

/// Test helper: a task that appends its path to the log and fails
pub fn failing_task(p: &str, log: &Log) -> TaskDefinition {
    let log = Arc::clone(log);
    let name = p.to_string();
    TaskDefinition::new(path(p)).action(move |_ctx| {
        log.lock().unwrap().push(name.clone());
        bail!("{name} failed")
    })
}

/// Tracks how many tasks run at the same time
#[derive(Debug, Clone, Default)]
pub struct Concurrency {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Concurrency {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Test helper: a task that stays busy for a while, recording overlap
    pub fn task(&self, p: &str) -> TaskDefinition {
        let tracker = self.clone();
        TaskDefinition::new(path(p)).action(move |_ctx| {
            let now = tracker.active.fetch_add(1, Ordering::SeqCst) + 1;
            tracker.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(80));
            tracker.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Test helper: a task registry for one build
pub fn build(name: &str, tasks: Vec<TaskDefinition>) -> Arc<TaskRegistry> {
    let registry = TaskRegistry::new(BuildId::new(name));
    for task in tasks {
        registry.register(task).expect("Failed to register task");
    }
    Arc::new(registry)
}

/// Test helper: run `requested` tasks of a single build
pub fn run_single_build(
    config: ExecutionConfig,
    tasks: Vec<TaskDefinition>,
    requested: &[&str],
) -> (BuildTreeWorkGraph, Vec<BuildFailure>) {
    init_tracing();
    let tree = BuildTreeWorkGraph::new(config);
    let registry = build("main", tasks);
    let build_id = registry.build_id().clone();
    tree.add_build(registry).expect("Failed to add build");

    let paths: Vec<TaskPath> = requested.iter().map(|p| path(p)).collect();
    tree.request(&build_id, &paths).expect("Failed to request tasks");
    let failures = tree.run(&ThreadExecutor).expect("Build tree failed");
    (tree, failures)
}

/// Configuration with a fixed number of workers
pub fn workers(max_workers: usize) -> ExecutionConfig {
    ExecutionConfig::default().with_max_workers(max_workers)
}
