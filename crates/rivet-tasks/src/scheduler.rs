//! Task scheduler - async executor using tokio

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, instrument, warn};

use rivet_cache::digest::hash_bytes;
use rivet_cache::{
    CacheKey, CacheKeyInputs, GlobalCacheKeyComponents, RestoreResult, SharedCache, StoreFailure,
    StoreOutcome, TaskOutputs,
};

use crate::dag::{TaskGraph, TaskNode};
use crate::error::RunnerError;
use crate::inputs::{gather_input_hashes, resolve_outputs};
use crate::reporter::{TaskEvent, TaskReporter, TransitionDetails};
use crate::runner::{RunOutput, RunRequest, TaskRunner};
use crate::task::TaskId;

/// Lifecycle of a node within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    /// Waiting on dependencies
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Satisfied from the cache
    Skipped,
    /// Never ran because a dependency failed or the run stopped
    Aborted,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Aborted
        )
    }

    /// Whether dependents may proceed
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Options for the task scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrent tasks
    pub concurrency: usize,
    /// Size of the separate pool for CPU-heavy tasks; `None` runs them in
    /// the general budget
    pub cpu_workers: Option<usize>,
    /// Keep running independent branches after a failure
    pub continue_on_failure: bool,
    /// Whether to use cache
    pub use_cache: bool,
    /// Workspace root; input paths in cache keys are relative to it
    pub root_dir: PathBuf,
    /// Build environment folded into every cache key
    pub global: GlobalCacheKeyComponents,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus(),
            cpu_workers: None,
            continue_on_failure: false,
            use_cache: true,
            root_dir: std::env::current_dir().unwrap_or_default(),
            global: GlobalCacheKeyComponents::new(env!("CARGO_PKG_VERSION"), ""),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Final result of one node
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub id: TaskId,
    pub state: NodeState,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    /// Captured or replayed stdout
    pub stdout: String,
    pub stderr: String,
    /// Fingerprint of the node, when caching was in effect
    pub cache_key: Option<CacheKey>,
    /// Failed node that caused this one to abort
    pub aborted_by: Option<TaskId>,
    /// Why a successful result was not cached
    pub store_failure: Option<StoreFailure>,
    pub reason: Option<String>,
}

impl TaskOutcome {
    fn new(id: TaskId, state: NodeState) -> Self {
        Self {
            id,
            state,
            duration: Duration::ZERO,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            cache_key: None,
            aborted_by: None,
            store_failure: None,
            reason: None,
        }
    }
}

/// Result of a whole run
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Outcomes in topological order
    pub outcomes: Vec<TaskOutcome>,
    pub duration: Duration,
    /// The run was cancelled from outside
    pub cancelled: bool,
}

impl RunSummary {
    fn count(&self, state: NodeState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count(NodeState::Succeeded)
    }

    /// Nodes satisfied from the cache
    pub fn cached(&self) -> usize {
        self.count(NodeState::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(NodeState::Failed)
    }

    pub fn aborted(&self) -> usize {
        self.count(NodeState::Aborted)
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.outcomes.iter().all(|o| o.state.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state == NodeState::Failed)
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| &o.id == id)
    }
}

/// Stops a running [`Scheduler::execute`] from another task
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Abandon nodes that have not started. Running nodes finish, or are
    /// killed when the runner supports it.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Task scheduler - executes a graph of tasks with bounded parallelism
pub struct Scheduler {
    options: SchedulerOptions,
    cache: Option<SharedCache>,
    runner: Arc<dyn TaskRunner>,
    reporter: Arc<dyn TaskReporter>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        options: SchedulerOptions,
        cache: Option<SharedCache>,
        runner: Arc<dyn TaskRunner>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            options,
            cache,
            runner,
            reporter,
            cancel: Arc::new(tx),
        }
    }

    /// Handle that cancels the current and any later run of this scheduler
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel.clone(),
        }
    }

    /// Execute all tasks in the graph
    #[instrument(skip_all, fields(tasks = graph.len(), concurrency = self.options.concurrency))]
    pub async fn execute(&self, graph: &TaskGraph) -> RunSummary {
        let start = Instant::now();
        let general = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let cpu_pool = self
            .options
            .cpu_workers
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut cancel_rx = self.cancel.subscribe();

        let mut run = RunState::new(graph, self.reporter.clone());
        run.seed();

        let mut cancelled = *cancel_rx.borrow_and_update();
        let mut stop = cancelled;
        let mut join_set: JoinSet<(TaskId, Result<NodeResult, JoinError>)> = JoinSet::new();

        loop {
            if !stop {
                let mut deferred = Vec::new();
                while let Some(Reverse((priority, id))) = run.ready.pop() {
                    let Some(node) = graph.get(&id) else {
                        continue;
                    };

                    if node.is_group() {
                        let result = run.complete_group(node);
                        run.finish(&id, result);
                        continue;
                    }

                    let pool = match (&cpu_pool, node.definition.cpu_heavy) {
                        (Some(cpu), true) => cpu,
                        _ => &general,
                    };
                    let Ok(permit) = pool.clone().try_acquire_owned() else {
                        deferred.push(Reverse((priority, id)));
                        continue;
                    };

                    debug!(task = %id, priority, "dispatching");
                    let context = NodeContext {
                        node: node.clone(),
                        upstream: run.upstream_keys(node),
                        cache: self.cache.clone().filter(|_| self.options.use_cache),
                        runner: self.runner.clone(),
                        reporter: self.reporter.clone(),
                        root_dir: self.options.root_dir.clone(),
                        global: self.options.global.clone(),
                        stop: stop_rx.clone(),
                    };
                    // Nested so a panicking task still reports its id.
                    join_set.spawn(async move {
                        let handle = tokio::spawn(run_node(context));
                        let result = handle.await;
                        drop(permit);
                        (id, result)
                    });
                }
                run.ready.extend(deferred);
            }

            if join_set.is_empty() {
                if stop || run.ready.is_empty() {
                    break;
                }
                continue;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (id, result) = match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "scheduler task failed to join");
                            continue;
                        }
                    };
                    let result = result.unwrap_or_else(|e| NodeResult::failed(format!("task panicked: {}", e)));
                    let failed = result.state == NodeState::Failed;
                    run.finish(&id, result);

                    if failed && !self.options.continue_on_failure && !stop {
                        info!(task = %id, "stopping run after failure");
                        stop = true;
                        stop_tx.send_replace(true);
                    }
                }
                changed = cancel_rx.changed(), if !stop => {
                    if changed.is_ok() && *cancel_rx.borrow_and_update() {
                        info!("run cancelled");
                        cancelled = true;
                        stop = true;
                        stop_tx.send_replace(true);
                    }
                }
            }
        }

        let reason = if cancelled {
            "run cancelled"
        } else {
            "run stopped after a failure"
        };
        run.abandon_remaining(reason);

        let duration = start.elapsed();
        let summary = run.into_summary(duration, cancelled);

        self.reporter.report(&TaskEvent::AllCompleted {
            total: summary.total(),
            succeeded: summary.succeeded(),
            cached: summary.cached(),
            failed: summary.failed(),
            aborted: summary.aborted(),
            duration,
        });

        summary
    }
}

/// Bookkeeping for one execution of a graph
struct RunState<'g> {
    graph: &'g TaskGraph,
    reporter: Arc<dyn TaskReporter>,
    states: BTreeMap<TaskId, NodeState>,
    outcomes: BTreeMap<TaskId, TaskOutcome>,
    /// Unfinished dependencies per node
    waiting_on: BTreeMap<TaskId, usize>,
    fingerprints: BTreeMap<TaskId, CacheKey>,
    ready: BinaryHeap<Reverse<(usize, TaskId)>>,
    completed: usize,
}

impl<'g> RunState<'g> {
    fn new(graph: &'g TaskGraph, reporter: Arc<dyn TaskReporter>) -> Self {
        Self {
            graph,
            reporter,
            states: graph
                .nodes()
                .keys()
                .map(|id| (id.clone(), NodeState::Pending))
                .collect(),
            outcomes: BTreeMap::new(),
            waiting_on: graph
                .nodes()
                .iter()
                .map(|(id, node)| (id.clone(), node.dependencies.len()))
                .collect(),
            fingerprints: BTreeMap::new(),
            ready: BinaryHeap::new(),
            completed: 0,
        }
    }

    fn transition(&mut self, id: &TaskId, to: NodeState, details: TransitionDetails) {
        let from = self
            .states
            .insert(id.clone(), to)
            .unwrap_or(NodeState::Pending);
        self.reporter.report(&TaskEvent::Transition {
            id: id.clone(),
            from,
            to,
            details,
        });

        if to.is_terminal() {
            self.completed += 1;
            self.reporter.report(&TaskEvent::Progress {
                completed: self.completed,
                total: self.graph.len(),
            });
        }
    }

    /// Move every node out of Pending
    fn seed(&mut self) {
        let graph = self.graph;
        for id in graph.sorted() {
            if self.waiting_on.get(id).copied().unwrap_or(0) == 0 {
                self.make_ready(id);
            } else {
                self.transition(id, NodeState::Blocked, TransitionDetails::default());
            }
        }
    }

    fn make_ready(&mut self, id: &TaskId) {
        let priority = self.graph.get(id).map_or(usize::MAX, |n| n.priority);
        self.transition(id, NodeState::Ready, TransitionDetails::default());
        self.ready.push(Reverse((priority, id.clone())));
    }

    /// Fingerprints of the direct dependencies, keyed `package#task`; `None`
    /// when any dependency has none
    fn upstream_keys(&self, node: &TaskNode) -> Option<BTreeMap<String, String>> {
        node.dependencies
            .iter()
            .map(|dep| {
                self.fingerprints
                    .get(dep)
                    .map(|key| (dep.to_string(), key.as_str().to_string()))
            })
            .collect()
    }

    /// A group succeeds once its children have; its fingerprint folds theirs
    fn complete_group(&self, node: &TaskNode) -> NodeResult {
        let mut result = NodeResult::new(NodeState::Succeeded);
        result.cache_key = self.upstream_keys(node).map(|keys| {
            let folded: String = keys
                .iter()
                .map(|(id, key)| format!("{}={}\n", id, key))
                .collect();
            CacheKey(hash_bytes(folded.as_bytes()))
        });
        result
    }

    fn finish(&mut self, id: &TaskId, result: NodeResult) {
        if result.ran {
            self.states.insert(id.clone(), NodeState::Running);
        }

        self.transition(
            id,
            result.state,
            TransitionDetails {
                elapsed: Some(result.duration),
                exit_code: result.exit_code,
                bytes_restored: result.bytes_restored,
                bytes_stored: result.bytes_stored,
                reason: result.reason.clone(),
            },
        );

        if let Some(key) = &result.cache_key {
            if result.state.is_success() {
                self.fingerprints.insert(id.clone(), key.clone());
            }
        }

        let state = result.state;
        self.outcomes.insert(
            id.clone(),
            TaskOutcome {
                id: id.clone(),
                state,
                duration: result.duration,
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
                cache_key: result.cache_key,
                aborted_by: None,
                store_failure: result.store_failure,
                reason: result.reason,
            },
        );

        if state.is_success() {
            self.release_dependents(id);
        } else {
            self.abort_dependents(id);
        }
    }

    fn release_dependents(&mut self, id: &TaskId) {
        let graph = self.graph;
        let Some(node) = graph.get(id) else {
            return;
        };
        for dependent in &node.dependents {
            if self.states.get(dependent) != Some(&NodeState::Blocked) {
                continue;
            }
            let Some(waiting) = self.waiting_on.get_mut(dependent) else {
                continue;
            };
            *waiting = waiting.saturating_sub(1);
            if *waiting == 0 {
                self.make_ready(dependent);
            }
        }
    }

    /// Abort everything downstream of a failed or aborted node
    fn abort_dependents(&mut self, root: &TaskId) {
        let graph = self.graph;
        let mut queue: VecDeque<TaskId> = graph
            .get(root)
            .map(|n| n.dependents.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(id) = queue.pop_front() {
            let state = self.states.get(&id).copied();
            if !matches!(state, Some(NodeState::Blocked | NodeState::Pending)) {
                continue;
            }

            let reason = format!("dependency {} did not succeed", root);
            self.transition(
                &id,
                NodeState::Aborted,
                TransitionDetails {
                    reason: Some(reason.clone()),
                    ..Default::default()
                },
            );
            let mut outcome = TaskOutcome::new(id.clone(), NodeState::Aborted);
            outcome.aborted_by = Some(root.clone());
            outcome.reason = Some(reason);
            self.outcomes.insert(id.clone(), outcome);

            if let Some(node) = graph.get(&id) {
                queue.extend(node.dependents.iter().cloned());
            }
        }
    }

    /// Abort nodes that never started
    fn abandon_remaining(&mut self, reason: &str) {
        let open: Vec<TaskId> = self
            .graph
            .sorted()
            .iter()
            .filter(|id| !self.states.get(*id).is_some_and(NodeState::is_terminal))
            .cloned()
            .collect();

        for id in open {
            self.transition(
                &id,
                NodeState::Aborted,
                TransitionDetails {
                    reason: Some(reason.to_string()),
                    ..Default::default()
                },
            );
            let mut outcome = TaskOutcome::new(id.clone(), NodeState::Aborted);
            outcome.reason = Some(reason.to_string());
            self.outcomes.insert(id, outcome);
        }
        self.ready.clear();
    }

    fn into_summary(mut self, duration: Duration, cancelled: bool) -> RunSummary {
        let graph = self.graph;
        let outcomes = graph
            .sorted()
            .iter()
            .filter_map(|id| self.outcomes.remove(id))
            .collect();
        RunSummary {
            outcomes,
            duration,
            cancelled,
        }
    }
}

/// What a dispatched node needs, owned so it can move into a task
struct NodeContext {
    node: TaskNode,
    upstream: Option<BTreeMap<String, String>>,
    cache: Option<SharedCache>,
    runner: Arc<dyn TaskRunner>,
    reporter: Arc<dyn TaskReporter>,
    root_dir: PathBuf,
    global: GlobalCacheKeyComponents,
    stop: watch::Receiver<bool>,
}

#[derive(Debug)]
struct NodeResult {
    state: NodeState,
    /// The command was started
    ran: bool,
    duration: Duration,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    cache_key: Option<CacheKey>,
    bytes_restored: Option<u64>,
    bytes_stored: Option<u64>,
    store_failure: Option<StoreFailure>,
    reason: Option<String>,
}

impl NodeResult {
    fn new(state: NodeState) -> Self {
        Self {
            state,
            ran: false,
            duration: Duration::ZERO,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            cache_key: None,
            bytes_restored: None,
            bytes_stored: None,
            store_failure: None,
            reason: None,
        }
    }

    fn failed(reason: String) -> Self {
        let mut result = Self::new(NodeState::Failed);
        result.reason = Some(reason);
        result
    }
}

/// Cache, run and store one script node
async fn run_node(ctx: NodeContext) -> NodeResult {
    let start = Instant::now();
    let id = &ctx.node.id;
    let definition = &ctx.node.definition;
    let command = ctx.node.command().unwrap_or_default().to_string();

    let key_inputs = match (&ctx.cache, &ctx.upstream) {
        (Some(_), Some(upstream)) => compute_key_inputs(&ctx, &command, upstream.clone()).await,
        _ => None,
    };
    let cache_key = key_inputs.as_ref().map(CacheKeyInputs::compute_key);

    let mut lookup_performed = false;
    if let (Some(cache), Some(inputs), true) = (&ctx.cache, &key_inputs, definition.cache) {
        lookup_performed = true;
        if let Some(entry) = cache.lookup(inputs).await {
            match cache.restore(&entry, &ctx.node.package_dir).await {
                RestoreResult::Restored { files, bytes, .. } => {
                    debug!(task = %id, files, bytes, "restored from cache");
                    replay(&*ctx.reporter, id, &entry.manifest.stdout, false);
                    replay(&*ctx.reporter, id, &entry.manifest.stderr, true);

                    let mut result = NodeResult::new(NodeState::Skipped);
                    result.duration = start.elapsed();
                    result.exit_code = Some(entry.manifest.exit_code);
                    result.stdout = entry.manifest.stdout;
                    result.stderr = entry.manifest.stderr;
                    result.cache_key = cache_key;
                    result.bytes_restored = Some(bytes);
                    result.reason = Some("cache hit".to_string());
                    return result;
                }
                RestoreResult::Failed(failure) => {
                    warn!(task = %id, reason = %failure, "cache restore failed, running task");
                    cache.invalidate(&entry).await;
                }
            }
        }
    }

    ctx.reporter.report(&TaskEvent::Transition {
        id: id.clone(),
        from: NodeState::Ready,
        to: NodeState::Running,
        details: TransitionDetails::default(),
    });

    let request = RunRequest {
        id,
        command: &command,
        cwd: &ctx.node.package_dir,
        env: &definition.env,
    };
    let output = ctx
        .runner
        .run(request, &*ctx.reporter, ctx.stop.clone())
        .await;

    let mut result = match output {
        Ok(output) if output.success() => {
            let mut result = NodeResult::new(NodeState::Succeeded);
            if let (Some(cache), Some(inputs), true) = (&ctx.cache, &key_inputs, definition.cache)
            {
                match store(&ctx, cache, inputs, &output, lookup_performed).await {
                    StoreOutcome::Stored { bytes, .. } => result.bytes_stored = Some(bytes),
                    StoreOutcome::NotStored(failure) => result.store_failure = Some(failure),
                }
            }
            result.exit_code = output.exit_code;
            result.stdout = output.stdout;
            result.stderr = output.stderr;
            result.cache_key = cache_key;
            result
        }
        Ok(output) => {
            let reason = match output.exit_code {
                Some(code) => format!("exited with code {}", code),
                None => "terminated by signal".to_string(),
            };
            let mut result = NodeResult::failed(reason);
            result.exit_code = output.exit_code;
            result.stdout = output.stdout;
            result.stderr = output.stderr;
            result
        }
        Err(RunnerError::Cancelled) => {
            let mut result = NodeResult::new(NodeState::Aborted);
            result.reason = Some("killed after the run was stopped".to_string());
            result
        }
        Err(e) => NodeResult::failed(e.to_string()),
    };

    result.ran = true;
    result.duration = start.elapsed();
    result
}

/// Key inputs for a node; `None` disables caching for it
async fn compute_key_inputs(
    ctx: &NodeContext,
    command: &str,
    upstream_keys: BTreeMap<String, String>,
) -> Option<CacheKeyInputs> {
    let root = ctx.root_dir.clone();
    let package_dir = ctx.node.package_dir.clone();
    let inputs = ctx.node.definition.inputs.clone();
    let outputs = ctx.node.definition.outputs.clone();

    let hashed = tokio::task::spawn_blocking(move || {
        gather_input_hashes(&root, &package_dir, &inputs, &outputs)
    })
    .await;

    let input_hashes = match hashed {
        Ok(Ok(hashes)) => hashes,
        Ok(Err(e)) => {
            warn!(task = %ctx.node.id, error = %e, "could not hash inputs, caching disabled");
            return None;
        }
        Err(e) => {
            warn!(task = %ctx.node.id, error = %e, "input hashing failed, caching disabled");
            return None;
        }
    };

    let mut key_inputs = CacheKeyInputs::new(
        &ctx.node.id.package,
        &ctx.node.id.task,
        ctx.runner.executable(),
        command,
        ctx.global.clone(),
    );
    key_inputs.input_hashes = input_hashes;
    key_inputs.upstream_keys = upstream_keys;
    key_inputs.env = ctx.node.definition.env.clone();
    Some(key_inputs)
}

async fn store(
    ctx: &NodeContext,
    cache: &SharedCache,
    inputs: &CacheKeyInputs,
    output: &RunOutput,
    lookup_performed: bool,
) -> StoreOutcome {
    let files = match resolve_outputs(&ctx.node.package_dir, &ctx.node.definition.outputs) {
        Ok(files) => files,
        Err(e) => {
            warn!(task = %ctx.node.id, error = %e, "could not resolve outputs");
            return StoreOutcome::NotStored(StoreFailure::Unavailable(e.to_string()));
        }
    };

    let outputs = TaskOutputs {
        package_root: ctx.node.package_dir.clone(),
        files,
        exit_code: output.exit_code.unwrap_or(-1),
        execution_time: output.duration,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
    };
    cache.store(inputs, &outputs, lookup_performed).await
}

fn replay(reporter: &dyn TaskReporter, id: &TaskId, captured: &str, is_stderr: bool) {
    for line in captured.lines() {
        reporter.report(&TaskEvent::Output {
            id: id.clone(),
            line: line.to_string(),
            is_stderr,
            replayed: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CollectingReporter;
    use crate::runner::cancelled;
    use crate::task::{Pipeline, TaskDefinition};
    use async_trait::async_trait;
    use rivet_cache::CacheOptions;
    use rivet_core::workspace::{PackageGraph, PackageInfo};
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Runner that records calls, writes `dist/out.txt` and can fail or hang
    #[derive(Default)]
    struct FakeRunner {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        failing: BTreeSet<String>,
        hanging: BTreeSet<String>,
        delay: Duration,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                delay: Duration::from_millis(20),
                ..Default::default()
            }
        }

        fn failing(mut self, id: &str) -> Self {
            self.failing.insert(id.to_string());
            self
        }

        fn hanging(mut self, id: &str) -> Self {
            self.hanging.insert(id.to_string());
            self
        }

        fn delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskRunner for FakeRunner {
        fn executable(&self) -> &str {
            "fake"
        }

        async fn run(
            &self,
            request: RunRequest<'_>,
            _reporter: &dyn TaskReporter,
            mut cancel: watch::Receiver<bool>,
        ) -> Result<RunOutput, RunnerError> {
            let start = Instant::now();
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            let id = request.id.to_string();
            if self.hanging.contains(&id) {
                cancelled(&mut cancel).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                return Err(RunnerError::Cancelled);
            }

            tokio::time::sleep(self.delay).await;
            let dist = request.cwd.join("dist");
            fs::create_dir_all(&dist).unwrap();
            fs::write(dist.join("out.txt"), format!("output of {}", id)).unwrap();
            self.running.fetch_sub(1, Ordering::SeqCst);

            let code = if self.failing.contains(&id) { 1 } else { 0 };
            Ok(RunOutput {
                exit_code: Some(code),
                stdout: format!("built {}\n", id),
                stderr: String::new(),
                duration: start.elapsed(),
            })
        }
    }

    struct Fixture {
        temp: TempDir,
        packages: Vec<PackageInfo>,
    }

    impl Fixture {
        /// Packages named by `deps` entries; each entry lists upstream packages
        fn new(deps: &[(&str, &[&str])]) -> Self {
            let temp = TempDir::new().unwrap();
            let packages = deps
                .iter()
                .map(|(name, upstream)| {
                    let dir = temp.path().join(name);
                    fs::create_dir_all(dir.join("src")).unwrap();
                    fs::write(dir.join("src/index.ts"), format!("// {}", name)).unwrap();
                    upstream.iter().fold(
                        PackageInfo::new(*name, dir).with_script("build", "tsc"),
                        |pkg, dep| pkg.with_dependency(*dep),
                    )
                })
                .collect();
            Self { temp, packages }
        }

        fn root(&self) -> &Path {
            self.temp.path()
        }

        fn graph(&self, pipeline: &Pipeline, targets: &[&str]) -> TaskGraph {
            let package_graph = PackageGraph::build(&self.packages).unwrap();
            let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
            TaskGraph::build(pipeline, &self.packages, &package_graph, &targets, None).unwrap()
        }

        fn options(&self) -> SchedulerOptions {
            SchedulerOptions {
                concurrency: 4,
                root_dir: self.root().to_path_buf(),
                global: GlobalCacheKeyComponents::new("test", "lock"),
                ..Default::default()
            }
        }

        fn cache(&self) -> SharedCache {
            SharedCache::new(self.root().join(".rivet-cache"), CacheOptions::default())
        }
    }

    fn build_pipeline() -> Pipeline {
        Pipeline::new().with_task(
            TaskDefinition::new("build")
                .with_depends_on("^build")
                .with_outputs(vec!["dist/out.txt".to_string()]),
        )
    }

    fn id(s: &str) -> TaskId {
        TaskId::parse(s).unwrap()
    }

    fn scheduler(
        options: SchedulerOptions,
        cache: Option<SharedCache>,
        runner: &Arc<FakeRunner>,
        reporter: &Arc<CollectingReporter>,
    ) -> Scheduler {
        Scheduler::new(options, cache, runner.clone(), reporter.clone())
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &["a"])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let cache = fixture.cache();
        let runner = Arc::new(FakeRunner::new());
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(fixture.options(), Some(cache.clone()), &runner, &reporter);

        let first = scheduler.execute(&graph).await;
        assert!(first.is_success());
        assert_eq!(first.succeeded(), 2);
        assert_eq!(runner.calls(), 2);
        assert_eq!(cache.statistics().miss_count, 2);
        assert_eq!(cache.statistics().hit_count, 0);

        fs::remove_file(fixture.root().join("a/dist/out.txt")).unwrap();
        reporter.clear();

        let second = scheduler.execute(&graph).await;
        assert!(second.is_success());
        assert_eq!(second.cached(), 2);
        assert_eq!(runner.calls(), 2);
        assert!(reporter.entered(NodeState::Running).is_empty());

        let stats = cache.statistics();
        assert_eq!(stats.hit_count, 2);
        assert!(stats.time_saved_ms > 0);

        // Outputs restored and output replayed
        assert_eq!(
            fs::read_to_string(fixture.root().join("a/dist/out.txt")).unwrap(),
            "output of a#build"
        );
        let replayed: Vec<String> = reporter
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Output { line, replayed: true, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert!(replayed.contains(&"built a#build".to_string()));

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_corrupted_entry_is_rebuilt_and_replaced() {
        let fixture = Fixture::new(&[("a", &[])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let cache = SharedCache::new(
            fixture.root().join(".rivet-cache"),
            CacheOptions {
                verify_integrity: true,
                ..Default::default()
            },
        );
        let runner = Arc::new(FakeRunner::new());
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(fixture.options(), Some(cache.clone()), &runner, &reporter);
        let a = id("a#build");

        assert!(scheduler.execute(&graph).await.is_success());
        assert_eq!(runner.calls(), 1);

        let key = scheduler
            .execute(&graph)
            .await
            .get(&a)
            .and_then(|o| o.cache_key.clone())
            .unwrap();
        let cached = cache.entry_path(&key).join("outputs/dist/out.txt");
        fs::write(&cached, "tampered").unwrap();
        let hits = cache.statistics().hit_count;
        let saved = cache.statistics().time_saved_ms;

        // The entry fails verification: the task runs and the entry is rewritten.
        let rerun = scheduler.execute(&graph).await;
        let outcome = rerun.get(&a).unwrap();
        assert_eq!(outcome.state, NodeState::Succeeded);
        assert_eq!(outcome.store_failure, None);
        assert_eq!(runner.calls(), 2);
        assert_eq!(fs::read_to_string(&cached).unwrap(), "output of a#build");
        assert_eq!(cache.statistics().hit_count, hits);
        assert_eq!(cache.statistics().time_saved_ms, saved);

        let next = scheduler.execute(&graph).await;
        assert_eq!(next.get(&a).unwrap().state, NodeState::Skipped);
        assert_eq!(runner.calls(), 2);
        assert_eq!(cache.statistics().hit_count, hits + 1);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_changed_input_reruns_dependents() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &["a"])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let cache = fixture.cache();
        let runner = Arc::new(FakeRunner::new());
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(fixture.options(), Some(cache.clone()), &runner, &reporter);

        let first = scheduler.execute(&graph).await;
        fs::write(fixture.root().join("a/src/index.ts"), "// changed").unwrap();

        let second = scheduler.execute(&graph).await;
        assert_eq!(second.succeeded(), 2);
        assert_eq!(runner.calls(), 4);

        // b's own files are unchanged; its key moved with a's
        let b = id("b#build");
        let before = first.get(&b).unwrap().cache_key.clone();
        let after = second.get(&b).unwrap().cache_key.clone();
        assert!(before.is_some() && after.is_some());
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_uncached_task_always_runs() {
        let fixture = Fixture::new(&[("a", &[])]);
        let pipeline = Pipeline::new().with_task(TaskDefinition::new("build").uncached());
        let graph = fixture.graph(&pipeline, &["build"]);
        let cache = fixture.cache();
        let runner = Arc::new(FakeRunner::new());
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(fixture.options(), Some(cache.clone()), &runner, &reporter);

        scheduler.execute(&graph).await;
        scheduler.execute(&graph).await;

        assert_eq!(runner.calls(), 2);
        assert_eq!(cache.statistics().store_count, 0);
    }

    #[tokio::test]
    async fn test_failure_aborts_dependents() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let cache = fixture.cache();
        let runner = Arc::new(FakeRunner::new().failing("a#build"));
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(fixture.options(), Some(cache.clone()), &runner, &reporter);

        let summary = scheduler.execute(&graph).await;

        assert!(!summary.is_success());
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.aborted(), 2);
        assert_eq!(runner.calls(), 1);

        let b = summary.get(&id("b#build")).unwrap();
        assert_eq!(b.state, NodeState::Aborted);
        assert_eq!(b.aborted_by, Some(id("a#build")));
        let c = summary.get(&id("c#build")).unwrap();
        assert_eq!(c.aborted_by, Some(id("a#build")));

        let a = summary.get(&id("a#build")).unwrap();
        assert_eq!(a.exit_code, Some(1));
        assert_eq!(a.stdout, "built a#build\n");

        // Failed results are never cached
        assert_eq!(cache.statistics().store_count, 0);
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_independent_branches() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &["a"]), ("c", &[])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let runner = Arc::new(FakeRunner::new().failing("a#build"));
        let reporter = Arc::new(CollectingReporter::default());
        let options = SchedulerOptions {
            concurrency: 1,
            continue_on_failure: true,
            use_cache: false,
            ..fixture.options()
        };
        let scheduler = scheduler(options, None, &runner, &reporter);

        let summary = scheduler.execute(&graph).await;

        assert_eq!(summary.get(&id("a#build")).unwrap().state, NodeState::Failed);
        assert_eq!(summary.get(&id("b#build")).unwrap().state, NodeState::Aborted);
        assert_eq!(summary.get(&id("c#build")).unwrap().state, NodeState::Succeeded);
    }

    #[tokio::test]
    async fn test_failure_stops_run_by_default() {
        let fixture = Fixture::new(&[("a", &[]), ("c", &[])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let runner = Arc::new(FakeRunner::new().failing("a#build"));
        let reporter = Arc::new(CollectingReporter::default());
        let options = SchedulerOptions {
            concurrency: 1,
            use_cache: false,
            ..fixture.options()
        };
        let scheduler = scheduler(options, None, &runner, &reporter);

        let summary = scheduler.execute(&graph).await;

        assert_eq!(runner.calls(), 1);
        let c = summary.get(&id("c#build")).unwrap();
        assert_eq!(c.state, NodeState::Aborted);
        assert_eq!(c.aborted_by, None);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &[]), ("c", &[]), ("d", &[])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let runner = Arc::new(FakeRunner::new().delay(Duration::from_millis(50)));
        let reporter = Arc::new(CollectingReporter::default());
        let options = SchedulerOptions {
            concurrency: 2,
            use_cache: false,
            ..fixture.options()
        };
        let scheduler = scheduler(options, None, &runner, &reporter);

        let summary = scheduler.execute(&graph).await;

        assert!(summary.is_success());
        assert_eq!(runner.calls(), 4);
        assert!(runner.max_running.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cpu_heavy_tasks_use_dedicated_pool() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let pipeline =
            Pipeline::new().with_task(TaskDefinition::new("build").cpu_heavy());
        let graph = fixture.graph(&pipeline, &["build"]);
        let runner = Arc::new(FakeRunner::new().delay(Duration::from_millis(30)));
        let reporter = Arc::new(CollectingReporter::default());
        let options = SchedulerOptions {
            concurrency: 8,
            cpu_workers: Some(1),
            use_cache: false,
            ..fixture.options()
        };
        let scheduler = scheduler(options, None, &runner, &reporter);

        let summary = scheduler.execute(&graph).await;

        assert!(summary.is_success());
        assert_eq!(runner.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dependencies_finish_first() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &["a"])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let runner = Arc::new(FakeRunner::new());
        let reporter = Arc::new(CollectingReporter::default());
        let options = SchedulerOptions {
            use_cache: false,
            ..fixture.options()
        };
        scheduler(options, None, &runner, &reporter)
            .execute(&graph)
            .await;

        let events = reporter.events();
        let position = |target: &TaskId, state: NodeState| {
            events
                .iter()
                .position(|e| matches!(e, TaskEvent::Transition { id, to, .. } if id == target && *to == state))
                .unwrap()
        };
        assert!(
            position(&id("a#build"), NodeState::Succeeded)
                < position(&id("b#build"), NodeState::Running)
        );
        assert!(
            position(&id("b#build"), NodeState::Blocked) < position(&id("b#build"), NodeState::Ready)
        );
    }

    #[tokio::test]
    async fn test_progress_counts_every_terminal_node() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &["a"])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let cache = fixture.cache();
        let runner = Arc::new(FakeRunner::new());
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(fixture.options(), Some(cache), &runner, &reporter);

        for _ in 0..2 {
            reporter.clear();
            scheduler.execute(&graph).await;

            let progress: Vec<(usize, usize)> = reporter
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    TaskEvent::Progress { completed, total } => Some((completed, total)),
                    _ => None,
                })
                .collect();
            assert_eq!(progress, vec![(1, 2), (2, 2)]);
        }
    }

    #[tokio::test]
    async fn test_group_task_completes_without_running() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &[])]);
        let pipeline = build_pipeline().with_task(TaskDefinition::group("ci").with_depends_on("build"));
        let graph = fixture.graph(&pipeline, &["ci"]);
        let runner = Arc::new(FakeRunner::new());
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(fixture.options(), Some(fixture.cache()), &runner, &reporter);

        let summary = scheduler.execute(&graph).await;

        assert!(summary.is_success());
        assert_eq!(summary.total(), 4);
        assert_eq!(runner.calls(), 2);
        let ci = summary.get(&id("a#ci")).unwrap();
        assert_eq!(ci.state, NodeState::Succeeded);
        assert!(ci.cache_key.is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &["a"])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let runner = Arc::new(FakeRunner::new());
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(fixture.options(), None, &runner, &reporter);

        let handle = scheduler.cancel_handle();
        handle.cancel();
        assert!(handle.is_cancelled());

        let summary = scheduler.execute(&graph).await;

        assert!(summary.cancelled);
        assert_eq!(summary.aborted(), 2);
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_run() {
        let fixture = Fixture::new(&[("a", &[]), ("b", &["a"])]);
        let graph = fixture.graph(&build_pipeline(), &["build"]);
        let cache = fixture.cache();
        let runner = Arc::new(FakeRunner::new().hanging("a#build"));
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(fixture.options(), Some(cache.clone()), &runner, &reporter);

        let handle = scheduler.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let summary = scheduler.execute(&graph).await;

        assert!(summary.cancelled);
        assert!(!summary.is_success());
        assert_eq!(summary.get(&id("a#build")).unwrap().state, NodeState::Aborted);
        assert_eq!(summary.get(&id("b#build")).unwrap().state, NodeState::Aborted);
        assert_eq!(cache.statistics().store_count, 0);
    }

    #[test]
    fn test_node_state() {
        assert!(NodeState::Skipped.is_success());
        assert!(NodeState::Skipped.is_terminal());
        assert!(!NodeState::Aborted.is_success());
        assert!(!NodeState::Running.is_terminal());
        assert_eq!(NodeState::Blocked.to_string(), "blocked");
    }
}
