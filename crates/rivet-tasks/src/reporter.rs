//! Task execution reporting

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::scheduler::NodeState;
use crate::task::TaskId;

/// Extra data attached to a state transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionDetails {
    /// Time spent in the node so far
    pub elapsed: Option<Duration>,
    pub exit_code: Option<i32>,
    pub bytes_restored: Option<u64>,
    pub bytes_stored: Option<u64>,
    /// Why the node ended up here (abort cause, cache note)
    pub reason: Option<String>,
}

/// Events emitted during task execution
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A node changed state
    Transition {
        id: TaskId,
        from: NodeState,
        to: NodeState,
        details: TransitionDetails,
    },
    /// A task produced output, live or replayed from the cache
    Output {
        id: TaskId,
        line: String,
        is_stderr: bool,
        replayed: bool,
    },
    /// Nodes in a terminal state out of all nodes
    Progress { completed: usize, total: usize },
    /// All tasks completed
    AllCompleted {
        total: usize,
        succeeded: usize,
        cached: usize,
        failed: usize,
        aborted: usize,
        duration: Duration,
    },
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Transition {
                id,
                from,
                to,
                details,
            } => match to {
                NodeState::Running => tracing::info!(task = %id, "running"),
                NodeState::Succeeded | NodeState::Skipped => tracing::info!(
                    task = %id,
                    state = %to,
                    elapsed_ms = details.elapsed.map(|d| d.as_millis() as u64),
                    "task finished"
                ),
                NodeState::Failed => tracing::error!(
                    task = %id,
                    exit_code = details.exit_code,
                    reason = details.reason.as_deref(),
                    "task failed"
                ),
                NodeState::Aborted => tracing::warn!(
                    task = %id,
                    reason = details.reason.as_deref(),
                    "task aborted"
                ),
                _ => tracing::debug!(task = %id, %from, %to, "transition"),
            },
            TaskEvent::Output {
                id,
                line,
                is_stderr,
                ..
            } => {
                if *is_stderr {
                    tracing::debug!(task = %id, stream = "stderr", "{}", line);
                } else {
                    tracing::trace!(task = %id, stream = "stdout", "{}", line);
                }
            }
            TaskEvent::Progress { completed, total } => {
                tracing::debug!(completed, total, "progress");
            }
            TaskEvent::AllCompleted {
                total,
                succeeded,
                cached,
                failed,
                aborted,
                duration,
            } => {
                tracing::info!(
                    "All tasks complete: {}/{} succeeded ({} cached), {} failed, {} aborted ({:.1}s)",
                    succeeded + cached,
                    total,
                    cached,
                    failed,
                    aborted,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Nodes that entered `state`, in event order
    pub fn entered(&self, state: NodeState) -> Vec<TaskId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TaskEvent::Transition { id, to, .. } if to == state => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Forget collected events
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Registry of task reporters
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    /// Register a reporter that is also held elsewhere
    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        self.broadcast(event);
    }
}
