//! Rivet Tasks - task graph building and scheduling
//!
//! This crate expands declarative task definitions against the package
//! inventory into a validated graph, then runs it with bounded parallelism,
//! consulting the shared cache before every script task.

pub mod dag;
pub mod error;
pub mod inputs;
pub mod reporter;
pub mod runner;
pub mod scheduler;
pub mod task;

pub use dag::{TaskGraph, TaskKind, TaskNode};
pub use error::{GraphError, InputError, RunnerError};
pub use reporter::{
    CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter,
    TransitionDetails,
};
pub use runner::{RunOutput, RunRequest, ShellRunner, TaskRunner};
pub use scheduler::{
    CancelHandle, NodeState, RunSummary, Scheduler, SchedulerOptions, TaskOutcome,
};
pub use task::{Pipeline, TaskDefinition, TaskId, TaskRef};
