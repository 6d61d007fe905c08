//! Task orchestration errors

use std::io;
use std::path::PathBuf;

/// Configuration errors found while building the task graph.
///
/// All of these are fatal and reported before any task runs.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A dependency or ordering reference is malformed
    #[error("Invalid task reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// A requested task exists in no package and has no definition
    #[error("Task '{0}' is not defined and no package has a script of that name")]
    UnknownTask(String),

    /// A package named on the command line or in a reference does not exist
    #[error("Unknown package '{0}'")]
    UnknownPackage(String),

    /// A reference names neither a task definition nor a package script
    #[error("Task '{task}' in package '{package}' references unknown task '{reference}'")]
    UnresolvedReference {
        package: String,
        task: String,
        reference: String,
    },

    /// A script task has no matching script in its package
    #[error("Task '{task}' in package '{package}' is a script task but the package has no '{task}' script")]
    MissingScript { package: String, task: String },

    /// A script calls back into the orchestrator
    #[error("Script '{task}' in package '{package}' invokes rivet recursively: {command}")]
    RecursiveInvocation {
        package: String,
        task: String,
        command: String,
    },

    /// A group task carries ordering hints
    #[error("Group task '{task}'{} cannot have 'before' or 'after' entries", .package.as_ref().map(|p| format!(" in package '{}'", p)).unwrap_or_default())]
    GroupTaskOrdering {
        package: Option<String>,
        task: String,
    },

    /// `*` was used as a hard dependency
    #[error("Task '{task}' in package '{package}' uses '*' in depends_on; the wildcard is only allowed in 'before' and 'after'")]
    WildcardDependency { package: String, task: String },

    /// The resolved graph contains a cycle
    #[error("Cyclic task dependency: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Failures to run a task command.
///
/// A command that runs and exits non-zero is not an error; it is reported
/// through the exit code.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The process could not be started
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Waiting for the process failed
    #[error("Failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    /// The run was cancelled and the process killed
    #[error("Task was cancelled")]
    Cancelled,
}

/// Failures while collecting input or output files
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// A glob pattern is malformed
    #[error("Invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// A file could not be read or hashed
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
