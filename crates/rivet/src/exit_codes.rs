//! Exit codes for the CLI

use rivet_core::{ConfigError, RivetError, WorkspaceError};
use rivet_tasks::GraphError;

use crate::cli::commands::RunFailure;

/// Success
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error, including invalid task graphs
pub const CONFIG_ERROR: i32 = 2;

/// One or more tasks failed
pub const TASK_FAILED: i32 = 3;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Exit code for an error returned by a command
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(failure) = cause.downcast_ref::<RunFailure>() {
            return match failure {
                RunFailure::TasksFailed(_) => TASK_FAILED,
                RunFailure::Cancelled => CANCELLED,
            };
        }
        if cause.is::<GraphError>() || cause.is::<ConfigError>() || cause.is::<WorkspaceError>()
        {
            return CONFIG_ERROR;
        }
        if let Some(RivetError::Config(_) | RivetError::Workspace(_)) =
            cause.downcast_ref::<RivetError>()
        {
            return CONFIG_ERROR;
        }
    }
    ERROR
}
