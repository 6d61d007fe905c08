//! CLI commands

mod cache;
mod graph;
mod run;

pub use cache::CacheCommand;
pub use graph::GraphCommand;
pub use run::{RunCommand, RunFailure};
