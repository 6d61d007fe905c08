//! Rivet Core - shared foundations for the Rivet build orchestrator
//!
//! This crate provides error types, configuration loading and the package
//! inventory (script names, upstream dependencies) that the task graph is
//! expanded against.

pub mod config;
pub mod error;
pub mod workspace;

pub use config::{load_config, load_config_or_default, CacheConfig, Config, PipelineTask};
pub use error::{ConfigError, Result, RivetError, WorkspaceError};
pub use workspace::{ConfigPackageSource, PackageGraph, PackageInfo, PackageSource};
