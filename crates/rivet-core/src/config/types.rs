//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::defaults::{default_concurrency, DEFAULT_CACHE_DIR};

/// Main configuration for Rivet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version of the config schema
    #[serde(rename = "$schema")]
    pub schema: Option<String>,

    /// Project name
    pub name: Option<String>,

    /// Task orchestration configuration
    pub tasks: TasksConfig,

    /// Shared cache configuration
    pub cache: CacheConfig,

    /// Workspace packages
    pub packages: Vec<PackageConfig>,
}

/// Task orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Maximum concurrent tasks
    pub concurrency: usize,

    /// Size of the dedicated pool for `cpu_heavy` tasks (none = share the main budget)
    pub cpu_workers: Option<usize>,

    /// Keep running independent branches after a task fails
    pub continue_on_failure: bool,

    /// Kill running tasks when the run is stopped
    pub kill_on_failure: bool,

    /// Global task definitions
    pub pipeline: BTreeMap<String, PipelineTask>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            cpu_workers: None,
            continue_on_failure: false,
            kill_on_failure: false,
            pipeline: BTreeMap::new(),
        }
    }
}

/// A task in the pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineTask {
    /// Tasks that must complete first (`build`, `^build`, `pkg#build`)
    pub depends_on: Vec<String>,

    /// Tasks this one should be dispatched ahead of
    pub before: Vec<String>,

    /// Tasks this one should be dispatched after
    pub after: Vec<String>,

    /// Whether the task runs a package script (false = group task)
    pub script: bool,

    /// Input glob patterns, relative to the package
    pub inputs: Vec<String>,

    /// Output paths or globs, relative to the package
    pub outputs: Vec<String>,

    /// Environment variables passed to the command
    pub env: BTreeMap<String, String>,

    /// Run on the dedicated CPU pool
    pub cpu_heavy: bool,

    /// Whether results of this task are cached
    pub cache: bool,
}

impl Default for PipelineTask {
    fn default() -> Self {
        Self {
            depends_on: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            script: true,
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: BTreeMap::new(),
            cpu_heavy: false,
            cache: true,
        }
    }
}

/// Shared cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,

    /// Cache directory, relative to the workspace root unless absolute
    pub dir: PathBuf,

    /// Read from the cache but never write to it
    pub skip_write: bool,

    /// Re-hash cached outputs before restoring them
    pub verify_integrity: bool,

    /// Replace an existing entry for the same key
    pub overwrite: bool,

    /// Size budget used by `cache prune`
    pub max_size_mb: Option<u64>,

    /// Age budget used by `cache prune`
    pub max_age_days: Option<u64>,

    /// Dependency lockfile folded into every cache key
    pub lockfile: Option<PathBuf>,

    /// Runtime version folded into every cache key (defaults to the Rivet version)
    pub runtime_version: Option<String>,

    /// Free-form environment mode folded into every cache key
    pub env_mode: Option<String>,

    /// Environment variables whose values bust the cache when they change
    pub cache_bust_env: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(DEFAULT_CACHE_DIR),
            skip_write: false,
            verify_integrity: false,
            overwrite: false,
            max_size_mb: None,
            max_age_days: None,
            lockfile: None,
            runtime_version: None,
            env_mode: None,
            cache_bust_env: Vec::new(),
        }
    }
}

/// A workspace package
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Package name
    pub name: String,

    /// Package directory, relative to the workspace root
    pub path: PathBuf,

    /// Script name to command
    pub scripts: BTreeMap<String, String>,

    /// Names of workspace packages this package depends on
    pub dependencies: Vec<String>,

    /// Release-group roots may reference any task
    pub release_group_root: bool,

    /// Package-level task overrides
    pub tasks: BTreeMap<String, PipelineTask>,
}
