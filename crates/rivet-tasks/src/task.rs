//! Task types and definitions

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use rivet_core::config::{Config, PipelineTask};

use crate::error::GraphError;

/// Entry in a package override's reference lists that splices in the global
/// definition's entries
pub const INHERIT_MARKER: &str = "...";

/// Unique identifier for a task within the workspace
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Package name
    pub package: String,
    /// Task name (e.g., "build", "test", "lint")
    pub task: String,
}

impl TaskId {
    /// Create a new task ID
    pub fn new(package: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            task: task.into(),
        }
    }

    /// Parse a task ID from "package#task" format
    pub fn parse(s: &str) -> Option<Self> {
        let (package, task) = s.split_once('#')?;
        if package.is_empty() || task.is_empty() {
            return None;
        }
        Some(Self::new(package, task))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.package, self.task)
    }
}

/// A reference to other tasks in `depends_on`, `before` or `after`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRef {
    /// `build`: a task in the same package
    Local(String),
    /// `^build`: the task in every upstream dependency package
    Upstream(String),
    /// `core#build`: a task in one named package
    Scoped { package: String, task: String },
    /// `*`: every scheduled task
    Wildcard,
}

impl TaskRef {
    /// Parse a reference
    pub fn parse(reference: &str) -> Result<Self, GraphError> {
        let invalid = |reason: &str| GraphError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference == "*" {
            return Ok(Self::Wildcard);
        }
        if reference.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if reference == INHERIT_MARKER {
            return Err(invalid("'...' is only allowed in package-level task overrides"));
        }

        if let Some(task) = reference.strip_prefix('^') {
            if !is_task_name(task) {
                return Err(invalid("expected a task name after '^'"));
            }
            return Ok(Self::Upstream(task.to_string()));
        }

        if let Some((package, task)) = reference.split_once('#') {
            if package.is_empty() || !is_task_name(task) {
                return Err(invalid("expected 'package#task'"));
            }
            return Ok(Self::Scoped {
                package: package.to_string(),
                task: task.to_string(),
            });
        }

        if !is_task_name(reference) {
            return Err(invalid("task names cannot contain '#', '^' or '*'"));
        }
        Ok(Self::Local(reference.to_string()))
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(task) => f.write_str(task),
            Self::Upstream(task) => write!(f, "^{}", task),
            Self::Scoped { package, task } => write!(f, "{}#{}", package, task),
            Self::Wildcard => f.write_str("*"),
        }
    }
}

fn is_task_name(s: &str) -> bool {
    !s.is_empty() && !s.contains(['#', '^', '*'])
}

/// Definition of a task in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task name (e.g., "build", "test", "lint")
    pub name: String,

    /// Tasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Tasks this one should be dispatched ahead of
    #[serde(default)]
    pub before: Vec<String>,

    /// Tasks this one should be dispatched after
    #[serde(default)]
    pub after: Vec<String>,

    /// Runs the package script of the same name; false for group tasks
    #[serde(default = "default_true")]
    pub script: bool,

    /// Resolved tasks a group aggregates, filled in during expansion
    #[serde(default)]
    pub children: Vec<TaskId>,

    /// Input glob patterns (for cache key computation)
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Output paths or globs (for caching)
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Environment variables to pass
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Run on the dedicated CPU pool
    #[serde(default)]
    pub cpu_heavy: bool,

    /// Whether results are looked up in and stored to the cache
    #[serde(default = "default_true")]
    pub cache: bool,
}

fn default_true() -> bool {
    true
}

impl TaskDefinition {
    /// Create a script task definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            script: true,
            children: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: BTreeMap::new(),
            cpu_heavy: false,
            cache: true,
        }
    }

    /// Create a group task definition
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            script: false,
            ..Self::new(name)
        }
    }

    /// Build a definition from its config form
    pub fn from_config(name: impl Into<String>, task: &PipelineTask) -> Self {
        Self {
            name: name.into(),
            depends_on: task.depends_on.clone(),
            before: task.before.clone(),
            after: task.after.clone(),
            script: task.script,
            children: Vec::new(),
            inputs: task.inputs.clone(),
            outputs: task.outputs.clone(),
            env: task.env.clone(),
            cpu_heavy: task.cpu_heavy,
            cache: task.cache,
        }
    }

    /// Add a dependency
    pub fn with_depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Add a `before` hint
    pub fn with_before(mut self, reference: impl Into<String>) -> Self {
        self.before.push(reference.into());
        self
    }

    /// Add an `after` hint
    pub fn with_after(mut self, reference: impl Into<String>) -> Self {
        self.after.push(reference.into());
        self
    }

    /// Set input globs
    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Set output paths
    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Mark as CPU-heavy
    pub fn cpu_heavy(mut self) -> Self {
        self.cpu_heavy = true;
        self
    }

    /// Disable caching
    pub fn uncached(mut self) -> Self {
        self.cache = false;
        self
    }

    /// Whether this is a group task
    pub fn is_group(&self) -> bool {
        !self.script
    }

    /// Check definition-level rules
    pub fn validate(&self, package: Option<&str>) -> Result<(), GraphError> {
        if self.is_group() && (!self.before.is_empty() || !self.after.is_empty()) {
            return Err(GraphError::GroupTaskOrdering {
                package: package.map(str::to_string),
                task: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Replace `...` entries with the matching entries of `global`
    fn inherit(mut self, global: Option<&TaskDefinition>) -> Self {
        let splice = |own: Vec<String>, inherited: Option<&Vec<String>>| -> Vec<String> {
            let mut out = Vec::with_capacity(own.len());
            for entry in own {
                if entry == INHERIT_MARKER {
                    if let Some(inherited) = inherited {
                        out.extend(inherited.iter().cloned());
                    }
                } else {
                    out.push(entry);
                }
            }
            out
        };

        self.depends_on = splice(self.depends_on, global.map(|g| &g.depends_on));
        self.before = splice(self.before, global.map(|g| &g.before));
        self.after = splice(self.after, global.map(|g| &g.after));
        self
    }
}

/// Global task definitions plus per-package overrides
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    global: BTreeMap<String, TaskDefinition>,
    overrides: BTreeMap<String, BTreeMap<String, TaskDefinition>>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the pipeline from the `[tasks.pipeline]` and `[[packages]]` sections
    pub fn from_config(config: &Config) -> Self {
        let mut pipeline = Self::new();
        for (name, task) in &config.tasks.pipeline {
            pipeline = pipeline.with_task(TaskDefinition::from_config(name, task));
        }
        for package in &config.packages {
            for (name, task) in &package.tasks {
                pipeline =
                    pipeline.with_override(&package.name, TaskDefinition::from_config(name, task));
            }
        }
        pipeline
    }

    /// Add a global definition
    pub fn with_task(mut self, definition: TaskDefinition) -> Self {
        self.global.insert(definition.name.clone(), definition);
        self
    }

    /// Add a package-level override
    pub fn with_override(mut self, package: impl Into<String>, definition: TaskDefinition) -> Self {
        self.overrides
            .entry(package.into())
            .or_default()
            .insert(definition.name.clone(), definition);
        self
    }

    /// Global definition of a task
    pub fn global(&self, task: &str) -> Option<&TaskDefinition> {
        self.global.get(task)
    }

    /// Whether a package overrides a task
    pub fn is_overridden(&self, package: &str, task: &str) -> bool {
        self.overrides
            .get(package)
            .is_some_and(|tasks| tasks.contains_key(task))
    }

    /// Effective definition of a task in a package.
    ///
    /// A package override replaces the global definition; `...` entries in
    /// its reference lists pull in the global ones.
    pub fn definition(&self, package: &str, task: &str) -> Option<TaskDefinition> {
        let global = self.global.get(task);
        match self.overrides.get(package).and_then(|tasks| tasks.get(task)) {
            Some(local) => Some(local.clone().inherit(global)),
            None => global.cloned(),
        }
    }

    /// Names of every definition that applies to a package
    pub fn task_names(&self, package: &str) -> BTreeSet<&str> {
        let local = self.overrides.get(package).into_iter().flat_map(|tasks| tasks.keys());
        self.global.keys().chain(local).map(String::as_str).collect()
    }

    /// Whether any definition of this name exists for the package
    pub fn has_definition(&self, package: &str, task: &str) -> bool {
        self.global.contains_key(task) || self.is_overridden(package, task)
    }

    /// Validate every definition
    pub fn validate(&self) -> Result<(), GraphError> {
        for definition in self.global.values() {
            definition.validate(None)?;
        }
        for (package, tasks) in &self.overrides {
            for task in tasks.keys() {
                if let Some(effective) = self.definition(package, task) {
                    effective.validate(Some(package))?;
                }
            }
        }
        Ok(())
    }
}
