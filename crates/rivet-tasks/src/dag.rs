//! Task graph construction and management

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, instrument};

use rivet_core::workspace::{PackageGraph, PackageInfo};

use crate::error::GraphError;
use crate::task::{Pipeline, TaskDefinition, TaskId, TaskRef};

/// Name of the orchestrator binary, used to detect recursive invocation
const ORCHESTRATOR_BIN: &str = "rivet";

/// What a node executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TaskKind {
    /// Runs a package script
    Script { command: String },
    /// Only aggregates its dependencies
    Group,
}

/// A node in the task graph, one per package and task
#[derive(Debug, Clone, Serialize)]
pub struct TaskNode {
    /// Task identifier
    pub id: TaskId,
    pub kind: TaskKind,
    /// Effective definition after override resolution
    pub definition: TaskDefinition,
    /// Package directory
    pub package_dir: PathBuf,
    /// Tasks that must finish before this one
    pub dependencies: BTreeSet<TaskId>,
    /// Tasks waiting on this one
    pub dependents: BTreeSet<TaskId>,
    /// Dispatch priority among ready nodes; lower goes first
    pub priority: usize,
    /// Longest dependency chain below this node
    pub level: usize,
}

impl TaskNode {
    /// Script command, if this is a script task
    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Script { command } => Some(command),
            TaskKind::Group => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, TaskKind::Group)
    }
}

/// Validated, acyclic graph of tasks for one run
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: BTreeMap<TaskId, TaskNode>,
    /// Topologically sorted order (dependencies first)
    sorted_order: Vec<TaskId>,
    /// Nodes grouped by level
    levels: Vec<Vec<TaskId>>,
}

struct Builder<'a> {
    pipeline: &'a Pipeline,
    packages: BTreeMap<&'a str, &'a PackageInfo>,
    package_graph: &'a PackageGraph,
}

impl<'a> Builder<'a> {
    fn package(&self, name: &str) -> Result<&'a PackageInfo, GraphError> {
        self.packages
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownPackage(name.to_string()))
    }

    /// The node (package, task) would have, or `None` when the task does not
    /// exist in that package
    fn resolve(&self, package: &PackageInfo, task: &str) -> Result<Option<TaskNode>, GraphError> {
        let definition = match self.pipeline.definition(&package.name, task) {
            Some(def) => def,
            None if package.has_script(task) => TaskDefinition::new(task),
            None => return Ok(None),
        };

        let kind = if definition.is_group() {
            TaskKind::Group
        } else {
            match package.script(task) {
                Some(command) => TaskKind::Script {
                    command: command.to_string(),
                },
                // A package-level script definition must match a script.
                None if self.pipeline.is_overridden(&package.name, task) => {
                    return Err(GraphError::MissingScript {
                        package: package.name.clone(),
                        task: task.to_string(),
                    });
                }
                None => return Ok(None),
            }
        };

        if let TaskKind::Script { command } = &kind {
            if invokes_orchestrator(command) {
                return Err(GraphError::RecursiveInvocation {
                    package: package.name.clone(),
                    task: task.to_string(),
                    command: command.clone(),
                });
            }
        }

        Ok(Some(TaskNode {
            id: TaskId::new(&package.name, task),
            kind,
            definition,
            package_dir: package.path.clone(),
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            priority: 0,
            level: 0,
        }))
    }

    /// Whether `task` names something in `package`, even if it does not
    /// produce a node there
    fn is_known(&self, package: &PackageInfo, task: &str) -> bool {
        self.pipeline.has_definition(&package.name, task) || package.has_script(task)
    }

    fn unresolved(&self, from: &TaskId, reference: &TaskRef) -> GraphError {
        GraphError::UnresolvedReference {
            package: from.package.clone(),
            task: from.task.clone(),
            reference: reference.to_string(),
        }
    }

    /// Targets of a hard dependency reference
    fn dependency_targets(
        &self,
        from: &TaskId,
        reference: &TaskRef,
    ) -> Result<Vec<(&'a PackageInfo, String)>, GraphError> {
        let package = self.package(&from.package)?;
        let exempt = package.release_group_root;

        match reference {
            TaskRef::Wildcard => Err(GraphError::WildcardDependency {
                package: from.package.clone(),
                task: from.task.clone(),
            }),
            TaskRef::Local(task) => {
                if !exempt && !self.is_known(package, task) {
                    return Err(self.unresolved(from, reference));
                }
                Ok(vec![(package, task.clone())])
            }
            TaskRef::Upstream(task) => self
                .package_graph
                .dependencies(&package.name)
                .into_iter()
                .map(|dep| Ok((self.package(dep)?, task.clone())))
                .collect(),
            TaskRef::Scoped {
                package: target,
                task,
            } => match self.packages.get(target.as_str()) {
                Some(target_pkg) => {
                    if !exempt && !self.is_known(target_pkg, task) {
                        return Err(self.unresolved(from, reference));
                    }
                    Ok(vec![(*target_pkg, task.clone())])
                }
                None if exempt => Ok(Vec::new()),
                None => Err(self.unresolved(from, reference)),
            },
        }
    }

    /// Check every reference of `node` whether or not it is scheduled.
    ///
    /// A bare or pinned dependency must produce a node; only `^` expansion
    /// and the children of a group may skip packages without the task.
    fn check_references(&self, node: &TaskNode) -> Result<(), GraphError> {
        let exempt = self.package(&node.id.package)?.release_group_root;

        for raw in &node.definition.depends_on {
            let reference = TaskRef::parse(raw)?;
            let must_resolve = !exempt
                && !node.is_group()
                && matches!(reference, TaskRef::Local(_) | TaskRef::Scoped { .. });

            for (package, task) in self.dependency_targets(&node.id, &reference)? {
                if self.resolve(package, &task)?.is_none() && must_resolve {
                    return Err(GraphError::MissingScript {
                        package: package.name.clone(),
                        task,
                    });
                }
            }
        }

        let scheduled = BTreeMap::new();
        for raw in node.definition.before.iter().chain(&node.definition.after) {
            self.hint_targets(&node.id, &TaskRef::parse(raw)?, &scheduled)?;
        }
        Ok(())
    }

    /// Nodes an ordering hint refers to; hints never add nodes
    fn hint_targets(
        &self,
        from: &TaskId,
        reference: &TaskRef,
        nodes: &BTreeMap<TaskId, TaskNode>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let package = self.package(&from.package)?;
        let exempt = package.release_group_root;

        let candidates: Vec<TaskId> = match reference {
            TaskRef::Wildcard => return Ok(Vec::new()),
            TaskRef::Local(task) => {
                if !exempt && !self.is_known(package, task) {
                    return Err(self.unresolved(from, reference));
                }
                vec![TaskId::new(&package.name, task)]
            }
            TaskRef::Upstream(task) => self
                .package_graph
                .dependencies(&package.name)
                .into_iter()
                .map(|dep| TaskId::new(dep, task))
                .collect(),
            TaskRef::Scoped {
                package: target,
                task,
            } => {
                let known = self
                    .packages
                    .get(target.as_str())
                    .is_some_and(|p| self.is_known(p, task));
                if !exempt && !known {
                    return Err(self.unresolved(from, reference));
                }
                vec![TaskId::new(target, task)]
            }
        };

        Ok(candidates
            .into_iter()
            .filter(|id| id != from && nodes.contains_key(id))
            .collect())
    }
}

impl TaskGraph {
    /// Build a task graph.
    ///
    /// Every requested task is instantiated in every selected package that
    /// has it (all packages when `selected` is `None`); hard dependencies are
    /// then expanded transitively, pulling in tasks of packages outside the
    /// selection where needed. For example, if `build` depends on `^build`
    /// and `app` depends on `core`:
    ///   app#build -> core#build
    #[instrument(skip_all, fields(packages = packages.len(), targets = targets.len()))]
    pub fn build(
        pipeline: &Pipeline,
        packages: &[PackageInfo],
        package_graph: &PackageGraph,
        targets: &[String],
        selected: Option<&BTreeSet<String>>,
    ) -> Result<Self, GraphError> {
        pipeline.validate()?;

        let builder = Builder {
            pipeline,
            packages: packages.iter().map(|p| (p.name.as_str(), p)).collect(),
            package_graph,
        };

        if let Some(selected) = selected {
            for name in selected {
                builder.package(name)?;
            }
        }

        for package in packages {
            for task in pipeline.task_names(&package.name) {
                if let Some(node) = builder.resolve(package, task)? {
                    builder.check_references(&node)?;
                }
            }
        }

        let mut nodes: BTreeMap<TaskId, TaskNode> = BTreeMap::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();

        for target in targets {
            let target_ref = TaskRef::parse(target)?;

            let wanted: Vec<(&PackageInfo, String)> = match &target_ref {
                TaskRef::Local(task) => packages
                    .iter()
                    .filter(|p| selected.map_or(true, |s| s.contains(&p.name)))
                    .map(|p| (p, task.clone()))
                    .collect(),
                TaskRef::Scoped { package, task } => vec![(builder.package(package)?, task.clone())],
                _ => {
                    return Err(GraphError::InvalidReference {
                        reference: target.clone(),
                        reason: "run targets must be 'task' or 'package#task'".to_string(),
                    })
                }
            };

            for (package, task) in wanted {
                if let Some(node) = builder.resolve(package, &task)? {
                    if !nodes.contains_key(&node.id) {
                        queue.push_back(node.id.clone());
                        nodes.insert(node.id.clone(), node);
                    }
                }
            }

            let task_name = match &target_ref {
                TaskRef::Local(task) | TaskRef::Scoped { task, .. } => task.as_str(),
                _ => target.as_str(),
            };
            let defined_anywhere = pipeline.global(task_name).is_some()
                || packages.iter().any(|p| builder.is_known(p, task_name));
            if !defined_anywhere {
                return Err(GraphError::UnknownTask(target.clone()));
            }
        }

        // Expand hard dependencies
        while let Some(id) = queue.pop_front() {
            let references = nodes
                .get(&id)
                .map(|n| n.definition.depends_on.clone())
                .unwrap_or_default();

            let mut deps = BTreeSet::new();
            for raw in &references {
                let reference = TaskRef::parse(raw)?;
                for (package, task) in builder.dependency_targets(&id, &reference)? {
                    let dep_id = TaskId::new(&package.name, &task);
                    if nodes.contains_key(&dep_id) {
                        deps.insert(dep_id);
                        continue;
                    }
                    // References were checked up front; `None` is a skipped upstream
                    // or group child.
                    if let Some(node) = builder.resolve(package, &task)? {
                        debug!(from = %id, to = %dep_id, "expanded dependency");
                        queue.push_back(dep_id.clone());
                        nodes.insert(dep_id.clone(), node);
                        deps.insert(dep_id);
                    }
                }
            }

            if let Some(node) = nodes.get_mut(&id) {
                if node.is_group() {
                    node.definition.children = deps.iter().cloned().collect();
                }
                node.dependencies = deps;
            }
        }

        // Build reverse dependency map (dependents)
        let edges: Vec<(TaskId, TaskId)> = nodes
            .values()
            .flat_map(|n| n.dependencies.iter().map(|d| (d.clone(), n.id.clone())))
            .collect();
        for (dep, dependent) in edges {
            if let Some(node) = nodes.get_mut(&dep) {
                node.dependents.insert(dependent);
            }
        }

        detect_cycle(&nodes)?;
        let sorted_order = topological_sort(&nodes);
        let levels = compute_levels(&mut nodes, &sorted_order);
        assign_priorities(&builder, &mut nodes)?;

        info!(
            task_count = nodes.len(),
            level_count = levels.len(),
            "task graph built"
        );

        Ok(Self {
            nodes,
            sorted_order,
            levels,
        })
    }

    /// Get all task nodes
    pub fn nodes(&self) -> &BTreeMap<TaskId, TaskNode> {
        &self.nodes
    }

    /// Get a specific task node
    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Nodes grouped by level (level 0 has no dependencies)
    pub fn levels(&self) -> &[Vec<TaskId>] {
        &self.levels
    }

    /// Get the total number of tasks
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get topologically sorted order
    pub fn sorted(&self) -> &[TaskId] {
        &self.sorted_order
    }

    /// Get a human-readable summary of the execution plan
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for (i, level) in self.levels.iter().enumerate() {
            plan.push_str(&format!("Level {} ({} tasks):\n", i, level.len()));
            for id in level {
                if let Some(node) = self.nodes.get(id) {
                    let cmd = node.command().unwrap_or("<group>");
                    let deps: Vec<String> =
                        node.dependencies.iter().map(|d| d.to_string()).collect();
                    if deps.is_empty() {
                        plan.push_str(&format!("  {} -> {}\n", id, cmd));
                    } else {
                        plan.push_str(&format!(
                            "  {} -> {} (after: {})\n",
                            id,
                            cmd,
                            deps.join(", ")
                        ));
                    }
                }
            }
        }
        plan
    }
}

/// Whether a shell command runs the orchestrator in any of its segments
pub fn invokes_orchestrator(command: &str) -> bool {
    command
        .split(['&', '|', ';'])
        .filter_map(|segment| {
            segment
                .split_whitespace()
                .find(|token| !is_env_assignment(token))
        })
        .any(|program| {
            let program = program.trim_matches(|c| c == '"' || c == '\'');
            let name = program.rsplit(['/', '\\']).next().unwrap_or(program);
            let name = name.strip_suffix(".exe").unwrap_or(name);
            name == ORCHESTRATOR_BIN
        })
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Three-color depth-first search; a back edge is a cycle
fn detect_cycle(nodes: &BTreeMap<TaskId, TaskNode>) -> Result<(), GraphError> {
    fn visit<'n>(
        id: &'n TaskId,
        nodes: &'n BTreeMap<TaskId, TaskNode>,
        marks: &mut BTreeMap<&'n TaskId, Mark>,
        stack: &mut Vec<&'n TaskId>,
    ) -> Result<(), GraphError> {
        marks.insert(id, Mark::Gray);
        stack.push(id);

        if let Some(node) = nodes.get(id) {
            for dep in &node.dependencies {
                match marks.get(dep).copied().unwrap_or(Mark::White) {
                    Mark::White => visit(dep, nodes, marks, stack)?,
                    Mark::Gray => {
                        let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.to_string());
                        return Err(GraphError::Cycle(cycle));
                    }
                    Mark::Black => {}
                }
            }
        }

        stack.pop();
        marks.insert(id, Mark::Black);
        Ok(())
    }

    let mut marks: BTreeMap<&TaskId, Mark> = BTreeMap::new();
    let mut stack = Vec::new();
    for id in nodes.keys() {
        if marks.get(id).copied().unwrap_or(Mark::White) == Mark::White {
            visit(id, nodes, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

/// Topological sort using Kahn's algorithm; the graph is known to be acyclic
fn topological_sort(nodes: &BTreeMap<TaskId, TaskNode>) -> Vec<TaskId> {
    let mut in_degree: BTreeMap<&TaskId, usize> = BTreeMap::new();
    let mut queue: VecDeque<&TaskId> = VecDeque::new();
    let mut sorted = Vec::with_capacity(nodes.len());

    for (id, node) in nodes {
        in_degree.insert(id, node.dependencies.len());
        if node.dependencies.is_empty() {
            queue.push_back(id);
        }
    }

    while let Some(id) = queue.pop_front() {
        sorted.push(id.clone());
        if let Some(node) = nodes.get(id) {
            for dependent in &node.dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
    }

    sorted
}

fn compute_levels(nodes: &mut BTreeMap<TaskId, TaskNode>, sorted: &[TaskId]) -> Vec<Vec<TaskId>> {
    let mut levels: Vec<Vec<TaskId>> = Vec::new();

    for id in sorted {
        let level = nodes
            .get(id)
            .map(|node| {
                node.dependencies
                    .iter()
                    .filter_map(|dep| nodes.get(dep))
                    .map(|dep| dep.level + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        if let Some(node) = nodes.get_mut(id) {
            node.level = level;
        }
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(id.clone());
    }

    levels
}

/// Turn before/after hints into dispatch priorities.
///
/// `before: ["*"]` puts a node in the first bucket and `after: ["*"]` in the
/// last; within a bucket nodes are ranked by their depth in the hint graph.
/// Hint cycles are tolerated: nodes on them share the last rank.
fn assign_priorities(
    builder: &Builder<'_>,
    nodes: &mut BTreeMap<TaskId, TaskNode>,
) -> Result<(), GraphError> {
    let mut hint_edges: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
    let mut buckets: BTreeMap<TaskId, usize> = BTreeMap::new();

    for (id, node) in nodes.iter() {
        let mut bucket = 1;
        for raw in &node.definition.before {
            let reference = TaskRef::parse(raw)?;
            if reference == TaskRef::Wildcard {
                bucket = 0;
            }
            for target in builder.hint_targets(id, &reference, nodes)? {
                hint_edges.entry(id.clone()).or_default().insert(target);
            }
        }
        for raw in &node.definition.after {
            let reference = TaskRef::parse(raw)?;
            if reference == TaskRef::Wildcard {
                bucket = 2;
            }
            for target in builder.hint_targets(id, &reference, nodes)? {
                hint_edges.entry(target).or_default().insert(id.clone());
            }
        }
        buckets.insert(id.clone(), bucket);
    }

    // Rank = longest hint chain leading to the node
    let mut in_degree: BTreeMap<&TaskId, usize> = nodes.keys().map(|id| (id, 0)).collect();
    for targets in hint_edges.values() {
        for target in targets {
            if let Some(d) = in_degree.get_mut(target) {
                *d += 1;
            }
        }
    }

    let mut rank: BTreeMap<&TaskId, usize> = BTreeMap::new();
    let mut queue: VecDeque<&TaskId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    while let Some(id) = queue.pop_front() {
        let current = rank.get(id).copied().unwrap_or(0);
        rank.entry(id).or_insert(current);
        if let Some(targets) = hint_edges.get(id) {
            for target in targets {
                let r = rank.entry(target).or_insert(0);
                *r = (*r).max(current + 1);
                if let Some(d) = in_degree.get_mut(target) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }
    }

    let span = nodes.len() + 1;
    let max_rank = rank.values().copied().max().unwrap_or(0);
    let priorities: Vec<(TaskId, usize)> = nodes
        .keys()
        .map(|id| {
            let settled = in_degree.get(id).copied().unwrap_or(0) == 0;
            let r = if settled {
                rank.get(id).copied().unwrap_or(0)
            } else {
                max_rank + 1
            };
            let bucket = buckets.get(id).copied().unwrap_or(1);
            (id.clone(), bucket * span + r)
        })
        .collect();

    for (id, priority) in priorities {
        if let Some(node) = nodes.get_mut(&id) {
            node.priority = priority;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packages() -> Vec<PackageInfo> {
        vec![
            PackageInfo::new("core", "/repo/core")
                .with_script("build", "tsc")
                .with_script("lint", "eslint .")
                .with_script("test", "jest"),
            PackageInfo::new("utils", "/repo/utils")
                .with_script("build", "tsc")
                .with_script("test", "jest")
                .with_dependency("core"),
            PackageInfo::new("app", "/repo/app")
                .with_script("build", "vite build")
                .with_script("lint", "eslint .")
                .with_dependency("core")
                .with_dependency("utils"),
        ]
    }

    fn pipeline() -> Pipeline {
        Pipeline::new()
            .with_task(TaskDefinition::new("build").with_depends_on("^build"))
            .with_task(TaskDefinition::new("test").with_depends_on("build"))
            .with_task(TaskDefinition::new("lint").with_before("*"))
    }

    fn build(pipeline: &Pipeline, packages: &[PackageInfo], targets: &[&str]) -> Result<TaskGraph, GraphError> {
        let graph = PackageGraph::build(packages).unwrap();
        let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        TaskGraph::build(pipeline, packages, &graph, &targets, None)
    }

    fn id(s: &str) -> TaskId {
        TaskId::parse(s).unwrap()
    }

    #[test]
    fn test_build_graph() {
        let graph = build(&pipeline(), &packages(), &["build"]).unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.sorted()[0], id("core#build"));
        assert_eq!(
            graph.get(&id("app#build")).unwrap().dependencies,
            [id("core#build"), id("utils#build")].into_iter().collect()
        );
    }

    #[test]
    fn test_graph_levels() {
        let graph = build(&pipeline(), &packages(), &["build"]).unwrap();

        assert_eq!(graph.get(&id("core#build")).unwrap().level, 0);
        assert_eq!(graph.get(&id("utils#build")).unwrap().level, 1);
        assert_eq!(graph.get(&id("app#build")).unwrap().level, 2);
        assert_eq!(graph.levels().len(), 3);
    }

    #[test]
    fn test_local_dependency_expansion() {
        let graph = build(&pipeline(), &packages(), &["test"]).unwrap();

        // test -> build -> ^build pulls in every build below the testers
        assert!(graph.get(&id("core#test")).is_some());
        assert!(graph.get(&id("utils#test")).is_some());
        assert!(graph.get(&id("app#test")).is_none());
        assert!(graph
            .get(&id("utils#test"))
            .unwrap()
            .dependencies
            .contains(&id("utils#build")));
        assert!(graph.get(&id("core#build")).is_some());
    }

    #[test]
    fn test_selected_packages_pull_in_upstream() {
        let pkgs = packages();
        let package_graph = PackageGraph::build(&pkgs).unwrap();
        let selected: BTreeSet<String> = ["app".to_string()].into_iter().collect();

        let graph = TaskGraph::build(
            &pipeline(),
            &pkgs,
            &package_graph,
            &["build".to_string()],
            Some(&selected),
        )
        .unwrap();

        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_upstream_without_task_is_skipped() {
        let pkgs = vec![
            PackageInfo::new("types", "/repo/types"),
            PackageInfo::new("app", "/repo/app")
                .with_script("build", "tsc")
                .with_dependency("types"),
        ];
        let graph = build(&pipeline(), &pkgs, &["build"]).unwrap();

        assert_eq!(graph.len(), 1);
        assert!(graph.get(&id("app#build")).unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_unresolved_reference() {
        let pipeline = Pipeline::new().with_task(TaskDefinition::new("build").with_depends_on("codegen"));
        let err = build(&pipeline, &packages(), &["build"]).unwrap_err();

        match err {
            GraphError::UnresolvedReference { reference, .. } => assert_eq!(reference, "codegen"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_release_group_root_is_exempt() {
        let pkgs = vec![PackageInfo::new("root", "/repo")
            .with_script("build", "make")
            .as_release_group_root()];
        let pipeline = Pipeline::new().with_task(
            TaskDefinition::new("build")
                .with_depends_on("codegen")
                .with_depends_on("missing#build"),
        );

        let graph = build(&pipeline, &pkgs, &["build"]).unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_scoped_dependency() {
        let pipeline = pipeline().with_override(
            "app",
            TaskDefinition::new("lint").with_depends_on("core#build"),
        );
        let pkgs = packages();
        let package_graph = PackageGraph::build(&pkgs).unwrap();

        let graph = TaskGraph::build(
            &pipeline,
            &pkgs,
            &package_graph,
            &["app#lint".to_string()],
            None,
        )
        .unwrap();

        assert_eq!(graph.len(), 2);
        assert!(graph
            .get(&id("app#lint"))
            .unwrap()
            .dependencies
            .contains(&id("core#build")));
    }

    #[test]
    fn test_pinned_dependency_without_script() {
        // core has no lint script, so the global lint definition skips it.
        let pkgs = vec![
            PackageInfo::new("core", "/repo/core").with_script("build", "tsc"),
            PackageInfo::new("app", "/repo/app")
                .with_script("lint", "eslint .")
                .with_dependency("core"),
        ];
        let pipeline = Pipeline::new()
            .with_task(TaskDefinition::new("lint"))
            .with_override("app", TaskDefinition::new("lint").with_depends_on("core#lint"));

        let err = build(&pipeline, &pkgs, &["app#lint"]).unwrap_err();

        match err {
            GraphError::MissingScript { package, task } => {
                assert_eq!(package, "core");
                assert_eq!(task, "lint");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_local_dependency_without_script() {
        let pkgs = vec![PackageInfo::new("app", "/repo/app").with_script("build", "tsc")];
        let pipeline = Pipeline::new()
            .with_task(TaskDefinition::new("codegen"))
            .with_task(TaskDefinition::new("build").with_depends_on("codegen"));

        let err = build(&pipeline, &pkgs, &["build"]).unwrap_err();
        assert!(matches!(err, GraphError::MissingScript { .. }));
    }

    #[test]
    fn test_unscheduled_task_references_are_checked() {
        let pipeline = pipeline().with_task(TaskDefinition::new("test").with_depends_on("biuld"));
        let err = build(&pipeline, &packages(), &["build"]).unwrap_err();

        match err {
            GraphError::UnresolvedReference { task, reference, .. } => {
                assert_eq!(task, "test");
                assert_eq!(reference, "biuld");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_group_children_skip_packages_without_task() {
        let pipeline = pipeline().with_task(TaskDefinition::group("ci").with_depends_on("lint"));
        let graph = build(&pipeline, &packages(), &["ci"]).unwrap();

        assert_eq!(
            graph.get(&id("utils#ci")).unwrap().definition.children,
            Vec::<TaskId>::new()
        );
        assert_eq!(
            graph.get(&id("app#ci")).unwrap().definition.children,
            vec![id("app#lint")]
        );
    }

    #[test]
    fn test_missing_script_for_override() {
        let pipeline = pipeline().with_override("utils", TaskDefinition::new("lint"));
        let err = build(&pipeline, &packages(), &["lint"]).unwrap_err();

        assert!(matches!(err, GraphError::MissingScript { .. }));
    }

    #[test]
    fn test_recursive_invocation_rejected() {
        let pkgs = vec![PackageInfo::new("app", "/repo/app").with_script("build", "tsc && rivet run test")];
        let err = build(&pipeline(), &pkgs, &["build"]).unwrap_err();

        assert!(matches!(err, GraphError::RecursiveInvocation { .. }));
    }

    #[test]
    fn test_invokes_orchestrator() {
        assert!(invokes_orchestrator("rivet run build"));
        assert!(invokes_orchestrator("CI=1 rivet run build"));
        assert!(invokes_orchestrator("tsc; ./node_modules/.bin/rivet build"));
        assert!(invokes_orchestrator("echo hi | rivet.exe build"));
        assert!(!invokes_orchestrator("tsc -b"));
        assert!(!invokes_orchestrator("echo rivet"));
        assert!(!invokes_orchestrator("rivet-lint ."));
    }

    #[test]
    fn test_group_task() {
        let pipeline = pipeline().with_task(
            TaskDefinition::group("ci")
                .with_depends_on("build")
                .with_depends_on("lint"),
        );
        let graph = build(&pipeline, &packages(), &["ci"]).unwrap();

        let ci = graph.get(&id("core#ci")).unwrap();
        assert!(ci.is_group());
        assert_eq!(ci.definition.children, vec![id("core#build"), id("core#lint")]);
    }

    #[test]
    fn test_group_task_with_before_rejected() {
        let pipeline = pipeline().with_task(TaskDefinition::group("ci").with_before("lint"));
        let err = build(&pipeline, &packages(), &["build"]).unwrap_err();

        assert!(matches!(err, GraphError::GroupTaskOrdering { .. }));
    }

    #[test]
    fn test_wildcard_dependency_rejected() {
        let pipeline = Pipeline::new().with_task(TaskDefinition::new("build").with_depends_on("*"));
        let err = build(&pipeline, &packages(), &["build"]).unwrap_err();

        assert!(matches!(err, GraphError::WildcardDependency { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let pipeline = Pipeline::new()
            .with_task(TaskDefinition::new("build").with_depends_on("test"))
            .with_task(TaskDefinition::new("test").with_depends_on("build"));
        let err = build(&pipeline, &packages(), &["build"]).unwrap_err();

        match err {
            GraphError::Cycle(members) => {
                assert_eq!(members.first(), members.last());
                assert!(members.contains(&"core#build".to_string()));
                assert!(members.contains(&"core#test".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_task() {
        let err = build(&pipeline(), &packages(), &["deploy"]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownTask(_)));
    }

    #[test]
    fn test_before_wildcard_priority() {
        let graph = build(&pipeline(), &packages(), &["build", "lint"]).unwrap();

        let lint = graph.get(&id("core#lint")).unwrap().priority;
        let build = graph.get(&id("core#build")).unwrap().priority;
        assert!(lint < build);
    }

    #[test]
    fn test_after_hint_priority() {
        let pipeline = pipeline().with_override(
            "core",
            TaskDefinition::new("test")
                .with_depends_on(crate::task::INHERIT_MARKER)
                .with_after("lint"),
        );
        let graph = build(&pipeline, &packages(), &["test", "lint"]).unwrap();

        let test = graph.get(&id("core#test")).unwrap();
        assert_eq!(test.definition.depends_on, vec!["build"]);
        assert!(graph.get(&id("core#lint")).unwrap().priority < test.priority);
    }

    #[test]
    fn test_execution_plan() {
        let graph = build(&pipeline(), &packages(), &["build"]).unwrap();
        let plan = graph.execution_plan();

        assert!(plan.contains("Level 0 (1 tasks):"));
        assert!(plan.contains("core#build -> tsc"));
        assert!(plan.contains("app#build -> vite build (after: core#build, utils#build)"));
    }
}
