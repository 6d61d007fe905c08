//! Dependency graph for workspace packages

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::error::{Result, WorkspaceError};

use super::package::PackageInfo;

/// A node in the package graph
#[derive(Debug, Clone)]
pub struct PackageNode {
    /// Package name
    pub name: String,
    /// Workspace packages this package depends on
    pub dependencies: BTreeSet<String>,
    /// Workspace packages that depend on this package
    pub dependents: BTreeSet<String>,
}

/// Dependency graph for workspace packages.
///
/// Dependencies on names outside the workspace (registry packages) are
/// dropped when the graph is built.
#[derive(Debug, Clone)]
pub struct PackageGraph {
    nodes: BTreeMap<String, PackageNode>,
    /// Topologically sorted order (dependencies before dependents)
    sorted_order: Vec<String>,
    cycles: Vec<Vec<String>>,
}

impl PackageGraph {
    /// Build a package graph
    pub fn build(packages: &[PackageInfo]) -> Result<Self> {
        let mut nodes: BTreeMap<String, PackageNode> = BTreeMap::new();

        for pkg in packages {
            let node = PackageNode {
                name: pkg.name.clone(),
                dependencies: BTreeSet::new(),
                dependents: BTreeSet::new(),
            };
            if nodes.insert(pkg.name.clone(), node).is_some() {
                return Err(WorkspaceError::DuplicatePackage(pkg.name.clone()).into());
            }
        }

        for pkg in packages {
            for dep in &pkg.dependencies {
                if dep == &pkg.name || !nodes.contains_key(dep) {
                    continue;
                }
                if let Some(node) = nodes.get_mut(&pkg.name) {
                    node.dependencies.insert(dep.clone());
                }
                if let Some(dep_node) = nodes.get_mut(dep) {
                    dep_node.dependents.insert(pkg.name.clone());
                }
            }
        }

        let (sorted_order, cycles) = Self::topological_sort(&nodes);

        Ok(Self {
            nodes,
            sorted_order,
            cycles,
        })
    }

    /// Perform topological sort using Kahn's algorithm
    fn topological_sort(nodes: &BTreeMap<String, PackageNode>) -> (Vec<String>, Vec<Vec<String>>) {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut sorted: Vec<String> = Vec::new();

        for (name, node) in nodes {
            in_degree.insert(name, node.dependencies.len());
            if node.dependencies.is_empty() {
                queue.push_back(name);
            }
        }

        while let Some(name) = queue.pop_front() {
            sorted.push(name.to_string());

            if let Some(node) = nodes.get(name) {
                for dependent in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        let mut cycles = Vec::new();
        if sorted.len() != nodes.len() {
            let in_sorted: HashSet<&str> = sorted.iter().map(String::as_str).collect();
            let cyclic_nodes: Vec<&str> = nodes
                .keys()
                .map(String::as_str)
                .filter(|n| !in_sorted.contains(n))
                .collect();

            for start in &cyclic_nodes {
                if let Some(cycle) = Self::find_cycle(nodes, start, &cyclic_nodes) {
                    if !cycles.iter().any(|c: &Vec<String>| {
                        c.len() == cycle.len() && cycle.iter().all(|n| c.contains(n))
                    }) {
                        cycles.push(cycle);
                    }
                }
            }
        }

        (sorted, cycles)
    }

    /// Find a cycle starting from a given node
    fn find_cycle(
        nodes: &BTreeMap<String, PackageNode>,
        start: &str,
        cyclic_nodes: &[&str],
    ) -> Option<Vec<String>> {
        fn dfs(
            nodes: &BTreeMap<String, PackageNode>,
            current: &str,
            start: &str,
            visited: &mut HashSet<String>,
            path: &mut Vec<String>,
            cyclic_nodes: &[&str],
        ) -> bool {
            if visited.contains(current) {
                return current == start && path.len() > 1;
            }

            if !cyclic_nodes.contains(&current) {
                return false;
            }

            visited.insert(current.to_string());
            path.push(current.to_string());

            if let Some(node) = nodes.get(current) {
                for dep in &node.dependencies {
                    if dfs(nodes, dep, start, visited, path, cyclic_nodes) {
                        return true;
                    }
                }
            }

            path.pop();
            false
        }

        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if dfs(nodes, start, start, &mut visited, &mut path, cyclic_nodes) {
            Some(path)
        } else {
            None
        }
    }

    /// Packages in topological order (dependencies first)
    pub fn sorted(&self) -> &[String] {
        &self.sorted_order
    }

    /// Check if there are any circular dependencies
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    /// Get a package node
    pub fn get(&self, name: &str) -> Option<&PackageNode> {
        self.nodes.get(name)
    }

    /// Whether the package exists
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Direct upstream dependencies of a package, in name order
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.nodes
            .get(name)
            .map(|n| n.dependencies.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// The package plus every package that transitively depends on it
    pub fn affected(&self, name: &str) -> Result<BTreeSet<String>> {
        if !self.nodes.contains_key(name) {
            return Err(WorkspaceError::UnknownPackage(name.to_string()).into());
        }

        let mut affected = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(name.to_string());

        while let Some(current) = queue.pop_front() {
            if !affected.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for dependent in &node.dependents {
                    if !affected.contains(dependent) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }

        Ok(affected)
    }

    /// Validate that the graph has no cycles
    pub fn validate(&self) -> Result<()> {
        if self.has_cycles() {
            let cycle_desc: Vec<String> = self.cycles.iter().map(|c| c.join(" -> ")).collect();
            return Err(WorkspaceError::CircularDependency(cycle_desc.join("; ")).into());
        }
        Ok(())
    }

    /// Number of packages
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no packages
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_packages() -> Vec<PackageInfo> {
        vec![
            PackageInfo::new("core", "/repo/core"),
            PackageInfo::new("utils", "/repo/utils").with_dependency("core"),
            PackageInfo::new("cli", "/repo/cli")
                .with_dependency("core")
                .with_dependency("utils")
                .with_dependency("left-pad"),
        ]
    }

    #[test]
    fn test_build_graph() {
        let graph = PackageGraph::build(&create_packages()).unwrap();

        assert!(!graph.has_cycles());
        assert_eq!(graph.sorted().len(), 3);
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_topological_order() {
        let graph = PackageGraph::build(&create_packages()).unwrap();

        assert_eq!(graph.sorted(), &["core", "utils", "cli"]);
    }

    #[test]
    fn test_external_dependencies_dropped() {
        let graph = PackageGraph::build(&create_packages()).unwrap();

        assert_eq!(graph.dependencies("cli"), vec!["core", "utils"]);
    }

    #[test]
    fn test_affected_packages() {
        let graph = PackageGraph::build(&create_packages()).unwrap();

        let affected = graph.affected("core").unwrap();
        assert_eq!(affected.len(), 3);

        let affected = graph.affected("cli").unwrap();
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), vec!["cli"]);

        assert!(graph.affected("missing").is_err());
    }

    #[test]
    fn test_duplicate_package() {
        let packages = vec![
            PackageInfo::new("core", "/a"),
            PackageInfo::new("core", "/b"),
        ];
        assert!(PackageGraph::build(&packages).is_err());
    }

    #[test]
    fn test_cycle_detection() {
        let packages = vec![
            PackageInfo::new("a", "/a").with_dependency("b"),
            PackageInfo::new("b", "/b").with_dependency("c"),
            PackageInfo::new("c", "/c").with_dependency("a"),
        ];

        let graph = PackageGraph::build(&packages).unwrap();
        assert!(graph.has_cycles());
        assert!(graph.validate().is_err());
    }
}
