//! Package inventory consumed by the task graph

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::error::Result;

/// A workspace package as seen by the task graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Package name
    pub name: String,
    /// Absolute path to the package directory
    pub path: PathBuf,
    /// Script name to command
    pub scripts: BTreeMap<String, String>,
    /// Upstream workspace packages
    pub dependencies: Vec<String>,
    /// Release-group roots aggregate other packages and skip reference validation
    pub release_group_root: bool,
}

impl PackageInfo {
    /// Create a package with no scripts and no dependencies
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            scripts: BTreeMap::new(),
            dependencies: Vec::new(),
            release_group_root: false,
        }
    }

    /// Add a script
    pub fn with_script(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.scripts.insert(name.into(), command.into());
        self
    }

    /// Add an upstream dependency
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Mark as a release-group root
    pub fn as_release_group_root(mut self) -> Self {
        self.release_group_root = true;
        self
    }

    /// Whether the package declares a script of this name
    pub fn has_script(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }

    /// Command of a script
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }
}

/// Source of the package inventory (script names and upstream dependencies)
pub trait PackageSource {
    /// Enumerate all workspace packages
    fn packages(&self) -> Result<Vec<PackageInfo>>;
}

/// Package source backed by the `[[packages]]` section of the config file
pub struct ConfigPackageSource<'a> {
    config: &'a Config,
    root: PathBuf,
}

impl<'a> ConfigPackageSource<'a> {
    /// Create a source resolving package paths against `root`
    pub fn new(config: &'a Config, root: &Path) -> Self {
        Self {
            config,
            root: root.to_path_buf(),
        }
    }
}

impl PackageSource for ConfigPackageSource<'_> {
    fn packages(&self) -> Result<Vec<PackageInfo>> {
        let packages: Vec<PackageInfo> = self
            .config
            .packages
            .iter()
            .map(|pkg| PackageInfo {
                name: pkg.name.clone(),
                path: self.root.join(&pkg.path),
                scripts: pkg.scripts.clone(),
                dependencies: pkg.dependencies.clone(),
                release_group_root: pkg.release_group_root,
            })
            .collect();

        debug!(count = packages.len(), "packages loaded from config");
        Ok(packages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageConfig;

    #[test]
    fn test_package_builder() {
        let pkg = PackageInfo::new("app", "/repo/app")
            .with_script("build", "tsc")
            .with_dependency("core");

        assert!(pkg.has_script("build"));
        assert!(!pkg.has_script("test"));
        assert_eq!(pkg.script("build"), Some("tsc"));
        assert_eq!(pkg.dependencies, vec!["core"]);
        assert!(!pkg.release_group_root);
    }

    #[test]
    fn test_config_package_source_resolves_paths() {
        let mut config = Config::default();
        config.packages.push(PackageConfig {
            name: "core".to_string(),
            path: "packages/core".into(),
            release_group_root: true,
            ..Default::default()
        });

        let source = ConfigPackageSource::new(&config, Path::new("/repo"));
        let packages = source.packages().unwrap();

        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].path, PathBuf::from("/repo/packages/core"));
        assert!(packages[0].release_group_root);
    }
}
