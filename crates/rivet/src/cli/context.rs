//! Workspace loading shared by commands

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use rivet_cache::{CacheOptions, GlobalCacheKeyComponents, SharedCache};
use rivet_core::config::load_config_or_default;
use rivet_core::{Config, ConfigPackageSource, PackageGraph, PackageInfo, PackageSource};
use rivet_tasks::{GraphError, Pipeline, TaskGraph};

/// Suffix on a `--filter` entry that also selects dependent packages
const WITH_DEPENDENTS: &str = "...";

/// Configuration and package inventory of the current workspace
pub struct WorkspaceContext {
    /// Directory holding the config file, or the working directory
    pub root: PathBuf,
    pub config: Config,
    pub packages: Vec<PackageInfo>,
    pub package_graph: PackageGraph,
    pub pipeline: Pipeline,
}

impl WorkspaceContext {
    /// Load the workspace containing `cwd`
    pub fn load(cwd: &Path) -> anyhow::Result<Self> {
        let (config, config_path) =
            load_config_or_default(cwd).context("Failed to load configuration")?;
        let root = config_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf());
        debug!(root = %root.display(), config = ?config_path, "workspace loaded");

        let packages = ConfigPackageSource::new(&config, &root).packages()?;
        let package_graph = PackageGraph::build(&packages)?;
        package_graph.validate()?;
        let pipeline = Pipeline::from_config(&config);

        Ok(Self {
            root,
            config,
            packages,
            package_graph,
            pipeline,
        })
    }

    /// Packages selected by `--filter` entries; `None` selects everything.
    ///
    /// `name` selects one package, `name...` the package and everything that
    /// depends on it.
    pub fn select(&self, filters: &[String]) -> anyhow::Result<Option<BTreeSet<String>>> {
        if filters.is_empty() {
            return Ok(None);
        }

        let mut selected = BTreeSet::new();
        for filter in filters {
            match filter.strip_suffix(WITH_DEPENDENTS) {
                Some(name) => selected.extend(self.package_graph.affected(name)?),
                None => {
                    if !self.package_graph.contains(filter) {
                        anyhow::bail!("Unknown package '{}' in --filter", filter);
                    }
                    selected.insert(filter.clone());
                }
            }
        }
        Ok(Some(selected))
    }

    /// Build the task graph for `targets`
    pub fn task_graph(
        &self,
        targets: &[String],
        selected: Option<&BTreeSet<String>>,
    ) -> Result<TaskGraph, GraphError> {
        TaskGraph::build(
            &self.pipeline,
            &self.packages,
            &self.package_graph,
            targets,
            selected,
        )
    }

    /// Cache directory from the config, resolved against the root
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(&self.config.cache.dir)
    }

    /// Handle to the configured cache
    pub fn cache(&self) -> SharedCache {
        let settings = &self.config.cache;
        SharedCache::new(
            self.cache_dir(),
            CacheOptions {
                skip_write: settings.skip_write,
                verify_integrity: settings.verify_integrity,
                overwrite: settings.overwrite,
            },
        )
    }

    /// Build environment folded into every cache key
    pub fn global_components(&self) -> GlobalCacheKeyComponents {
        let settings = &self.config.cache;
        let lockfile = settings.lockfile.as_ref().map(|path| self.root.join(path));
        GlobalCacheKeyComponents::detect(
            settings
                .runtime_version
                .as_deref()
                .unwrap_or(env!("CARGO_PKG_VERSION")),
            lockfile.as_deref(),
            settings.env_mode.as_deref(),
            &settings.cache_bust_env,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[tasks.pipeline.build]
depends_on = ["^build"]
outputs = ["dist"]

[cache]
dir = ".cache/rivet"
runtime_version = "node-20"

[[packages]]
name = "core"
path = "packages/core"
scripts = { build = "tsc" }

[[packages]]
name = "app"
path = "packages/app"
scripts = { build = "vite build" }
dependencies = ["core"]

[[packages]]
name = "docs"
path = "packages/docs"
scripts = { build = "mkdocs build" }
"#;

    fn workspace() -> (TempDir, WorkspaceContext) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("rivet.toml"), CONFIG).unwrap();
        let nested = temp.path().join("packages/app");
        fs::create_dir_all(&nested).unwrap();

        let context = WorkspaceContext::load(&nested).unwrap();
        (temp, context)
    }

    #[test]
    fn test_load_finds_root() {
        let (temp, context) = workspace();
        assert_eq!(context.root, temp.path());
        assert_eq!(context.packages.len(), 3);
        assert_eq!(context.cache_dir(), temp.path().join(".cache/rivet"));
        assert_eq!(context.global_components().runtime_version, "node-20");
    }

    #[test]
    fn test_select() {
        let (_temp, context) = workspace();

        assert_eq!(context.select(&[]).unwrap(), None);

        let single = context.select(&["core".to_string()]).unwrap().unwrap();
        assert_eq!(single.into_iter().collect::<Vec<_>>(), vec!["core"]);

        let with_dependents = context.select(&["core...".to_string()]).unwrap().unwrap();
        assert_eq!(
            with_dependents.into_iter().collect::<Vec<_>>(),
            vec!["app", "core"]
        );

        assert!(context.select(&["missing".to_string()]).is_err());
    }

    #[test]
    fn test_task_graph() {
        let (_temp, context) = workspace();
        let selected = context.select(&["app".to_string()]).unwrap();

        let graph = context
            .task_graph(&["build".to_string()], selected.as_ref())
            .unwrap();

        // app#build pulls in core#build but not docs#build
        assert_eq!(graph.len(), 2);
    }
}
