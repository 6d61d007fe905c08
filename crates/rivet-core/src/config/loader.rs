//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

use super::defaults::config_file_names;
use super::types::Config;
use super::validation::validate_config;

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<Config> {
    let format = if path
        .extension()
        .is_some_and(|e| e == "yaml" || e == "yml")
    {
        "YAML"
    } else {
        "TOML"
    };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: Config = if format == "TOML" {
        toml::from_str(&content).map_err(ConfigError::TomlError)?
    } else {
        serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?
    };

    validate_config(&config)?;
    debug!(path = %path.display(), "config loaded and validated");
    Ok(config)
}

/// Find configuration file in directory or parent directories.
///
/// The first match wins; within one directory TOML is preferred over YAML.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found config file");
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no config file found");
    None
}

/// Load configuration from directory (searching parent directories)
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let config = load_config(&config_path)?;
    Ok((config, config_path))
}

/// Load configuration or use defaults.
///
/// A config file that exists but fails to parse or validate is still an
/// error; only a missing file falls back to defaults.
pub fn load_config_or_default(dir: &Path) -> Result<(Config, Option<PathBuf>)> {
    match find_config(dir) {
        Some(path) => {
            let config = load_config(&path)?;
            Ok((config, Some(path)))
        }
        None => {
            warn!(dir = %dir.display(), "no config found, using defaults");
            Ok((Config::default(), None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("rivet.toml");
        std::fs::write(&config_path, "[tasks]\nconcurrency = 2").unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_prefers_toml_over_yaml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("rivet.toml");
        let yaml_path = temp.path().join("rivet.yaml");
        std::fs::write(&toml_path, "[tasks]\nconcurrency = 2").unwrap();
        std::fs::write(&yaml_path, "tasks:\n  concurrency: 3").unwrap();

        let found = find_config(temp.path()).unwrap();
        assert_eq!(found, toml_path);
    }

    #[test]
    fn test_find_config_in_parent_dir() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("rivet.toml");
        std::fs::write(&config_path, "[tasks]\nconcurrency = 2").unwrap();
        let nested = temp.path().join("packages").join("app");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config(&nested).unwrap();
        assert_eq!(found, config_path);
    }

    #[test]
    fn test_load_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("rivet.toml");
        std::fs::write(
            &config_path,
            r#"
[tasks]
concurrency = 3

[tasks.pipeline.build]
depends_on = ["^build", "compile"]
outputs = ["dist/index.js"]

[tasks.pipeline.compile]
cpu_heavy = true

[cache]
verify_integrity = true
max_size_mb = 512

[[packages]]
name = "core"
path = "packages/core"
scripts = { compile = "tsc", build = "node bundle.js" }

[[packages]]
name = "app"
path = "packages/app"
dependencies = ["core"]
"#,
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.tasks.concurrency, 3);
        assert_eq!(
            config.tasks.pipeline["build"].depends_on,
            vec!["^build", "compile"]
        );
        assert!(config.tasks.pipeline["build"].script);
        assert!(config.tasks.pipeline["compile"].cpu_heavy);
        assert!(config.cache.verify_integrity);
        assert_eq!(config.cache.max_size_mb, Some(512));
        assert_eq!(config.packages.len(), 2);
        assert_eq!(config.packages[0].scripts["compile"], "tsc");
        assert_eq!(config.packages[1].dependencies, vec!["core"]);
    }

    #[test]
    fn test_load_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("rivet.yaml");
        std::fs::write(
            &config_path,
            "tasks:\n  concurrency: 2\n  pipeline:\n    ci:\n      script: false\n      depends_on: [build, test]\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.tasks.concurrency, 2);
        assert!(!config.tasks.pipeline["ci"].script);
    }

    #[test]
    fn test_load_config_or_default_without_file() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path()).unwrap();
        assert!(path.is_none());
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_load_config_or_default_rejects_invalid_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("rivet.toml"), "[tasks]\nconcurrency = 0").unwrap();
        assert!(load_config_or_default(temp.path()).is_err());
    }
}
