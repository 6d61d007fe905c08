//! Configuration validation
//!
//! Only structural checks live here. Task references are resolved and
//! validated when the task graph is built.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_tasks(config)?;
    validate_cache(config)?;
    validate_packages(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

fn validate_tasks(config: &Config) -> Result<()> {
    if config.tasks.concurrency == 0 {
        return Err(invalid("tasks.concurrency", "must be at least 1").into());
    }

    if config.tasks.cpu_workers == Some(0) {
        return Err(invalid("tasks.cpu_workers", "must be at least 1 when set").into());
    }

    for name in config.tasks.pipeline.keys() {
        if name.is_empty() || name.contains('#') || name.starts_with('^') || name == "*" {
            return Err(invalid(
                format!("tasks.pipeline.{}", name),
                "task names cannot be empty or contain '#', '^' or '*'",
            )
            .into());
        }
    }

    Ok(())
}

fn validate_cache(config: &Config) -> Result<()> {
    if config.cache.enabled && config.cache.dir.as_os_str().is_empty() {
        return Err(invalid("cache.dir", "cache directory cannot be empty").into());
    }

    if config.cache.max_size_mb == Some(0) {
        return Err(invalid("cache.max_size_mb", "must be greater than 0").into());
    }

    Ok(())
}

fn validate_packages(config: &Config) -> Result<()> {
    if !config.packages.is_empty() {
        debug!(count = config.packages.len(), "validating packages");
    }

    let mut seen = HashSet::new();
    for (i, package) in config.packages.iter().enumerate() {
        if package.name.is_empty() {
            return Err(invalid(
                format!("packages[{}].name", i),
                "package name cannot be empty",
            )
            .into());
        }

        if !seen.insert(package.name.as_str()) {
            return Err(invalid(
                format!("packages[{}].name", i),
                format!("duplicate package name '{}'", package.name),
            )
            .into());
        }
    }

    Ok(())
}
