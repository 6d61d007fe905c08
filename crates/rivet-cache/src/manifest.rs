//! Per-entry metadata records

use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic::write_atomic;
use crate::error::CacheError;
use crate::key::{CacheKey, GlobalCacheKeyComponents, CACHE_SCHEMA_VERSION};

/// File name of the manifest inside an entry directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// A hashed task input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    /// Repo-relative path
    pub path: String,
    /// Content hash
    pub hash: String,
}

impl InputFile {
    /// Create an input record
    pub fn new(path: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hash: hash.into(),
        }
    }
}

/// A cached task output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Package-relative path
    pub path: String,
    /// Content hash
    pub hash: String,
    /// Size in bytes
    pub size: u64,
}

/// Metadata stored alongside a cache entry's outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Schema version the entry was written with
    pub version: u32,
    pub cache_key: String,
    pub package_name: String,
    pub task_name: String,
    pub executable: String,
    pub command: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    /// Build environment at store time
    pub environment: GlobalCacheKeyComponents,
    pub input_files: Vec<InputFile>,
    pub output_files: Vec<OutputFile>,
    pub stdout: String,
    pub stderr: String,
    pub created_at: DateTime<Utc>,
    /// Updated on every hit; the only field that changes after creation
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheManifest {
    /// Read the manifest of an entry.
    ///
    /// Returns `Ok(None)` when the entry has no manifest. A manifest that is
    /// unreadable, malformed or written for a different key is an error.
    pub fn load(entry_dir: &Path, expected_key: &CacheKey) -> Result<Option<Self>, CacheError> {
        let path = entry_dir.join(MANIFEST_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };

        let manifest: CacheManifest =
            serde_json::from_str(&content).map_err(|e| CacheError::ManifestParse {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        manifest
            .validate(expected_key)
            .map_err(|reason| CacheError::ManifestInvalid {
                path: path.clone(),
                reason,
            })?;

        debug!(key = %expected_key, "manifest loaded");
        Ok(Some(manifest))
    }

    /// Write the manifest atomically into `entry_dir`
    pub fn save(&self, entry_dir: &Path) -> Result<(), CacheError> {
        let path = entry_dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &json).map_err(|e| CacheError::io(path, e))
    }

    /// Check every field that a restore relies on
    pub fn validate(&self, expected_key: &CacheKey) -> Result<(), String> {
        if self.version != CACHE_SCHEMA_VERSION {
            return Err(format!(
                "schema version {} does not match {}",
                self.version, CACHE_SCHEMA_VERSION
            ));
        }
        if self.cache_key != expected_key.as_str() {
            return Err(format!(
                "manifest key {} does not match entry {}",
                self.cache_key, expected_key
            ));
        }
        if self.exit_code != 0 {
            return Err(format!("recorded exit code {} is not 0", self.exit_code));
        }
        if self.package_name.is_empty() || self.task_name.is_empty() {
            return Err("package and task names must not be empty".to_string());
        }
        for output in &self.output_files {
            if !is_package_relative(&output.path) {
                return Err(format!("output path '{}' escapes the package", output.path));
            }
            if output.hash.is_empty() {
                return Err(format!("output '{}' has no hash", output.path));
            }
        }
        Ok(())
    }

    /// Total bytes of all outputs
    pub fn output_size(&self) -> u64 {
        self.output_files.iter().map(|f| f.size).sum()
    }
}

/// Whether a path is relative and stays below its base directory
pub fn is_package_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
