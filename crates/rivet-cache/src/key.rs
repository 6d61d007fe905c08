//! Cache key computation
//!
//! A key is the lowercase hex SHA-256 of a canonical byte encoding of
//! [`CacheKeyInputs`]. Every variable-length value is prefixed with its
//! length and every optional value with a presence tag, so two different
//! inputs can never encode to the same byte stream.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::digest::hash_file;
use crate::manifest::InputFile;

/// Version of the key encoding and manifest layout.
///
/// Bumping it invalidates every existing entry.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

const KEY_DOMAIN: &[u8] = b"rivet-cache-key";

/// Cache key, a hex SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Properties of the build environment folded into every key.
///
/// A copy is stored in each manifest; a lookup whose environment differs from
/// the stored one is a miss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalCacheKeyComponents {
    /// [`CACHE_SCHEMA_VERSION`] at the time of writing
    pub cache_schema_version: u32,
    /// Version of the toolchain running the tasks
    pub runtime_version: String,
    /// CPU architecture
    pub arch: String,
    /// Operating system
    pub platform: String,
    /// Hash of the dependency lockfile (empty when there is none)
    pub lockfile_hash: String,
    /// Free-form environment mode (e.g. `production`)
    pub env_mode: Option<String>,
    /// Values of the configured cache-bust variables
    pub cache_bust_vars: Option<BTreeMap<String, String>>,
}

impl GlobalCacheKeyComponents {
    /// Components for the current machine
    pub fn new(runtime_version: impl Into<String>, lockfile_hash: impl Into<String>) -> Self {
        Self {
            cache_schema_version: CACHE_SCHEMA_VERSION,
            runtime_version: runtime_version.into(),
            arch: std::env::consts::ARCH.to_string(),
            platform: std::env::consts::OS.to_string(),
            lockfile_hash: lockfile_hash.into(),
            env_mode: None,
            cache_bust_vars: None,
        }
    }

    /// Set the environment mode
    pub fn with_env_mode(mut self, mode: impl Into<String>) -> Self {
        self.env_mode = Some(mode.into());
        self
    }

    /// Set the cache-bust variables
    pub fn with_cache_bust_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.cache_bust_vars = Some(vars);
        self
    }

    /// Collect components from the process environment.
    ///
    /// A missing or unreadable lockfile hashes as empty. Cache-bust variables
    /// that are unset are left out of the map.
    pub fn detect(
        runtime_version: &str,
        lockfile: Option<&Path>,
        env_mode: Option<&str>,
        cache_bust_env: &[String],
    ) -> Self {
        let lockfile_hash = lockfile
            .and_then(|path| match hash_file(path) {
                Ok(digest) => Some(digest.hash),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "lockfile not hashed");
                    None
                }
            })
            .unwrap_or_default();

        let mut components = Self::new(runtime_version, lockfile_hash);
        if let Some(mode) = env_mode {
            components = components.with_env_mode(mode);
        }
        if !cache_bust_env.is_empty() {
            let vars = cache_bust_env
                .iter()
                .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
                .collect();
            components = components.with_cache_bust_vars(vars);
        }
        components
    }
}

/// Everything that determines whether a task result can be reused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyInputs {
    /// Package the task belongs to
    pub package_name: String,
    /// Task name
    pub task_name: String,
    /// Program that runs the command
    pub executable: String,
    /// Command line
    pub command: String,
    /// Repo-relative input paths and their content hashes
    pub input_hashes: Vec<InputFile>,
    /// Keys of the task's direct dependencies, by task id
    pub upstream_keys: BTreeMap<String, String>,
    /// Environment variables passed to the command
    pub env: BTreeMap<String, String>,
    /// Build environment
    pub global: GlobalCacheKeyComponents,
}

impl CacheKeyInputs {
    /// Inputs with no files, upstream keys or env
    pub fn new(
        package_name: impl Into<String>,
        task_name: impl Into<String>,
        executable: impl Into<String>,
        command: impl Into<String>,
        global: GlobalCacheKeyComponents,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            task_name: task_name.into(),
            executable: executable.into(),
            command: command.into(),
            input_hashes: Vec::new(),
            upstream_keys: BTreeMap::new(),
            env: BTreeMap::new(),
            global,
        }
    }

    /// Compute the cache key
    pub fn compute_key(&self) -> CacheKey {
        let mut h = KeyHasher::new();

        h.str(&self.package_name);
        h.str(&self.task_name);
        h.str(&self.executable);
        h.str(&self.command);

        let mut inputs: Vec<&InputFile> = self.input_hashes.iter().collect();
        inputs.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.hash.cmp(&b.hash)));
        h.u64(inputs.len() as u64);
        for input in inputs {
            h.str(&input.path);
            h.str(&input.hash);
        }

        h.map(&self.upstream_keys);
        h.map(&self.env);

        let g = &self.global;
        h.u64(u64::from(g.cache_schema_version));
        h.str(&g.runtime_version);
        h.str(&g.arch);
        h.str(&g.platform);
        h.str(&g.lockfile_hash);
        h.opt_str(g.env_mode.as_deref());
        match &g.cache_bust_vars {
            None => h.tag(0),
            Some(vars) => {
                h.tag(1);
                h.map(vars);
            }
        }

        CacheKey(h.finish())
    }
}

struct KeyHasher(Sha256);

impl KeyHasher {
    fn new() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        Self(hasher)
    }

    fn tag(&mut self, tag: u8) {
        self.0.update([tag]);
    }

    fn u64(&mut self, value: u64) {
        self.0.update(value.to_le_bytes());
    }

    fn str(&mut self, value: &str) {
        self.u64(value.len() as u64);
        self.0.update(value.as_bytes());
    }

    fn opt_str(&mut self, value: Option<&str>) {
        match value {
            None => self.tag(0),
            Some(s) => {
                self.tag(1);
                self.str(s);
            }
        }
    }

    fn map(&mut self, map: &BTreeMap<String, String>) {
        self.u64(map.len() as u64);
        for (k, v) in map {
            self.str(k);
            self.str(v);
        }
    }

    fn finish(self) -> String {
        format!("{:x}", self.0.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> GlobalCacheKeyComponents {
        GlobalCacheKeyComponents::new("1.2.3", "lockhash")
    }

    fn inputs() -> CacheKeyInputs {
        let mut inputs = CacheKeyInputs::new("core", "build", "sh", "tsc -b", global());
        inputs.input_hashes = vec![
            InputFile::new("packages/core/a.ts", "aaa"),
            InputFile::new("packages/core/b.ts", "bbb"),
        ];
        inputs
    }

    #[test]
    fn test_key_is_hex_sha256() {
        let key = inputs().compute_key();
        assert_eq!(key.as_str().len(), 64);
        assert!(key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_key_deterministic() {
        assert_eq!(inputs().compute_key(), inputs().compute_key());
    }

    #[test]
    fn test_key_ignores_input_order() {
        let mut reordered = inputs();
        reordered.input_hashes.reverse();
        assert_eq!(inputs().compute_key(), reordered.compute_key());
    }

    #[test]
    fn test_key_changes_with_input_content() {
        let mut changed = inputs();
        changed.input_hashes[0].hash = "zzz".to_string();
        assert_ne!(inputs().compute_key(), changed.compute_key());
    }

    #[test]
    fn test_key_changes_with_each_global_component() {
        let base = inputs().compute_key();
        let variants: Vec<Box<dyn Fn(&mut GlobalCacheKeyComponents)>> = vec![
            Box::new(|g| g.cache_schema_version += 1),
            Box::new(|g| g.runtime_version = "1.2.4".to_string()),
            Box::new(|g| g.arch = "other-arch".to_string()),
            Box::new(|g| g.platform = "other-os".to_string()),
            Box::new(|g| g.lockfile_hash = "different".to_string()),
            Box::new(|g| g.env_mode = Some("production".to_string())),
            Box::new(|g| g.cache_bust_vars = Some(BTreeMap::new())),
        ];

        for mutate in variants {
            let mut changed = inputs();
            mutate(&mut changed.global);
            assert_ne!(base, changed.compute_key());
        }
    }

    #[test]
    fn test_key_changes_with_upstream_and_env() {
        let base = inputs().compute_key();

        let mut upstream = inputs();
        upstream
            .upstream_keys
            .insert("util#build".to_string(), "abc".to_string());
        assert_ne!(base, upstream.compute_key());

        let mut env = inputs();
        env.env.insert("NODE_ENV".to_string(), "test".to_string());
        assert_ne!(base, env.compute_key());
    }

    #[test]
    fn test_field_boundaries_do_not_alias() {
        let a = CacheKeyInputs::new("ab", "c", "sh", "x", global());
        let b = CacheKeyInputs::new("a", "bc", "sh", "x", global());
        assert_ne!(a.compute_key(), b.compute_key());

        let mut c = CacheKeyInputs::new("p", "t", "sh", "x", global());
        c.env.insert("A".to_string(), "B=C".to_string());
        let mut d = CacheKeyInputs::new("p", "t", "sh", "x", global());
        d.env.insert("A=B".to_string(), "C".to_string());
        assert_ne!(c.compute_key(), d.compute_key());
    }

    #[test]
    fn test_empty_env_mode_differs_from_none() {
        let mut a = inputs();
        a.global.env_mode = Some(String::new());
        assert_ne!(a.compute_key(), inputs().compute_key());
    }

    #[test]
    fn test_detect_without_lockfile() {
        let components = GlobalCacheKeyComponents::detect(
            "0.1.0",
            Some(Path::new("/nonexistent/lockfile")),
            None,
            &[],
        );
        assert_eq!(components.lockfile_hash, "");
        assert_eq!(components.cache_bust_vars, None);
        assert_eq!(components.platform, std::env::consts::OS);
    }

    #[test]
    fn test_detect_hashes_lockfile() {
        let temp = tempfile::TempDir::new().unwrap();
        let lockfile = temp.path().join("Cargo.lock");
        std::fs::write(&lockfile, "lock").unwrap();

        let components =
            GlobalCacheKeyComponents::detect("0.1.0", Some(&lockfile), Some("ci"), &[]);
        assert_eq!(components.lockfile_hash, crate::digest::hash_bytes(b"lock"));
        assert_eq!(components.env_mode.as_deref(), Some("ci"));
    }
}
