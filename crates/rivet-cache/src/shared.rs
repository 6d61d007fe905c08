//! Shared cache manager

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::atomic::{copy_atomic, staging_dir};
use crate::digest::hash_file;
use crate::error::{CacheError, RestoreFailure, StoreFailure};
use crate::key::{CacheKey, CacheKeyInputs, CACHE_SCHEMA_VERSION};
use crate::manifest::{is_package_relative, CacheManifest, OutputFile, MANIFEST_FILE};
use crate::stats::CacheStatistics;

/// Directory inside an entry holding the cached outputs
pub(crate) const OUTPUTS_DIR: &str = "outputs";

/// Statistics are flushed to disk after this many stores
const STATS_FLUSH_INTERVAL: u64 = 16;

/// Behaviour switches for a cache handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Never write entries; lookups and restores still work
    pub skip_write: bool,
    /// Re-hash cached outputs before restoring them
    pub verify_integrity: bool,
    /// Replace an existing entry instead of refusing the store
    pub overwrite: bool,
}

/// A cache hit
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub cache_key: CacheKey,
    /// Entry directory, derived from the key
    pub entry_path: PathBuf,
    pub manifest: CacheManifest,
}

/// Result of a finished task, as handed to [`SharedCache::store`]
#[derive(Debug, Clone)]
pub struct TaskOutputs {
    /// Directory the output paths are relative to
    pub package_root: PathBuf,
    /// Package-relative output files
    pub files: Vec<String>,
    pub exit_code: i32,
    pub execution_time: Duration,
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of [`SharedCache::store`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// A new entry was written
    Stored {
        key: CacheKey,
        files: usize,
        bytes: u64,
        duration: Duration,
    },
    /// Nothing was written; the build carries on uncached
    NotStored(StoreFailure),
}

impl StoreOutcome {
    /// Whether an entry was written
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// Outcome of [`SharedCache::restore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreResult {
    /// Every output was copied back into the package
    Restored {
        files: usize,
        bytes: u64,
        duration: Duration,
    },
    /// The entry could not be used; the task has to run
    Failed(RestoreFailure),
}

/// Handle to a cache directory.
///
/// Cheap to clone; all clones share one initialization, one statistics
/// record and one set of pending background writes. Safe to use from many
/// tasks at once: there is no global lock, entries are protected by the
/// manifest-existence check and atomic renames.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    options: CacheOptions,
    init: OnceCell<()>,
    stats: Mutex<CacheStatistics>,
    stores_since_flush: AtomicU64,
    pending: Mutex<JoinSet<()>>,
}

impl fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("root", &self.inner.root)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl SharedCache {
    /// Create a handle for the cache rooted at `root`.
    ///
    /// Nothing touches the disk until [`initialize`](Self::initialize) or the
    /// first operation.
    pub fn new(root: impl Into<PathBuf>, options: CacheOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                options,
                init: OnceCell::new(),
                stats: Mutex::new(CacheStatistics::default()),
                stores_since_flush: AtomicU64::new(0),
                pending: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn options(&self) -> CacheOptions {
        self.inner.options
    }

    /// Directory of the entry for `key`
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.inner.root.join(key.as_str())
    }

    /// Create the cache layout and load statistics.
    ///
    /// Idempotent; concurrent callers wait for the same initialization.
    pub async fn initialize(&self) -> Result<(), CacheError> {
        self.inner
            .init
            .get_or_try_init(|| async {
                let root = self.inner.root.clone();
                let stats = tokio::task::spawn_blocking(move || {
                    fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, e))?;
                    Ok::<_, CacheError>(CacheStatistics::load(&root))
                })
                .await??;

                info!(
                    root = %self.inner.root.display(),
                    entries = stats.total_entries,
                    "cache initialized"
                );
                *self.lock_stats() = stats;
                Ok::<_, CacheError>(())
            })
            .await?;
        Ok(())
    }

    /// Look up the entry for `inputs`.
    ///
    /// Any failure to read or validate the entry, or a build environment that
    /// differs from the one recorded, is a miss. A hit is only counted once
    /// [`restore`](Self::restore) succeeds.
    #[instrument(skip_all, fields(package = %inputs.package_name, task = %inputs.task_name))]
    pub async fn lookup(&self, inputs: &CacheKeyInputs) -> Option<CacheEntry> {
        if let Err(e) = self.initialize().await {
            debug!(error = %e, "cache unavailable, treating as miss");
            return None;
        }

        let key = inputs.compute_key();
        let entry_path = self.entry_path(&key);

        let dir = entry_path.clone();
        let load_key = key.clone();
        let loaded =
            tokio::task::spawn_blocking(move || CacheManifest::load(&dir, &load_key)).await;

        let manifest = match loaded {
            Ok(Ok(Some(manifest))) => manifest,
            Ok(Ok(None)) => {
                debug!(key = %key, "cache miss");
                self.lock_stats().record_miss();
                return None;
            }
            Ok(Err(e)) => {
                debug!(key = %key, error = %e, "unusable cache entry, treating as miss");
                self.lock_stats().record_miss();
                return None;
            }
            Err(e) => {
                debug!(key = %key, error = %e, "cache lookup failed, treating as miss");
                self.lock_stats().record_miss();
                return None;
            }
        };

        if manifest.environment != inputs.global {
            debug!(key = %key, "build environment changed, treating as miss");
            self.lock_stats().record_miss();
            return None;
        }

        if manifest.package_name != inputs.package_name || manifest.task_name != inputs.task_name
        {
            debug!(key = %key, "entry belongs to another task, treating as miss");
            self.lock_stats().record_miss();
            return None;
        }

        debug!(key = %key, "cache hit");
        self.touch_in_background(entry_path.clone(), manifest.clone());

        Some(CacheEntry {
            cache_key: key,
            entry_path,
            manifest,
        })
    }

    /// Persist the result of a successful task.
    ///
    /// `lookup_was_performed` tells whether the caller looked the key up
    /// before running; an entry found now then means another process stored
    /// it concurrently.
    #[instrument(skip_all, fields(package = %inputs.package_name, task = %inputs.task_name))]
    pub async fn store(
        &self,
        inputs: &CacheKeyInputs,
        outputs: &TaskOutputs,
        lookup_was_performed: bool,
    ) -> StoreOutcome {
        if self.inner.options.skip_write {
            return StoreOutcome::NotStored(StoreFailure::WritesDisabled);
        }
        if outputs.exit_code != 0 {
            return StoreOutcome::NotStored(StoreFailure::NonZeroExit(outputs.exit_code));
        }
        if let Err(e) = self.initialize().await {
            return StoreOutcome::NotStored(e.into());
        }

        let key = inputs.compute_key();
        let cache = self.clone();
        let inputs = inputs.clone();
        let outputs = outputs.clone();
        let write_key = key.clone();
        let result = tokio::task::spawn_blocking(move || {
            cache.write_entry(&write_key, &inputs, &outputs, lookup_was_performed)
        })
        .await;

        match result {
            Ok(Ok(written)) => {
                {
                    let mut stats = self.lock_stats();
                    if let Some(bytes) = written.replaced_bytes {
                        stats.record_removal(bytes);
                    }
                    stats.record_store(written.bytes, written.duration.as_secs_f64() * 1000.0);
                }
                self.maybe_flush_stats();

                debug!(key = %key, files = written.files, bytes = written.bytes, "task output cached");
                StoreOutcome::Stored {
                    key,
                    files: written.files,
                    bytes: written.bytes,
                    duration: written.duration,
                }
            }
            Ok(Err(failure)) => {
                match &failure {
                    StoreFailure::AlreadyExists { .. } => debug!(reason = %failure, "task output not cached"),
                    _ => warn!(reason = %failure, "task output not cached"),
                }
                StoreOutcome::NotStored(failure)
            }
            Err(e) => StoreOutcome::NotStored(StoreFailure::Unavailable(e.to_string())),
        }
    }

    /// Copy the outputs of `entry` back into `package_root`
    #[instrument(skip_all, fields(key = %entry.cache_key))]
    pub async fn restore(&self, entry: &CacheEntry, package_root: &Path) -> RestoreResult {
        let start = Instant::now();
        let verify = self.inner.options.verify_integrity;
        let entry_owned = entry.clone();
        let root = package_root.to_path_buf();

        let result =
            tokio::task::spawn_blocking(move || restore_entry(&entry_owned, &root, verify)).await;

        match result {
            Ok(Ok((files, bytes))) => {
                let duration = start.elapsed();
                {
                    let mut stats = self.lock_stats();
                    stats.record_restore(duration.as_secs_f64() * 1000.0);
                    stats.record_hit(entry.manifest.execution_time_ms);
                }
                debug!(files, bytes, "outputs restored");
                RestoreResult::Restored {
                    files,
                    bytes,
                    duration,
                }
            }
            Ok(Err(failure)) => {
                warn!(reason = %failure, "cache entry could not be restored");
                self.lock_stats().record_miss();
                RestoreResult::Failed(failure)
            }
            Err(e) => {
                self.lock_stats().record_miss();
                RestoreResult::Failed(RestoreFailure::Io {
                    path: entry.entry_path.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Remove an entry that could not be restored so the next store can
    /// replace it. Returns whether the entry was removed.
    #[instrument(skip_all, fields(key = %entry.cache_key))]
    pub async fn invalidate(&self, entry: &CacheEntry) -> bool {
        // A queued access-time update would otherwise recreate the old manifest.
        self.drain_pending().await;

        let dir = entry.entry_path.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let size = dir_size(&dir);
            fs::remove_dir_all(&dir).map(|()| size)
        })
        .await;

        match removed {
            Ok(Ok(size)) => {
                self.lock_stats().record_removal(size);
                debug!("invalid cache entry removed");
                true
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => false,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to remove invalid cache entry");
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to remove invalid cache entry");
                false
            }
        }
    }

    /// Wait for background writes and persist statistics
    pub async fn shutdown(&self) {
        self.drain_pending().await;

        if self.inner.init.initialized() {
            if let Err(e) = self.save_stats().await {
                warn!(error = %e, "failed to persist cache statistics");
            }
        }
    }

    /// Snapshot of the current statistics
    pub fn statistics(&self) -> CacheStatistics {
        self.lock_stats().clone()
    }

    /// Human-readable statistics
    pub fn display_statistics(&self) -> String {
        format!("Cache: {}\n{}", self.inner.root.display(), self.statistics())
    }

    pub(crate) fn lock_stats(&self) -> MutexGuard<'_, CacheStatistics> {
        self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn save_stats(&self) -> Result<(), CacheError> {
        let stats = self.statistics();
        let root = self.inner.root.clone();
        tokio::task::spawn_blocking(move || stats.save(&root).map_err(|e| CacheError::io(&root, e)))
            .await?
    }

    /// Wait for every pending background write
    pub(crate) async fn drain_pending(&self) {
        let mut pending = {
            let mut guard = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                debug!(error = %e, "background cache write failed");
            }
        }
    }

    fn spawn_pending<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while pending.try_join_next().is_some() {}
        pending.spawn_blocking(job);
    }

    fn touch_in_background(&self, entry_path: PathBuf, mut manifest: CacheManifest) {
        self.spawn_pending(move || {
            manifest.last_accessed_at = Utc::now();
            if let Err(e) = manifest.save(&entry_path) {
                debug!(error = %e, "failed to update last access time");
            }
        });
    }

    fn maybe_flush_stats(&self) {
        let stores = self.inner.stores_since_flush.fetch_add(1, Ordering::Relaxed) + 1;
        if stores % STATS_FLUSH_INTERVAL != 0 {
            return;
        }

        let stats = self.statistics();
        let root = self.inner.root.clone();
        self.spawn_pending(move || {
            if let Err(e) = stats.save(&root) {
                debug!(error = %e, "periodic statistics flush failed");
            }
        });
    }

    fn write_entry(
        &self,
        key: &CacheKey,
        inputs: &CacheKeyInputs,
        outputs: &TaskOutputs,
        lookup_was_performed: bool,
    ) -> Result<WrittenEntry, StoreFailure> {
        let start = Instant::now();
        let entry_dir = self.entry_path(key);
        let manifest_path = entry_dir.join(MANIFEST_FILE);

        let mut replaced_bytes = None;
        if manifest_path.exists() {
            if !self.inner.options.overwrite {
                return Err(StoreFailure::AlreadyExists {
                    key: key.to_string(),
                    concurrent: lookup_was_performed,
                });
            }
            replaced_bytes = Some(dir_size(&entry_dir));
            fs::remove_dir_all(&entry_dir).map_err(|e| StoreFailure::from_io(&entry_dir, &e))?;
            debug!(key = %key, "replacing existing entry");
        }

        let mut files: Vec<&str> = outputs.files.iter().map(String::as_str).collect();
        files.sort_unstable();
        files.dedup();

        for rel in &files {
            check_output(&outputs.package_root, rel)?;
        }

        // Dropping the staging directory on any error path deletes it.
        let staging = staging_dir(self.root()).map_err(|e| StoreFailure::from_io(self.root(), &e))?;
        let output_files = populate_entry(staging.path(), key, inputs, outputs, &files)?;

        if let Err(e) = fs::rename(staging.path(), &entry_dir) {
            if entry_dir.exists() {
                debug!(key = %key, error = %e, "entry published by another writer");
                return Err(StoreFailure::AlreadyExists {
                    key: key.to_string(),
                    concurrent: true,
                });
            }
            return Err(StoreFailure::from_io(&entry_dir, &e));
        }

        let bytes = output_files.iter().map(|f| f.size).sum();
        Ok(WrittenEntry {
            files: output_files.len(),
            bytes,
            duration: start.elapsed(),
            replaced_bytes,
        })
    }
}

struct WrittenEntry {
    files: usize,
    bytes: u64,
    duration: Duration,
    replaced_bytes: Option<u64>,
}

fn check_output(package_root: &Path, rel: &str) -> Result<(), StoreFailure> {
    if !is_package_relative(rel) {
        return Err(StoreFailure::OutputOutsidePackage(rel.to_string()));
    }

    let path = package_root.join(rel);
    match fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => Err(StoreFailure::OutputIsDirectory(rel.to_string())),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(StoreFailure::MissingOutput(rel.to_string()))
        }
        Err(e) => Err(StoreFailure::from_io(&path, &e)),
    }
}

/// Copy outputs into the entry and write the manifest last
fn populate_entry(
    entry_dir: &Path,
    key: &CacheKey,
    inputs: &CacheKeyInputs,
    outputs: &TaskOutputs,
    files: &[&str],
) -> Result<Vec<OutputFile>, StoreFailure> {
    let outputs_dir = entry_dir.join(OUTPUTS_DIR);
    fs::create_dir_all(&outputs_dir).map_err(|e| StoreFailure::from_io(&outputs_dir, &e))?;

    let mut output_files = Vec::with_capacity(files.len());
    for rel in files {
        let src = outputs.package_root.join(rel);
        let dest = outputs_dir.join(rel);
        copy_atomic(&src, &dest).map_err(|e| StoreFailure::from_io(&dest, &e))?;

        // Hash the cached copy so the manifest describes exactly what is stored.
        let digest = hash_file(&dest).map_err(|e| StoreFailure::from_io(&dest, &e))?;
        output_files.push(OutputFile {
            path: rel.to_string(),
            hash: digest.hash,
            size: digest.size,
        });
    }

    let now = Utc::now();
    let manifest = CacheManifest {
        version: CACHE_SCHEMA_VERSION,
        cache_key: key.to_string(),
        package_name: inputs.package_name.clone(),
        task_name: inputs.task_name.clone(),
        executable: inputs.executable.clone(),
        command: inputs.command.clone(),
        exit_code: outputs.exit_code,
        execution_time_ms: outputs.execution_time.as_millis() as u64,
        environment: inputs.global.clone(),
        input_files: inputs.input_hashes.clone(),
        output_files: output_files.clone(),
        stdout: outputs.stdout.clone(),
        stderr: outputs.stderr.clone(),
        created_at: now,
        last_accessed_at: now,
    };
    manifest.save(entry_dir).map_err(StoreFailure::from)?;

    Ok(output_files)
}

fn restore_entry(
    entry: &CacheEntry,
    package_root: &Path,
    verify: bool,
) -> Result<(usize, u64), RestoreFailure> {
    let outputs_dir = entry.entry_path.join(OUTPUTS_DIR);
    let missing_or_io = |rel: &str, path: &Path, e: io::Error| {
        if e.kind() == io::ErrorKind::NotFound {
            RestoreFailure::MissingCachedOutput(rel.to_string())
        } else {
            RestoreFailure::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        }
    };

    if verify {
        for output in &entry.manifest.output_files {
            let cached = outputs_dir.join(&output.path);
            let digest = hash_file(&cached).map_err(|e| missing_or_io(&output.path, &cached, e))?;
            if digest.hash != output.hash {
                return Err(RestoreFailure::IntegrityMismatch {
                    path: output.path.clone(),
                    expected: output.hash.clone(),
                    actual: digest.hash,
                });
            }
        }
    }

    let mut bytes = 0;
    for output in &entry.manifest.output_files {
        let cached = outputs_dir.join(&output.path);
        let dest = package_root.join(&output.path);
        if !cached.exists() {
            return Err(RestoreFailure::MissingCachedOutput(output.path.clone()));
        }
        bytes += copy_atomic(&cached, &dest).map_err(|e| RestoreFailure::Io {
            path: dest.clone(),
            message: e.to_string(),
        })?;
    }

    Ok((entry.manifest.output_files.len(), bytes))
}

/// Total size of the files below `dir`
pub(crate) fn dir_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
