//! Cache pruning, verification and cleanup

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::atomic::is_temp_file;
use crate::digest::hash_file;
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::manifest::{CacheManifest, MANIFEST_FILE};
use crate::shared::{dir_size, SharedCache, OUTPUTS_DIR};
use crate::stats::CacheStatistics;

/// Result of [`SharedCache::verify_cache`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Entries examined
    pub total: usize,
    pub valid: usize,
    pub corrupted: usize,
    /// Corrupted entries that were deleted
    pub fixed: usize,
}

struct EntryInfo {
    path: PathBuf,
    last_accessed: DateTime<Utc>,
    size: u64,
}

impl SharedCache {
    /// Evict entries, least recently accessed first, until the cache is within
    /// both budgets.
    ///
    /// Entries whose manifest cannot be read count as the oldest. Returns the
    /// number of entries removed.
    #[instrument(skip(self))]
    pub async fn prune_cache(
        &self,
        max_size_mb: Option<u64>,
        max_age_days: Option<u64>,
    ) -> Result<usize, CacheError> {
        self.initialize().await?;
        self.drain_pending().await;

        let root = self.root().to_path_buf();
        let max_bytes = max_size_mb.map(|mb| mb.saturating_mul(1024 * 1024));
        let (removed, remaining, size) =
            tokio::task::spawn_blocking(move || prune_entries(&root, max_bytes, max_age_days))
                .await??;

        {
            let mut stats = self.lock_stats();
            stats.total_entries = remaining as u64;
            stats.total_size = size;
            stats.last_pruned = Some(Utc::now());
        }
        self.save_stats().await?;

        info!(removed, remaining, "cache pruned");
        Ok(removed)
    }

    /// Re-validate every manifest and output hash.
    ///
    /// With `fix`, corrupted entries are deleted.
    #[instrument(skip(self))]
    pub async fn verify_cache(&self, fix: bool) -> Result<VerifyReport, CacheError> {
        self.initialize().await?;
        self.drain_pending().await;

        let root = self.root().to_path_buf();
        let report = tokio::task::spawn_blocking(move || verify_entries(&root, fix)).await??;

        if report.fixed > 0 {
            let root = self.root().to_path_buf();
            let entries = tokio::task::spawn_blocking(move || scan_entries(&root)).await??;
            let mut stats = self.lock_stats();
            stats.total_entries = entries.len() as u64;
            stats.total_size = entries.iter().map(|e| e.size).sum();
        }
        self.save_stats().await?;

        info!(
            total = report.total,
            valid = report.valid,
            corrupted = report.corrupted,
            fixed = report.fixed,
            "cache verified"
        );
        Ok(report)
    }

    /// Remove every entry and reset statistics.
    ///
    /// Returns the number of entries removed.
    #[instrument(skip(self))]
    pub async fn clean_cache(&self) -> Result<usize, CacheError> {
        self.initialize().await?;
        self.drain_pending().await;

        let root = self.root().to_path_buf();
        let removed = tokio::task::spawn_blocking(move || clean_entries(&root)).await??;

        *self.lock_stats() = CacheStatistics::default();
        self.save_stats().await?;

        info!(removed, "cache cleaned");
        Ok(removed)
    }
}

fn entry_dirs(root: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root).map_err(|e| CacheError::io(root, e))? {
        let entry = entry.map_err(|e| CacheError::io(root, e))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn scan_entries(root: &Path) -> Result<Vec<EntryInfo>, CacheError> {
    let entries = entry_dirs(root)?
        .into_iter()
        .map(|path| {
            let last_accessed = fs::read_to_string(path.join(MANIFEST_FILE))
                .ok()
                .and_then(|content| serde_json::from_str::<CacheManifest>(&content).ok())
                .map(|m| m.last_accessed_at)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let size = dir_size(&path);
            EntryInfo {
                path,
                last_accessed,
                size,
            }
        })
        .collect();
    Ok(entries)
}

fn prune_entries(
    root: &Path,
    max_bytes: Option<u64>,
    max_age_days: Option<u64>,
) -> Result<(usize, usize, u64), CacheError> {
    let mut entries = scan_entries(root)?;
    entries.sort_by(|a, b| {
        a.last_accessed
            .cmp(&b.last_accessed)
            .then_with(|| a.path.cmp(&b.path))
    });

    let cutoff = max_age_days
        .and_then(|days| i64::try_from(days).ok())
        .and_then(ChronoDuration::try_days)
        .and_then(|age| Utc::now().checked_sub_signed(age));
    let mut total: u64 = entries.iter().map(|e| e.size).sum();
    let mut removed = 0;
    let mut remaining = entries.len();

    for entry in &entries {
        let too_old = cutoff.is_some_and(|c| entry.last_accessed < c);
        let over_budget = max_bytes.is_some_and(|max| total > max);
        if !too_old && !over_budget {
            // Later entries are newer and the total only shrinks.
            break;
        }

        match fs::remove_dir_all(&entry.path) {
            Ok(()) => {
                debug!(entry = %entry.path.display(), size = entry.size, "evicted cache entry");
                total = total.saturating_sub(entry.size);
                removed += 1;
                remaining -= 1;
            }
            Err(e) => warn!(entry = %entry.path.display(), error = %e, "failed to evict cache entry"),
        }
    }

    Ok((removed, remaining, total))
}

fn verify_entries(root: &Path, fix: bool) -> Result<VerifyReport, CacheError> {
    let mut report = VerifyReport::default();

    for path in entry_dirs(root)? {
        report.total += 1;

        let key = CacheKey(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        match check_entry(&path, &key) {
            Ok(()) => report.valid += 1,
            Err(reason) => {
                report.corrupted += 1;
                warn!(key = %key, reason = %reason, "corrupted cache entry");
                if fix {
                    match fs::remove_dir_all(&path) {
                        Ok(()) => report.fixed += 1,
                        Err(e) => warn!(key = %key, error = %e, "failed to remove corrupted entry"),
                    }
                }
            }
        }
    }

    Ok(report)
}

fn check_entry(path: &Path, key: &CacheKey) -> Result<(), String> {
    let manifest = match CacheManifest::load(path, key) {
        Ok(Some(manifest)) => manifest,
        Ok(None) => return Err("manifest is missing".to_string()),
        Err(e) => return Err(e.to_string()),
    };

    let outputs_dir = path.join(OUTPUTS_DIR);
    for output in &manifest.output_files {
        let digest = hash_file(&outputs_dir.join(&output.path))
            .map_err(|e| format!("output '{}': {}", output.path, e))?;
        if digest.hash != output.hash {
            return Err(format!("output '{}' hash mismatch", output.path));
        }
    }
    Ok(())
}

fn clean_entries(root: &Path) -> Result<usize, CacheError> {
    let mut removed = 0;
    for path in entry_dirs(root)? {
        fs::remove_dir_all(&path).map_err(|e| CacheError::io(&path, e))?;
        removed += 1;
    }

    // Leftovers of interrupted writes in the root
    for entry in fs::read_dir(root).map_err(|e| CacheError::io(root, e))?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_temp_file(&name) {
            let _ = fs::remove_file(entry.path());
        }
    }

    Ok(removed)
}
