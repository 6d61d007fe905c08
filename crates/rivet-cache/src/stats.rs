//! Cache usage statistics

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic::write_atomic;

/// File name of the statistics record in the cache root
pub const STATS_FILE: &str = "stats.json";

/// Aggregate statistics for a cache directory.
///
/// Informational only: a missing or corrupt file loads as zeroes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStatistics {
    /// Number of entries in the cache
    pub total_entries: u64,
    /// Total bytes of cached outputs
    pub total_size: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Running average restore time
    pub avg_restore_time_ms: f64,
    /// Running average store time
    pub avg_store_time_ms: f64,
    pub restore_count: u64,
    pub store_count: u64,
    /// Sum of the original execution time of every hit
    pub time_saved_ms: u64,
    pub last_pruned: Option<DateTime<Utc>>,
}

impl CacheStatistics {
    /// Load statistics from the cache root
    pub fn load(root: &Path) -> Self {
        let path = root.join(STATS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                debug!(path = %path.display(), error = %e, "ignoring corrupt statistics");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist statistics to the cache root
    pub fn save(&self, root: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&root.join(STATS_FILE), &json)
    }

    /// Record a hit on an entry whose task originally took `execution_time_ms`
    pub fn record_hit(&mut self, execution_time_ms: u64) {
        self.hit_count += 1;
        self.time_saved_ms += execution_time_ms;
    }

    pub fn record_miss(&mut self) {
        self.miss_count += 1;
    }

    /// Record a new entry of `bytes` written in `duration_ms`
    pub fn record_store(&mut self, bytes: u64, duration_ms: f64) {
        self.store_count += 1;
        self.avg_store_time_ms = running_average(self.avg_store_time_ms, self.store_count, duration_ms);
        self.total_entries += 1;
        self.total_size += bytes;
    }

    /// Record an entry removed by overwrite or eviction
    pub fn record_removal(&mut self, bytes: u64) {
        self.total_entries = self.total_entries.saturating_sub(1);
        self.total_size = self.total_size.saturating_sub(bytes);
    }

    pub fn record_restore(&mut self, duration_ms: f64) {
        self.restore_count += 1;
        self.avg_restore_time_ms =
            running_average(self.avg_restore_time_ms, self.restore_count, duration_ms);
    }

    /// Hits as a fraction of lookups
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hit_count + self.miss_count;
        if lookups == 0 {
            0.0
        } else {
            self.hit_count as f64 / lookups as f64
        }
    }

    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        format_bytes(self.total_size)
    }
}

fn running_average(avg: f64, count: u64, sample: f64) -> f64 {
    avg + (sample - avg) / count as f64
}

/// Format a byte count in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

impl fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Entries:       {}", self.total_entries)?;
        writeln!(f, "Size:          {}", self.formatted_size())?;
        writeln!(
            f,
            "Hits/misses:   {}/{} ({:.1}% hit rate)",
            self.hit_count,
            self.miss_count,
            self.hit_rate() * 100.0
        )?;
        writeln!(f, "Avg restore:   {:.1} ms", self.avg_restore_time_ms)?;
        writeln!(f, "Avg store:     {:.1} ms", self.avg_store_time_ms)?;
        writeln!(f, "Time saved:    {:.1} s", self.time_saved_ms as f64 / 1000.0)?;
        match self.last_pruned {
            Some(at) => write!(f, "Last pruned:   {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
            None => write!(f, "Last pruned:   never"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_default() {
        let temp = TempDir::new().unwrap();
        assert_eq!(CacheStatistics::load(temp.path()), CacheStatistics::default());
    }

    #[test]
    fn test_load_corrupt_is_default() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(STATS_FILE), "garbage").unwrap();
        assert_eq!(CacheStatistics::load(temp.path()), CacheStatistics::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let mut stats = CacheStatistics::default();
        stats.record_hit(500);
        stats.record_miss();
        stats.save(temp.path()).unwrap();

        let loaded = CacheStatistics::load(temp.path());
        assert_eq!(loaded.hit_count, 1);
        assert_eq!(loaded.miss_count, 1);
        assert_eq!(loaded.time_saved_ms, 500);
    }

    #[test]
    fn test_running_averages() {
        let mut stats = CacheStatistics::default();
        stats.record_store(100, 10.0);
        stats.record_store(300, 30.0);
        assert_eq!(stats.avg_store_time_ms, 20.0);
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_size, 400);

        stats.record_removal(100);
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.total_size, 300);
    }

    #[test]
    fn test_hit_rate() {
        let mut stats = CacheStatistics::default();
        assert_eq!(stats.hit_rate(), 0.0);
        stats.record_hit(0);
        stats.record_hit(0);
        stats.record_hit(0);
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
