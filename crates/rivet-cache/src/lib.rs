//! Rivet Cache - shared content-addressable cache for task outputs
//!
//! Entries are keyed by a SHA-256 digest of a task's inputs and the build
//! environment. Every persistent write goes through the atomic writer, so a
//! reader never observes a partially written file.
//!
//! ```text
//! <cache-root>/
//!   stats.json
//!   <cache-key>/
//!     manifest.json
//!     outputs/<package-relative path>
//! ```

pub mod atomic;
pub mod digest;
pub mod error;
pub mod key;
mod maintenance;
pub mod manifest;
pub mod shared;
pub mod stats;

pub use error::{CacheError, RestoreFailure, StoreFailure};
pub use key::{CacheKey, CacheKeyInputs, GlobalCacheKeyComponents, CACHE_SCHEMA_VERSION};
pub use maintenance::VerifyReport;
pub use manifest::{CacheManifest, InputFile, OutputFile};
pub use shared::{
    CacheEntry, CacheOptions, RestoreResult, SharedCache, StoreOutcome, TaskOutputs,
};
pub use stats::CacheStatistics;
