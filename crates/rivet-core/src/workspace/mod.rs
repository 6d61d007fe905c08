//! Workspace package inventory
//!
//! Discovery of packages from on-disk manifests is out of scope; packages
//! are supplied through a [`PackageSource`]. The inventory provides what the
//! task graph needs:
//! - Script names and commands per package
//! - Upstream dependencies (for `^task` expansion)
//! - Release-group-root flags

pub mod graph;
pub mod package;

pub use graph::{PackageGraph, PackageNode};
pub use package::{ConfigPackageSource, PackageInfo, PackageSource};
