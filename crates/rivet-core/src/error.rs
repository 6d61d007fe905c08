//! Error types for Rivet

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using RivetError
pub type Result<T> = std::result::Result<T, RivetError>;

/// Main error type for Rivet core operations
#[derive(Debug, Error)]
pub enum RivetError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Workspace / package inventory errors
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Package inventory errors
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Two packages share a name
    #[error("Duplicate package name: {0}")]
    DuplicatePackage(String),

    /// Package requested by name does not exist
    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    /// Packages depend on each other in a loop
    #[error("Circular package dependencies detected: {0}")]
    CircularDependency(String),
}
