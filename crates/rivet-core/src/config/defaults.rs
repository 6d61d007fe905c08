//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "rivet.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "rivet.yaml";

/// Default cache directory, relative to the workspace root
pub const DEFAULT_CACHE_DIR: &str = ".rivet/cache";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".rivet.toml",
        ".rivet.yaml",
    ]
}

/// Default task concurrency: one task per available core
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
