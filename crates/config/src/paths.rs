//! Path utilities

use std::path::PathBuf;

/// Weaver data directory (~/.weaver), falling back to ./.weaver without a home
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".weaver"))
        .unwrap_or_else(|| PathBuf::from(".weaver"))
}

/// Configuration file location
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}
