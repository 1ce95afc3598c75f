//! Directory helpers for rendezvous and config locations.

use std::path::PathBuf;

/// Base directory for rendezvous data.
///
/// Uses `ANP_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/anp-broker` or
/// `~/.local/share/anp-broker`.
pub(crate) fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ANP_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("anp-broker")
}

/// Base directory for configuration files.
///
/// Uses `ANP_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/anp-broker` or
/// `~/.config/anp-broker`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ANP_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("anp-broker")
}
