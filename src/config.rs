//! Config loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the rendezvous files. Defaults to the per-user
    /// data directory.
    pub rendezvous_dir: Option<PathBuf>,
    /// Server-side handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rendezvous_dir: None,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl Config {
    pub fn rendezvous_dir(&self) -> PathBuf {
        self.rendezvous_dir
            .clone()
            .unwrap_or_else(paths::data_dir)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config render error: {0}")]
    Render(#[from] toml::ser::Error),
}

fn config_path() -> PathBuf {
    paths::config_dir().join("config.toml")
}

pub fn load() -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(config_path())?;
    Ok(toml::from_str(&contents)?)
}

/// Load the config, writing defaults on first run. Falls back to defaults
/// with a warning when the file is unreadable.
pub fn load_or_init() -> Config {
    let path = config_path();
    if path.exists() {
        match load() {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }

    let cfg = Config::default();
    if let Err(e) = write_config(&path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let contents = toml::to_string_pretty(cfg)?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| {
        ConfigError::Io(std::io::Error::other("config path missing parent directory"))
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    fs::write(temp.path(), data)?;
    temp.persist(path).map_err(|e| ConfigError::Io(e.error))?;
    Ok(())
}
