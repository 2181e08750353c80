use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

const DEFAULT_MAX_CONCURRENT: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Durable artifact store root.
    pub store_dir: Option<String>,
    /// Local content cache root.
    pub cache_dir: Option<String>,
    /// Root under which task working directories are created.
    pub work_dir: Option<String>,
    /// Persisted requests, tasks and provenance.
    pub state_dir: Option<String>,
    /// Copy staged inputs instead of symlinking them (sandboxes without shared links).
    #[serde(default)]
    pub copy_inputs: bool,
    pub max_concurrent: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    /// Operation manifest files loaded into the registry.
    #[serde(default)]
    pub manifests: Vec<String>,
    /// Declared tool versions, consulted before probing the tool itself.
    #[serde(default)]
    pub tool_versions: BTreeMap<String, String>,
}

impl Config {
    /// Base directory; `$TASKLINE_HOME` overrides `~/.taskline`.
    pub fn taskline_dir() -> Result<PathBuf> {
        if let Ok(home) = std::env::var("TASKLINE_HOME") {
            if !home.is_empty() {
                return Ok(expand_tilde(&home));
            }
        }
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskline"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::taskline_dir()?.join("taskline.toml"))
    }

    pub fn store_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.store_dir.as_deref(), "store")
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.cache_dir.as_deref(), "cache")
    }

    pub fn work_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.work_dir.as_deref(), "work")
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.state_dir.as_deref(), "state")
    }

    fn dir_or_default(&self, configured: Option<&str>, default: &str) -> Result<PathBuf> {
        match configured {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::taskline_dir()?.join(default)),
        }
    }

    pub fn effective_max_concurrent(&self) -> usize {
        self.max_concurrent
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS))
    }

    pub fn manifest_paths(&self) -> Vec<PathBuf> {
        self.manifests.iter().map(|m| expand_tilde(m)).collect()
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        tracing::debug!(
            store_dir = ?config.store_dir,
            cache_dir = ?config.cache_dir,
            copy_inputs = config.copy_inputs,
            manifests = config.manifests.len(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::taskline_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.store_dir()?,
            self.cache_dir()?,
            self.work_dir()?,
            self.state_dir()?,
        ] {
            if !dir.exists() {
                tracing::debug!(dir = %dir.display(), "Creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
