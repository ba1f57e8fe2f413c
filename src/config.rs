use anyhow::{anyhow, Context, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conversations::DEFAULT_MIN_GROUP_SIZE;
use crate::engine::EngineConfig;

const CONFIG_DIR_NAME: &str = "walletchat";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub grace_window_ms: u64,
    pub poll_interval_ms: u64,
    pub min_group_size: usize,
    /// Open a direct conversation right after a contact is added
    pub auto_open_on_add: bool,
    pub event_buffer: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            grace_window_ms: 30_000,
            poll_interval_ms: 5_000,
            min_group_size: DEFAULT_MIN_GROUP_SIZE,
            auto_open_on_add: false,
            event_buffer: 100,
        }
    }
}

impl AppConfig {
    /// Missing file means defaults; a file that does not parse is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        let contents = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: AppConfig =
            serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&get_config_path()?)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Config saved to {}", path.display());
        Ok(())
    }

    /// WALLETCHAT_GRACE_MS and WALLETCHAT_POLL_MS take precedence over the file
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("WALLETCHAT_GRACE_MS") {
            self.grace_window_ms = value
                .trim()
                .parse()
                .map_err(|e| anyhow!("WALLETCHAT_GRACE_MS must be a number of milliseconds: {}", e))?;
        }
        if let Ok(value) = env::var("WALLETCHAT_POLL_MS") {
            self.poll_interval_ms = value
                .trim()
                .parse()
                .map_err(|e| anyhow!("WALLETCHAT_POLL_MS must be a number of milliseconds: {}", e))?;
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            grace_window: Duration::from_millis(self.grace_window_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            event_buffer: self.event_buffer.max(1),
        }
    }
}

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `dir` instead of the platform config directory. Only the first call wins.
pub fn set_config_dir_override(dir: PathBuf) -> bool {
    CONFIG_DIR_OVERRIDE.set(dir).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = match CONFIG_DIR_OVERRIDE.get() {
        Some(dir) => dir.clone(),
        None => dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?
            .join(CONFIG_DIR_NAME),
    };

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}
