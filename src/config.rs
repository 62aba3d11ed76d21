// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::job::JobOptions;

const APP_DIR_NAME: &str = "stagehand";
const CONFIG_FILE_NAME: &str = "stagehand.toml";
const CONFIG_ENV_VAR: &str = "STAGEHAND_CONFIG_PATH";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_GRACE_WINDOW_SECS: u64 = 10;
const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
const DEFAULT_KEEPALIVE_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    workdir: Option<String>,
    poll_interval_ms: Option<u64>,
    grace_window_secs: Option<u64>,
    chunk_size: Option<u64>,
    keepalive_secs: Option<u64>,
    verbose: Option<bool>,
}

#[derive(Debug)]
pub struct Config {
    /// Default staging base for jobs that do not name one themselves.
    pub workdir: Option<String>,
    pub poll_interval_ms: u64,
    pub grace_window_secs: u64,
    pub chunk_size: u64,
    pub keepalive_secs: u64,
    pub verbose: bool,
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            grace_window: Duration::from_secs(self.grace_window_secs),
            chunk_size: self.chunk_size as usize,
        }
    }
}

/// Per-field overrides that win over config-file values.
#[derive(Debug, Default)]
pub struct Overrides {
    pub workdir: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub grace_window_secs: Option<u64>,
    pub chunk_size: Option<u64>,
    pub keepalive_secs: Option<u64>,
    pub verbose: Option<bool>,
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    let (config_path, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), true),
            None => (default_config_path().ok(), false),
        },
    };

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };

    let poll_interval_ms = overrides
        .poll_interval_ms
        .or(file_config.poll_interval_ms)
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_interval_ms == 0 {
        anyhow::bail!("poll_interval_ms must be greater than zero");
    }
    let chunk_size = overrides
        .chunk_size
        .or(file_config.chunk_size)
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    if chunk_size == 0 {
        anyhow::bail!("chunk_size must be greater than zero");
    }

    Ok(Config {
        workdir: overrides.workdir.or(file_config.workdir),
        poll_interval_ms,
        grace_window_secs: overrides
            .grace_window_secs
            .or(file_config.grace_window_secs)
            .unwrap_or(DEFAULT_GRACE_WINDOW_SECS),
        chunk_size,
        keepalive_secs: overrides
            .keepalive_secs
            .or(file_config.keepalive_secs)
            .unwrap_or(DEFAULT_KEEPALIVE_SECS),
        verbose: overrides.verbose.or(file_config.verbose).unwrap_or(false),
        config_path,
    })
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}
