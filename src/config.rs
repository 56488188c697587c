// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

const APP_DIR_NAME: &str = "convoy";
const CONFIG_FILE_NAME: &str = "convoy.toml";
const CONFIG_ENV_VAR: &str = "CONVOY_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "convoy.sqlite";
const STAGING_DIR_NAME: &str = "staging";
const DEFAULT_BACKEND: &str = "local";
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 300;
const DEFAULT_MAX_JOB_AGE_HOURS: u64 = 48;

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database_path: Option<String>,
    staging_root: Option<String>,
    default_backend: Option<String>,
    reaper_interval_secs: Option<u64>,
    max_job_age_hours: Option<u64>,
    verbose: Option<bool>,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub staging_root: PathBuf,
    pub default_backend: String,
    pub reaper_interval_secs: u64,
    pub max_job_age_hours: u64,
    pub verbose: bool,
    #[allow(dead_code)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub database_path: ConfigValue<PathBuf>,
    pub staging_root: ConfigValue<PathBuf>,
    pub default_backend: ConfigValue<String>,
    pub reaper_interval_secs: ConfigValue<u64>,
    pub max_job_age_hours: ConfigValue<u64>,
    pub verbose: ConfigValue<bool>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub staging_root: Option<PathBuf>,
    pub default_backend: Option<String>,
    pub reaper_interval_secs: Option<u64>,
    pub max_job_age_hours: Option<u64>,
    pub verbose: Option<bool>,
}

#[allow(dead_code)]
pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };

    let config_dir = config_path.as_deref().and_then(|path| path.parent());

    let (database_path, database_source) = match overrides.database_path {
        Some(path) => (expand_path(path), ConfigSource::Override),
        None => match file_config.database_path {
            Some(raw) => (resolve_path(&raw, config_dir), ConfigSource::ConfigFile),
            None => (
                default_database_path().with_context(|| {
                    "failed to resolve default database path; specify --database-path or set database_path in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let (staging_root, staging_source) = match overrides.staging_root {
        Some(path) => (expand_path(path), ConfigSource::Override),
        None => match file_config.staging_root {
            Some(raw) => (resolve_path(&raw, config_dir), ConfigSource::ConfigFile),
            None => (
                default_staging_root().with_context(|| {
                    "failed to resolve default staging root; specify --staging-root or set staging_root in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let (default_backend, backend_source) = match overrides.default_backend {
        Some(name) => (name, ConfigSource::Override),
        None => match file_config.default_backend {
            Some(name) => (name, ConfigSource::ConfigFile),
            None => (DEFAULT_BACKEND.to_string(), ConfigSource::Default),
        },
    };
    if default_backend.trim().is_empty() {
        anyhow::bail!("default_backend must not be empty");
    }

    let (reaper_interval_secs, reaper_source) = match overrides.reaper_interval_secs {
        Some(secs) => (secs, ConfigSource::Override),
        None => match file_config.reaper_interval_secs {
            Some(secs) => (secs, ConfigSource::ConfigFile),
            None => (DEFAULT_REAPER_INTERVAL_SECS, ConfigSource::Default),
        },
    };
    if reaper_interval_secs == 0 {
        anyhow::bail!("reaper_interval_secs must be at least 1");
    }

    let (max_job_age_hours, max_age_source) = match overrides.max_job_age_hours {
        Some(hours) => (hours, ConfigSource::Override),
        None => match file_config.max_job_age_hours {
            Some(hours) => (hours, ConfigSource::ConfigFile),
            None => (DEFAULT_MAX_JOB_AGE_HOURS, ConfigSource::Default),
        },
    };
    if max_job_age_hours == 0 {
        anyhow::bail!("max_job_age_hours must be at least 1");
    }

    let (verbose, verbose_source) = match overrides.verbose {
        Some(verbose) => (verbose, ConfigSource::Override),
        None => match file_config.verbose {
            Some(verbose) => (verbose, ConfigSource::ConfigFile),
            None => (false, ConfigSource::Default),
        },
    };

    let config = Config {
        database_path,
        staging_root,
        default_backend,
        reaper_interval_secs,
        max_job_age_hours,
        verbose,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        database_path: ConfigValue {
            value: config.database_path.clone(),
            source: database_source,
        },
        staging_root: ConfigValue {
            value: config.staging_root.clone(),
            source: staging_source,
        },
        default_backend: ConfigValue {
            value: config.default_backend.clone(),
            source: backend_source,
        },
        reaper_interval_secs: ConfigValue {
            value: config.reaper_interval_secs,
            source: reaper_source,
        },
        max_job_age_hours: ConfigValue {
            value: config.max_job_age_hours,
            source: max_age_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
    };

    Ok(LoadResult { config, report })
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
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

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
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
    Ok(default_config_dir()?.join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join(DATABASE_FILE_NAME))
}

fn default_staging_root() -> Result<PathBuf> {
    Ok(default_data_dir()?.join(STAGING_DIR_NAME))
}

fn default_config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME))
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME))
}
