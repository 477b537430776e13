use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

pub const MIN_STORAGE_SIZE_MB: u64 = 50;

const KEY_LOGS: &str = "logs";
const KEY_STORAGE: &str = "storage";
const KEY_STORAGE_SIZE: &str = "storageSize";
const KEY_CHECKER_PATH: &str = "checkerPath";
const KEY_CHECKER_LANGUAGE: &str = "checkerLanguage";
const KEY_JAVA_PATH: &str = "javaPath";
const KEY_SERVER_HOST: &str = "mainServerHost";
const KEY_SERVER_KEY: &str = "mainServerKey";
const KEY_TICK_SECONDS: &str = "tickSeconds";
const KEY_REQUEST_TIMEOUT: &str = "requestTimeoutSeconds";
const KEY_CHECKER_TIMEOUT: &str = "checkerTimeoutSeconds";

/// Unvalidated settings as they appear in a config file or the environment.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub storage_size: Option<u64>,
    #[serde(default)]
    pub checker_path: Option<String>,
    #[serde(default)]
    pub checker_language: Option<String>,
    #[serde(default)]
    pub java_path: Option<String>,
    #[serde(default)]
    pub main_server_host: Option<String>,
    #[serde(default)]
    pub main_server_key: Option<String>,
    #[serde(default)]
    pub tick_seconds: Option<u64>,
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub checker_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub java: String,
    pub jar: Utf8PathBuf,
    pub language: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logs: Utf8PathBuf,
    pub storage: Utf8PathBuf,
    pub storage_size_mb: u64,
    pub tick: Duration,
    pub api: ApiConfig,
    pub checker: CheckerConfig,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the optional JSON file, overlays the process environment and
    /// validates the result.
    pub fn resolve(path: Option<&str>) -> Result<Config, WorkerError> {
        let raw = match path {
            Some(path) => Self::read_file(path)?,
            None => RawConfig::default(),
        };
        let raw = Self::overlay(raw, |key| std::env::var(key).ok())?;
        Self::resolve_config(raw)
    }

    pub fn read_file(path: &str) -> Result<RawConfig, WorkerError> {
        let content =
            fs::read_to_string(path).map_err(|_| WorkerError::ConfigRead(path.to_string()))?;
        serde_json::from_str(&content).map_err(|err| WorkerError::Config(err.to_string()))
    }

    /// Values found through `lookup` replace those already in `raw`.
    pub fn overlay<F>(mut raw: RawConfig, lookup: F) -> Result<RawConfig, WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let number = |key: &str| -> Result<Option<u64>, WorkerError> {
            match text(key) {
                Some(value) => value.trim().parse::<u64>().map(Some).map_err(|_| {
                    WorkerError::Config(format!("{key} must be a non-negative integer: {value}"))
                }),
                None => Ok(None),
            }
        };

        if let Some(value) = text(KEY_LOGS) {
            raw.logs = Some(value);
        }
        if let Some(value) = text(KEY_STORAGE) {
            raw.storage = Some(value);
        }
        if let Some(value) = number(KEY_STORAGE_SIZE)? {
            raw.storage_size = Some(value);
        }
        if let Some(value) = text(KEY_CHECKER_PATH) {
            raw.checker_path = Some(value);
        }
        if let Some(value) = text(KEY_CHECKER_LANGUAGE) {
            raw.checker_language = Some(value);
        }
        if let Some(value) = text(KEY_JAVA_PATH) {
            raw.java_path = Some(value);
        }
        if let Some(value) = text(KEY_SERVER_HOST) {
            raw.main_server_host = Some(value);
        }
        if let Some(value) = text(KEY_SERVER_KEY) {
            raw.main_server_key = Some(value);
        }
        if let Some(value) = number(KEY_TICK_SECONDS)? {
            raw.tick_seconds = Some(value);
        }
        if let Some(value) = number(KEY_REQUEST_TIMEOUT)? {
            raw.request_timeout_seconds = Some(value);
        }
        if let Some(value) = number(KEY_CHECKER_TIMEOUT)? {
            raw.checker_timeout_seconds = Some(value);
        }
        Ok(raw)
    }

    pub fn resolve_config(raw: RawConfig) -> Result<Config, WorkerError> {
        let storage = required(raw.storage, KEY_STORAGE)?;
        let checker_path = required(raw.checker_path, KEY_CHECKER_PATH)?;
        let host = required(raw.main_server_host, KEY_SERVER_HOST)?;
        let storage_size_mb = raw
            .storage_size
            .ok_or_else(|| WorkerError::MissingSetting(KEY_STORAGE_SIZE.to_string()))?;
        if storage_size_mb < MIN_STORAGE_SIZE_MB {
            return Err(WorkerError::BudgetTooSmall {
                size: storage_size_mb,
                min: MIN_STORAGE_SIZE_MB,
            });
        }

        let logs = match raw.logs.filter(|value| !value.trim().is_empty()) {
            Some(logs) => absolute_dir(&logs, KEY_LOGS)?,
            None => default_log_dir()?,
        };
        let storage = absolute_dir(&storage, KEY_STORAGE)?;

        let tick = non_zero(raw.tick_seconds.unwrap_or(5), KEY_TICK_SECONDS)?;
        let request_timeout = non_zero(
            raw.request_timeout_seconds.unwrap_or(60),
            KEY_REQUEST_TIMEOUT,
        )?;
        let checker_timeout = non_zero(
            raw.checker_timeout_seconds.unwrap_or(600),
            KEY_CHECKER_TIMEOUT,
        )?;

        Ok(Config {
            logs,
            storage,
            storage_size_mb,
            tick,
            api: ApiConfig {
                base_url: host.trim_end_matches('/').to_string(),
                key: raw
                    .main_server_key
                    .filter(|value| !value.trim().is_empty()),
                timeout: request_timeout,
            },
            checker: CheckerConfig {
                java: raw.java_path.unwrap_or_else(|| "java".to_string()),
                jar: Utf8PathBuf::from(checker_path),
                language: raw
                    .checker_language
                    .unwrap_or_else(|| "csharp".to_string()),
                timeout: checker_timeout,
            },
        })
    }
}

fn required(value: Option<String>, key: &str) -> Result<String, WorkerError> {
    value
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| WorkerError::MissingSetting(key.to_string()))
}

fn non_zero(seconds: u64, key: &str) -> Result<Duration, WorkerError> {
    if seconds == 0 {
        return Err(WorkerError::Config(format!("{key} must be greater than zero")));
    }
    Ok(Duration::from_secs(seconds))
}

/// Cached paths are stored as given, so the root must not depend on the
/// working directory of a later launch.
fn absolute_dir(value: &str, key: &str) -> Result<Utf8PathBuf, WorkerError> {
    let path = std::path::absolute(value)
        .map_err(|err| WorkerError::Config(format!("{key}: {err}")))?;
    Utf8PathBuf::from_path_buf(path).map_err(|path| {
        WorkerError::Config(format!("{key} is not valid UTF-8: {}", path.display()))
    })
}

fn default_log_dir() -> Result<Utf8PathBuf, WorkerError> {
    ProjectDirs::from("", "", "crosscheck-worker")
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("logs")).ok())
        .ok_or_else(|| WorkerError::Config("unable to resolve log directory".to_string()))
}
