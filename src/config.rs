#![forbid(unsafe_code)]

//! Runtime configuration for the ytlc binaries.
//!
//! One `Runtime` value is resolved at startup and passed explicitly into the
//! ingestion pipeline, the burst detector and the metadata importer: there is
//! no process-wide connection or implicit global. Precedence per key is
//! explicit override > process environment > `.env` file > built-in default.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DB_FILE: &str = "ytlc.db";
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Resolved settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Runtime {
    /// SQLite database file holding `live_chat` and `video_metadata`.
    pub db_path: PathBuf,
    /// Ingestion worker-pool size.
    pub workers: usize,
    /// Messages buffered per file before a dedup+upsert flush.
    pub buffer_size: usize,
}

/// Values the CLI may pin before the env/file lookup runs.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub db_path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub buffer_size: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime() -> Result<Runtime> {
    resolve_runtime(Overrides::default())
}

pub fn resolve_runtime(overrides: Overrides) -> Result<Runtime> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime(&file_vars, env_var_string, overrides)
}

fn build_runtime(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: Overrides,
) -> Result<Runtime> {
    let db_path = overrides
        .db_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("YTLC_DB", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DB_FILE.to_string());

    let workers = overrides
        .workers
        .or_else(|| {
            lookup_value("YTLC_WORKERS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .unwrap_or_else(default_workers)
        .max(1);

    let buffer_size = overrides
        .buffer_size
        .or_else(|| {
            lookup_value("YTLC_BUFFER", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .unwrap_or(DEFAULT_BUFFER_SIZE)
        .max(1);

    Ok(Runtime {
        db_path: PathBuf::from(db_path),
        workers,
        buffer_size,
    })
}

/// One worker per core, minus one core left for the rest of the machine.
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Reads a shell-style env file (`KEY=value`, `export` prefixes, quoting and
/// comments tolerated). A missing file is treated as empty.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
