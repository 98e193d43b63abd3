use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration value out of range: {0}")]
    Invalid(&'static str),
}

/// Mode of operation selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Extract rows from each procedure's table into spool files.
    Extract,
    /// Invoke each procedure as an insert routine.
    Insert,
}

impl Mode {
    pub fn from_flag(raw: &str) -> Option<Self> {
        match raw {
            "E" => Some(Mode::Extract),
            "I" => Some(Mode::Insert),
            _ => None,
        }
    }

    /// Suffix used in log and summary file names.
    pub fn log_suffix(&self) -> &'static str {
        match self {
            Mode::Extract => "extract",
            Mode::Insert => "insert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Delimited,
    Fixed,
}

/// Connection and scheduling configuration (`appCfg`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub db_user: String,
    pub db_password: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_sid: String,
    pub concurrency: usize,
    pub log_path: PathBuf,
    pub sol_list_path: PathBuf,
}

/// Per-run configuration (`runCfg`): which procedures, where output lands,
/// how rows are rendered.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub package_name: String,
    pub procedures: Vec<String>,
    pub spool_output_path: PathBuf,
    pub template_path: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub delimiter: String,
    #[serde(default)]
    pub chunked_procedures: Vec<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
}

fn default_chunk_size() -> u32 {
    5000
}

impl RunConfig {
    pub fn is_chunked(&self, procedure: &str) -> bool {
        self.chunked_procedures.iter().any(|p| p == procedure)
    }
}

pub fn load_app_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: AppConfig = serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if cfg.concurrency == 0 {
        return Err(ConfigError::Invalid("concurrency must be at least 1"));
    }
    Ok(cfg)
}

pub fn load_run_config(path: &Path) -> Result<RunConfig, ConfigError> {
    let raw = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: RunConfig = serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if cfg.procedures.is_empty() {
        return Err(ConfigError::Invalid("procedures must not be empty"));
    }
    if cfg.chunk_size == 0 {
        return Err(ConfigError::Invalid("chunk_size must be at least 1"));
    }
    for chunked in &cfg.chunked_procedures {
        if !cfg.procedures.iter().any(|p| p == chunked) {
            warn!(procedure = %chunked, "chunked procedure is not in the procedure list");
        }
    }
    Ok(cfg)
}

/// Reads the SOL ID list: one identifier per line, empty lines ignored.
pub fn read_sol_list(path: &Path) -> Result<Vec<String>, ConfigError> {
    let file = fs::File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut sols = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            sols.push(trimmed.to_string());
        }
    }
    Ok(sols)
}
