//! CLI configuration handling.
//!
//! Settings come from an optional `fsql.toml`, the process environment
//! (after `.env` is loaded), and command-line flags, in increasing priority.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use fsql_migrate::{DEFAULT_MAX_CONCURRENT, RunnerConfig};
use regex_lite::Regex;
use serde::Deserialize;

use crate::error::{CliError, CliResult};

/// Default config file name (lives in the working directory)
pub const CONFIG_FILE_NAME: &str = "fsql.toml";

/// Default migrations directory (relative to the working directory)
pub const MIGRATIONS_DIR: &str = "migrations";

/// Connection string variable.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Result display flag variable.
pub const SHOW_RESULTS_ENV: &str = "FSQL_SHOW_RESULTS";

static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("braced variable pattern is valid"));

static BARE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Z_][A-Z0-9_]*)").expect("bare variable pattern is valid"));

/// fsql CLI configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Execution engine configuration
    pub runner: RunnerSettings,

    /// Migration source configuration
    pub migrations: MigrationConfig,
}

/// Database configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL, `${VAR}` and `$VAR` are expanded
    pub url: Option<String>,
}

/// Execution engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Maximum simultaneously active isolated contexts
    pub max_concurrent: usize,

    /// Print rows returned by each migration
    pub show_results: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            show_results: false,
        }
    }
}

/// Migration source configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory used by `from-dir` when none is given
    pub directory: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(MIGRATIONS_DIR),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> CliResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load an explicit config file, or `fsql.toml` in `cwd` when present.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file yields the defaults.
    pub fn discover(explicit: Option<&Path>, cwd: &Path) -> CliResult<Self> {
        match explicit {
            Some(path) if !path.is_file() => Err(CliError::Config(format!(
                "config file not found: {}",
                path.display()
            ))),
            Some(path) => Self::load(path),
            None => {
                let default = cwd.join(CONFIG_FILE_NAME);
                if default.is_file() {
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Resolve the connection string.
    ///
    /// The configured URL wins when every variable in it expanded; otherwise
    /// `DATABASE_URL` is used.
    pub fn database_url(&self) -> CliResult<String> {
        if let Some(ref url) = self.database.url {
            let expanded = expand_env_vars(url);
            if !expanded.is_empty() && !expanded.contains("${") {
                return Ok(expanded);
            }
        }

        std::env::var(DATABASE_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                CliError::Config(format!(
                    "Database URL not found. Set {} or configure [database] url in {}",
                    DATABASE_URL_ENV, CONFIG_FILE_NAME
                ))
            })
    }

    /// Whether returned rows are printed: flag, then environment, then file.
    pub fn show_results(&self, flag: bool) -> bool {
        flag || env_flag(SHOW_RESULTS_ENV) || self.runner.show_results
    }

    /// Runner configuration with command-line overrides applied.
    pub fn runner_config(&self, show_results: bool, max_concurrent: Option<usize>) -> RunnerConfig {
        RunnerConfig::new()
            .max_concurrent(max_concurrent.unwrap_or(self.runner.max_concurrent))
            .show_results(self.show_results(show_results))
    }
}

/// Expand `${VAR}` and `$VAR` references; unknown variables stay verbatim.
pub fn expand_env_vars(s: &str) -> String {
    let braced = BRACED_VAR.replace_all(s, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });
    BARE_VAR
        .replace_all(&braced, |caps: &regex_lite::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
