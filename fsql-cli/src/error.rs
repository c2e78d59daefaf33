//! CLI error types and result alias.

use std::path::PathBuf;

use fsql_migrate::{OrganizeError, ParseError};
use fsql_postgres::PgError;
use miette::Diagnostic;
use thiserror::Error;

use crate::discovery::DiscoveryError;

/// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// Exit status for startup failures (bad input, config, parse errors).
pub const EXIT_FATAL: i32 = 1;
/// Exit status when the organizer rejects the dependency graph.
pub const EXIT_INVALID_GRAPH: i32 = 2;
/// Exit status when at least one migration failed to run.
pub const EXIT_MIGRATIONS_FAILED: i32 = 3;

/// CLI error types
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// IO error
    #[error("IO error: {0}")]
    #[diagnostic(code(fsql::io))]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    #[diagnostic(code(fsql::config))]
    Config(String),

    /// A source file given on the command line does not exist
    #[error("File not found: {}", .0.display())]
    #[diagnostic(code(fsql::file_not_found))]
    FileNotFound(PathBuf),

    /// A source file holds no SQL text
    #[error("No SQL content found in file: {}", .0.display())]
    #[diagnostic(code(fsql::empty_file))]
    EmptyFile(PathBuf),

    /// Migration file discovery failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Directive parsing failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),

    /// The dependency graph was rejected
    #[error("Failed to organize migrations: {count} error(s)")]
    #[diagnostic(code(fsql::organize))]
    Organize {
        /// Number of errors.
        count: usize,
        /// Every missing or circular dependency found.
        #[related]
        errors: Vec<OrganizeError>,
    },

    /// Database setup error
    #[error("Database error: {0}")]
    #[diagnostic(code(fsql::database))]
    Database(String),

    /// Some migrations did not complete
    #[error("Some migrations failed: {summary}")]
    #[diagnostic(
        code(fsql::migrations_failed),
        help("check the log output above for the failing SQL and line range")
    )]
    MigrationsFailed {
        /// Run summary.
        summary: String,
    },
}

impl CliError {
    /// Wrap a complete organizer report.
    pub fn organize(errors: Vec<OrganizeError>) -> Self {
        Self::Organize {
            count: errors.len(),
            errors,
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Organize { .. } => EXIT_INVALID_GRAPH,
            Self::MigrationsFailed { .. } => EXIT_MIGRATIONS_FAILED,
            _ => EXIT_FATAL,
        }
    }
}

impl From<toml::de::Error> for CliError {
    fn from(err: toml::de::Error) -> Self {
        CliError::Config(format!("Failed to parse TOML: {}", err))
    }
}

impl From<PgError> for CliError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::Config(msg) => CliError::Config(msg),
            other => CliError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Config("x".into()).exit_code(), EXIT_FATAL);
        assert_eq!(CliError::FileNotFound("a.sql".into()).exit_code(), EXIT_FATAL);
        assert_eq!(
            CliError::organize(vec![OrganizeError::circular("loop", vec![], 3)]).exit_code(),
            EXIT_INVALID_GRAPH
        );
        assert_eq!(
            CliError::MigrationsFailed {
                summary: "0 succeeded, 1 failed, 0 skipped in 3ms".into()
            }
            .exit_code(),
            EXIT_MIGRATIONS_FAILED
        );
    }

    #[test]
    fn test_pg_config_error_is_config() {
        let err: CliError = PgError::config("invalid scheme").into();
        assert!(matches!(err, CliError::Config(_)));
    }
}
