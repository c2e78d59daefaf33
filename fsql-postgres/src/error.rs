//! Error types for PostgreSQL operations.

use fsql_migrate::ExecutionError;
use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur while talking to PostgreSQL.
#[derive(Error, Debug)]
pub enum PgError {
    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Check if this error happened before any SQL reached the server.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Pool(_) | Self::Connection(_) | Self::Config(_) => true,
            Self::Postgres(e) => e.as_db_error().is_none() && e.is_closed(),
        }
    }
}

/// Render a driver error, preferring the server's SQLSTATE and message.
fn describe(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => {
            let mut message = format!("{} ({})", db.message(), db.code().code());
            if let Some(detail) = db.detail() {
                message.push_str(": ");
                message.push_str(detail);
            }
            message
        }
        None => err.to_string(),
    }
}

impl From<PgError> for ExecutionError {
    fn from(err: PgError) -> Self {
        if err.is_connection_error() {
            return ExecutionError::connection(err.to_string());
        }
        match err {
            PgError::Postgres(e) => ExecutionError::query(describe(&e)),
            other => ExecutionError::query(other.to_string()),
        }
    }
}
