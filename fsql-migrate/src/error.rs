//! Error types for parsing, organizing, and executing migrations.

// These warnings are false positives - the fields are used by derive macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Result type alias for directive parsing.
pub type ParseResult<T> = Result<T, ParseError>;

/// Errors raised while reading directive structure out of SQL text.
///
/// Every variant is fatal: a run with a parse error never reaches the
/// dependency graph.
#[derive(Debug, Error, Diagnostic)]
pub enum ParseError {
    /// A `+migration` directive appeared while another migration was open.
    #[error("Nested migration found: {name} ({file}:{line})")]
    #[diagnostic(code(fsql::parse::nested_migration))]
    NestedMigration {
        name: String,
        file: String,
        line: usize,
    },

    /// A `+endmigration` directive appeared with no open migration.
    #[error("Unexpected endmigration found ({file}:{line})")]
    #[diagnostic(code(fsql::parse::unexpected_endmigration))]
    UnexpectedEndMigration { file: String, line: usize },

    /// A `+endgroup` directive appeared with no open group.
    #[error("Unexpected endgroup found ({file}:{line})")]
    #[diagnostic(code(fsql::parse::unexpected_endgroup))]
    UnexpectedEndGroup { file: String, line: usize },

    /// A `+group` directive appeared inside an open migration.
    #[error("Group '{name}' cannot start inside migration '{migration}' ({file}:{line})")]
    #[diagnostic(code(fsql::parse::group_inside_migration))]
    GroupInsideMigration {
        name: String,
        migration: String,
        file: String,
        line: usize,
    },

    /// A `+endgroup` directive appeared while a migration was still open.
    #[error("Group '{group}' closed while migration '{migration}' is still open ({file}:{line})")]
    #[diagnostic(code(fsql::parse::group_closed_over_migration))]
    GroupClosedOverMigration {
        group: String,
        migration: String,
        file: String,
        line: usize,
    },

    /// End of input reached with an open migration.
    #[error("File ended while inside migration: '{name}' in {file}")]
    #[diagnostic(
        code(fsql::parse::unclosed_migration),
        help("add `-- +endmigration` after the migration opened at line {line}")
    )]
    UnclosedMigration {
        name: String,
        file: String,
        line: usize,
    },

    /// End of input reached with an open group.
    #[error("File ended while inside group: '{name}' in {file}")]
    #[diagnostic(
        code(fsql::parse::unclosed_group),
        help("add `-- +endgroup` after the group opened at line {line}")
    )]
    UnclosedGroup {
        name: String,
        file: String,
        line: usize,
    },

    /// A scoped directive appeared with no migration or group to attach to.
    #[error("'+{directive}' used without an open migration or group ({file}:{line})")]
    #[diagnostic(code(fsql::parse::directive_without_scope))]
    DirectiveWithoutScope {
        directive: String,
        file: String,
        line: usize,
    },

    /// A `+tags` directive named a tag outside the known vocabulary.
    #[error("Unknown tag '{tag}' ({file}:{line})")]
    #[diagnostic(
        code(fsql::parse::unknown_tag),
        help("known tags are `concurrent` and `transactional`")
    )]
    UnknownTag {
        tag: String,
        file: String,
        line: usize,
    },

    /// A migration or group name does not match `[A-Za-z_][A-Za-z0-9_-]*`.
    #[error("Invalid {kind} name '{name}' ({file}:{line})")]
    #[diagnostic(code(fsql::parse::invalid_name))]
    InvalidName {
        kind: &'static str,
        name: String,
        file: String,
        line: usize,
    },

    /// Two migrations with the same name in one scope.
    #[error("Duplicate migration '{name}' in scope '{scope}' ({file}:{line})")]
    #[diagnostic(code(fsql::parse::duplicate_migration))]
    DuplicateMigration {
        name: String,
        scope: String,
        file: String,
        line: usize,
    },

    /// Two sibling groups (or two files) with the same name.
    #[error("Duplicate group '{name}' in scope '{scope}' ({file}:{line})")]
    #[diagnostic(code(fsql::parse::duplicate_group))]
    DuplicateGroup {
        name: String,
        scope: String,
        file: String,
        line: usize,
    },

    /// A parsing task on the blocking pool did not complete.
    #[error("Parser task for {file} failed: {message}")]
    #[diagnostic(code(fsql::parse::task_failed))]
    TaskFailed { file: String, message: String },
}

impl ParseError {
    /// The file the error originated from.
    pub fn file(&self) -> &str {
        match self {
            Self::NestedMigration { file, .. }
            | Self::UnexpectedEndMigration { file, .. }
            | Self::UnexpectedEndGroup { file, .. }
            | Self::GroupInsideMigration { file, .. }
            | Self::GroupClosedOverMigration { file, .. }
            | Self::UnclosedMigration { file, .. }
            | Self::UnclosedGroup { file, .. }
            | Self::DirectiveWithoutScope { file, .. }
            | Self::UnknownTag { file, .. }
            | Self::InvalidName { file, .. }
            | Self::DuplicateMigration { file, .. }
            | Self::DuplicateGroup { file, .. }
            | Self::TaskFailed { file, .. } => file,
        }
    }

    /// The 1-based line the error points at, when there is one.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::NestedMigration { line, .. }
            | Self::UnexpectedEndMigration { line, .. }
            | Self::UnexpectedEndGroup { line, .. }
            | Self::GroupInsideMigration { line, .. }
            | Self::GroupClosedOverMigration { line, .. }
            | Self::UnclosedMigration { line, .. }
            | Self::UnclosedGroup { line, .. }
            | Self::DirectiveWithoutScope { line, .. }
            | Self::UnknownTag { line, .. }
            | Self::InvalidName { line, .. }
            | Self::DuplicateMigration { line, .. }
            | Self::DuplicateGroup { line, .. } => Some(*line),
            Self::TaskFailed { .. } => None,
        }
    }
}

/// A validation problem found by the organizer.
///
/// These are collected rather than returned one at a time so that a single
/// run can report every broken reference.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum OrganizeError {
    /// A dependency points at an ID that no migration or group has.
    #[error("{message} at line {line}")]
    #[diagnostic(code(fsql::organize::missing))]
    Missing {
        message: String,
        /// The unresolved target.
        dependency: String,
        /// The migration or group that declared the dependency.
        dependent_id: String,
        line: usize,
    },

    /// A dependency loop, including degenerate self and own-group loops.
    #[error("{message} at line {line}")]
    #[diagnostic(code(fsql::organize::circular))]
    Circular {
        message: String,
        cycle: Vec<String>,
        line: usize,
    },
}

impl OrganizeError {
    /// Create a missing-dependency error.
    pub fn missing(
        message: impl Into<String>,
        dependency: impl Into<String>,
        dependent_id: impl Into<String>,
        line: usize,
    ) -> Self {
        Self::Missing {
            message: message.into(),
            dependency: dependency.into(),
            dependent_id: dependent_id.into(),
            line,
        }
    }

    /// Create a circular-dependency error.
    pub fn circular(message: impl Into<String>, cycle: Vec<String>, line: usize) -> Self {
        Self::Circular {
            message: message.into(),
            cycle,
            line,
        }
    }

    /// Check if this is a missing-dependency error.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }

    /// Check if this is a circular-dependency error.
    pub fn is_circular(&self) -> bool {
        matches!(self, Self::Circular { .. })
    }

    /// Source line of the dependent (0 for aggregate errors).
    pub fn line(&self) -> usize {
        match self {
            Self::Missing { line, .. } | Self::Circular { line, .. } => *line,
        }
    }

    /// Human readable message without the line suffix.
    pub fn message(&self) -> &str {
        match self {
            Self::Missing { message, .. } | Self::Circular { message, .. } => message,
        }
    }
}

/// Failure of a single migration during execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// A database connection could not be acquired.
    #[error("connection error: {0}")]
    Connection(String),

    /// The database rejected the migration SQL.
    #[error("query error: {0}")]
    Query(String),

    /// The migration has no SQL to run.
    #[error("migration '{0}' has no SQL content")]
    EmptySql(String),

    /// The run was aborted before this migration started.
    #[error("migration '{0}' was not started because the run was aborted")]
    Aborted(String),

    /// An isolated execution context exited without reporting a result.
    #[error("execution context for '{0}' exited without reporting a result")]
    ContextLost(String),
}

impl ExecutionError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a query error.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Check if the migration never reached the database.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// Top-level errors of the migration pipeline.
#[derive(Debug, Error, Diagnostic)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(fsql::io))]
    Io(#[from] std::io::Error),

    /// Directive structure could not be parsed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),

    /// The dependency graph failed validation.
    #[error("migration organization failed with {count} error(s)")]
    #[diagnostic(code(fsql::organize::failed))]
    Organize {
        count: usize,
        #[related]
        errors: Vec<OrganizeError>,
    },

    /// Invalid migration definition.
    #[error("Invalid migration: {0}")]
    #[diagnostic(code(fsql::invalid_migration))]
    InvalidMigration(String),

    /// General migration error.
    #[error("Migration error: {0}")]
    #[diagnostic(code(fsql::other))]
    Other(String),
}

impl MigrationError {
    /// Create an invalid migration error.
    pub fn invalid_migration(msg: impl Into<String>) -> Self {
        Self::InvalidMigration(msg.into())
    }

    /// Wrap collected organizer errors.
    pub fn organize(errors: Vec<OrganizeError>) -> Self {
        Self::Organize {
            count: errors.len(),
            errors,
        }
    }

    /// Create an other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::UnclosedMigration {
            name: "unclosed_migration".to_string(),
            file: "in-memory".to_string(),
            line: 2,
        };
        assert_eq!(
            err.to_string(),
            "File ended while inside migration: 'unclosed_migration' in in-memory"
        );
        assert_eq!(err.file(), "in-memory");
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn test_unexpected_endmigration_display() {
        let err = ParseError::UnexpectedEndMigration {
            file: "a.sql".to_string(),
            line: 7,
        };
        assert!(err.to_string().starts_with("Unexpected endmigration found"));
    }

    #[test]
    fn test_organize_error_kinds() {
        let missing = OrganizeError::missing("m depends on missing x", "x", "m", 3);
        assert!(missing.is_missing());
        assert_eq!(missing.line(), 3);
        assert_eq!(missing.to_string(), "m depends on missing x at line 3");

        let circular = OrganizeError::circular("loop", vec!["a".into(), "b".into()], 0);
        assert!(circular.is_circular());
        assert_eq!(circular.message(), "loop");
    }

    #[test]
    fn test_execution_error_kinds() {
        assert!(ExecutionError::connection("refused").is_connection_error());
        assert!(!ExecutionError::query("syntax").is_connection_error());
        assert!(ExecutionError::Aborted("m".into()).is_aborted());
    }

    #[test]
    fn test_organize_wrapper_counts() {
        let err = MigrationError::organize(vec![
            OrganizeError::missing("a", "x", "a", 1),
            OrganizeError::missing("b", "y", "b", 2),
        ]);
        assert!(err.to_string().contains("2 error(s)"));
    }
}
