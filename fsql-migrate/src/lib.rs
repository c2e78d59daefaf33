//! # fsql-migrate
//!
//! Orchestration of annotated SQL migrations.
//!
//! This crate provides:
//! - A line-oriented directive parser that builds a tree of groups and migrations
//! - A dependency graph resolver that canonicalizes references across files and scopes
//! - An organizer that validates the graph and produces an execution order
//! - An execution engine with a bounded pool of isolated contexts for `CONCURRENT` migrations
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ SQL sources  │────▶│ Parser         │────▶│ MigrationGroup   │
//! └──────────────┘     └────────────────┘     └──────────────────┘
//!                                                      │
//!                                                      ▼
//!                      ┌────────────────┐     ┌──────────────────┐
//!                      │ Organizer      │◀────│ DependencyGraph  │
//!                      └────────────────┘     └──────────────────┘
//!                              │
//!                              ▼
//!                      ┌────────────────┐     ┌──────────────────┐
//!                      │ MigrationRunner│────▶│ MigrationExecutor│
//!                      └────────────────┘     └──────────────────┘
//! ```
//!
//! ## Directive language
//!
//! ```sql
//! -- +group: accounts
//! -- +groupdependency: ::../001-base.sql::core
//!
//! -- +migration: create_users
//! --+ Users table
//! -- +tags: transactional
//! CREATE TABLE users (id SERIAL PRIMARY KEY);
//! -- +endmigration
//!
//! -- +migration: users_email_idx
//! -- +tags: concurrent
//! -- +dependency: create_users
//! CREATE INDEX CONCURRENTLY users_email_idx ON users (email);
//! -- +endmigration
//!
//! -- +endgroup
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fsql_migrate::{
//!     DependencyGraph, MigrationError, MigrationExecutor, MigrationRunner, RunnerConfig,
//!     SourceFile, organize_migrations, parse_files,
//! };
//!
//! async fn run(executor: Arc<impl MigrationExecutor>) -> Result<bool, MigrationError> {
//!     let root = parse_files(vec![SourceFile::new("migrations/001-init.sql", "...")]).await?;
//!     let graph = DependencyGraph::build(&root);
//!     let ordered = organize_migrations(&graph, &root).map_err(MigrationError::organize)?;
//!
//!     let runner = MigrationRunner::new(executor, RunnerConfig::new().max_concurrent(4));
//!     Ok(runner.run_migrations(&ordered).await)
//! }
//! ```

pub mod engine;
pub mod error;
pub mod graph;
pub mod model;
pub mod organizer;
pub mod parser;

// Re-exports
pub use engine::{
    DEFAULT_MAX_CONCURRENT, ExecutionMode, ExecutionOutput, MigrationExecutor, MigrationOutcome,
    MigrationRunner, ResultRow, RunReport, RunnerConfig,
};
pub use error::{
    ExecutionError, MigrateResult, MigrationError, OrganizeError, ParseError, ParseResult,
};
pub use graph::{DependencyGraph, DependencySet, join_id, normalize_path};
pub use model::{
    GroupTag, Migration, MigrationEntry, MigrationGroup, MigrationIter, MigrationTag,
    ROOT_GROUP_NAME, SCOPE_SEPARATOR, is_valid_name,
};
pub use organizer::{OrganizedMigration, organize_migrations};
pub use parser::{
    Directive, IN_MEMORY_PATH, SourceFile, parse_content, parse_file, parse_files, parse_sources,
};
