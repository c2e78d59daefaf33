//! # fsql
//!
//! Dependency-ordered, concurrency-aware runner for annotated SQL migrations.
//!
//! fsql provides:
//! - A directive language embedded in SQL comments for migrations, groups,
//!   dependencies, and tags
//! - Cross-file dependency resolution with canonical, path-qualified IDs
//! - Validation that reports every missing or circular dependency at once
//! - An execution engine that runs `CONCURRENT` migrations in isolated
//!   contexts with bounded parallelism and graceful drain on failure
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fsql::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sources = vec![SourceFile::new(
//!         "migrations/001-users.sql",
//!         std::fs::read_to_string("migrations/001-users.sql")?,
//!     )];
//!     let root = parse_files(sources).await?;
//!     let graph = DependencyGraph::build_with_base(&root, "migrations");
//!     let ordered = organize_migrations(&graph, &root).map_err(MigrationError::organize)?;
//!
//!     let executor = Arc::new(PgExecutor::from_url("postgresql://localhost/app")?);
//!     let runner = MigrationRunner::new(executor, RunnerConfig::new());
//!     let report = runner.run(&ordered).await;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// Parsing, dependency resolution, ordering, and execution.
pub mod migrate {
    pub use fsql_migrate::*;
}

/// PostgreSQL executor and connection pooling.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use fsql_postgres::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::migrate::{
        DependencyGraph, ExecutionError, MigrationError, MigrationExecutor, MigrationGroup,
        MigrationRunner, OrganizeError, OrganizedMigration, ParseError, RunReport, RunnerConfig,
        SourceFile, organize_migrations, parse_files, parse_sources,
    };

    #[cfg(feature = "postgres")]
    pub use crate::postgres::{PgConfig, PgExecutor};
}

// Re-export key types at the crate root
pub use fsql_migrate::{MigrationError, MigrationRunner, RunReport};
