//! CLI command implementations.
//!
//! Both commands share the same back half: parse, resolve, organize, and
//! execute. They differ only in how source files are gathered.

pub mod from_dir;
pub mod from_file;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use fsql_migrate::{
    DependencyGraph, ExecutionMode, MigrationRunner, RunReport, SourceFile, organize_migrations,
    parse_files,
};
use fsql_postgres::{PgConfig, PgExecutor};
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::config::Config;
use crate::error::{CliError, CliResult};
use crate::output;

/// Numbered, timed progress through the pipeline stages.
pub struct Stages {
    current: usize,
    total: usize,
}

impl Stages {
    /// Create a counter for `total` stages.
    pub fn new(total: usize) -> Self {
        Self { current: 0, total }
    }

    /// Run a synchronous stage.
    pub fn run<T>(&mut self, name: &str, stage: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = stage();
        self.finish(name, start);
        out
    }

    /// Run an asynchronous stage.
    pub async fn run_async<T>(&mut self, name: &str, stage: impl Future<Output = T>) -> T {
        let start = Instant::now();
        let out = stage.await;
        self.finish(name, start);
        out
    }

    fn finish(&mut self, name: &str, start: Instant) {
        self.current += 1;
        let duration_ms = start.elapsed().as_millis() as i64;
        info!(stage = name, duration_ms, "stage complete");
        output::step(self.current, self.total, name, duration_ms);
    }
}

/// Parse, organize, and run `sources` against the configured database.
pub async fn run_sources(
    sources: Vec<SourceFile>,
    base_dir: Option<String>,
    config: &Config,
    args: &RunArgs,
    stages: &mut Stages,
) -> CliResult<()> {
    let root = stages
        .run_async("Parsing directives", parse_files(sources))
        .await?;

    let graph = stages.run("Resolving dependencies", || match base_dir {
        Some(base) => DependencyGraph::build_with_base(&root, base),
        None => DependencyGraph::build(&root),
    });

    let ordered = stages
        .run("Organizing migrations", || organize_migrations(&graph, &root))
        .map_err(CliError::organize)?;

    output::kv("Migrations", &ordered.len().to_string());
    output::kv("Dependencies", &graph.edge_count().to_string());

    let url = config.database_url()?;
    let runner_config = config.runner_config(args.show_results, args.max_concurrent);
    let executor = PgExecutor::new(PgConfig::from_url(&url)?)?;
    output::kv("Database", &executor.pool().config().display_target());
    output::kv("Max concurrent", &runner_config.max_concurrent.to_string());
    output::newline();

    let runner = MigrationRunner::new(Arc::new(executor), runner_config);
    let report = stages
        .run_async("Executing migrations", runner.run(&ordered))
        .await;
    runner.executor().pool().close();

    print_report(&report, runner.config().show_results);

    output::newline();
    if report.is_success() {
        output::success(&format!(
            "All migrations ran successfully ({})",
            report.summary()
        ));
        Ok(())
    } else {
        Err(CliError::MigrationsFailed {
            summary: report.summary(),
        })
    }
}

fn print_report(report: &RunReport, show_results: bool) {
    output::newline();
    for outcome in &report.outcomes {
        let label = match outcome.mode {
            ExecutionMode::Sequential => format!("{} ({}ms)", outcome.id, outcome.duration_ms),
            ExecutionMode::Isolated => {
                format!("{} ({}ms, concurrent)", outcome.id, outcome.duration_ms)
            }
        };
        match &outcome.result {
            Ok(result) => {
                output::list_item(&label);
                if show_results {
                    for row in &result.rows {
                        match serde_json::to_string(row) {
                            Ok(json) => output::code(&json),
                            Err(e) => warn!(migration = %outcome.id, error = %e, "unprintable row"),
                        }
                    }
                }
            }
            Err(err) if err.is_aborted() => output::dim(&format!("  - {} (not started)", outcome.id)),
            Err(err) => output::failed_item(&format!("{}: {}", label, err)),
        }
    }
    for id in &report.skipped {
        output::dim(&format!("  - {} (skipped)", id));
    }
}
