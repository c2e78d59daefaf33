//! Integration tests for running organized migrations through the execution
//! engine with an in-memory executor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fsql::migrate::{
    DependencyGraph, ExecutionError, ExecutionMode, ExecutionOutput, MigrationExecutor,
    MigrationRunner, OrganizedMigration, ResultRow, RunnerConfig, SourceFile, organize_migrations,
    parse_sources,
};
use pretty_assertions::assert_eq;

/// Records every call and fails any migration whose SQL contains `FAIL`.
#[derive(Default)]
struct RecordingExecutor {
    log: Mutex<Vec<(String, ExecutionMode)>>,
}

impl RecordingExecutor {
    fn record(&self, migration: &OrganizedMigration, mode: ExecutionMode) {
        self.log
            .lock()
            .unwrap()
            .push((migration.name().to_string(), mode));
    }

    fn names(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    fn isolated(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, mode)| *mode == ExecutionMode::Isolated)
            .map(|(n, _)| n.clone())
            .collect()
    }

    fn respond(migration: &OrganizedMigration) -> Result<ExecutionOutput, ExecutionError> {
        let sql = migration.migration.sql();
        if sql.contains("FAIL") {
            return Err(ExecutionError::query(format!("syntax error in {}", migration.id)));
        }
        let mut row = ResultRow::new();
        row.insert("name".to_string(), Some(migration.name().to_string()));
        Ok(ExecutionOutput {
            rows: vec![row],
            rows_affected: 1,
        })
    }
}

#[async_trait]
impl MigrationExecutor for RecordingExecutor {
    async fn execute(
        &self,
        migration: &OrganizedMigration,
    ) -> Result<ExecutionOutput, ExecutionError> {
        self.record(migration, ExecutionMode::Sequential);
        Self::respond(migration)
    }

    async fn execute_isolated(
        &self,
        migration: &OrganizedMigration,
    ) -> Result<ExecutionOutput, ExecutionError> {
        self.record(migration, ExecutionMode::Isolated);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Self::respond(migration)
    }
}

fn organize(content: &str) -> Vec<OrganizedMigration> {
    let root = parse_sources(&[SourceFile::new("db/001-app.sql", content)]).unwrap();
    let graph = DependencyGraph::build(&root);
    organize_migrations(&graph, &root).unwrap()
}

const APP: &str = "\
-- +migration: accounts
CREATE TABLE accounts (id SERIAL PRIMARY KEY, owner TEXT);
-- +endmigration

-- +migration: accounts_owner_idx
-- +tags: concurrent
-- +dependency: accounts
CREATE INDEX CONCURRENTLY accounts_owner_idx ON accounts (owner);
-- +endmigration

-- +migration: invoices
-- +dependency: accounts
CREATE TABLE invoices (id SERIAL PRIMARY KEY, account_id INT);
-- +endmigration

-- +migration: invoices_account_idx
-- +tags: concurrent
-- +dependency: invoices
CREATE INDEX CONCURRENTLY invoices_account_idx ON invoices (account_id);
-- +endmigration
";

#[tokio::test]
async fn test_run_parsed_tree() {
    let ordered = organize(APP);
    let executor = Arc::new(RecordingExecutor::default());
    let runner = MigrationRunner::new(Arc::clone(&executor), RunnerConfig::new());

    let report = runner.run(&ordered).await;

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(
        executor.isolated(),
        vec!["accounts_owner_idx", "invoices_account_idx"]
    );
    let names = executor.names();
    assert_eq!(names[0], "accounts");
    assert!(names.contains(&"invoices".to_string()));
    assert!(report.summary().starts_with("4 succeeded, 0 failed, 0 skipped"));
}

#[tokio::test]
async fn test_rows_are_dropped_unless_requested() {
    let ordered = organize(APP);
    let executor = Arc::new(RecordingExecutor::default());

    let quiet = MigrationRunner::new(Arc::clone(&executor), RunnerConfig::new());
    let report = quiet.run(&ordered).await;
    assert!(report.outcomes.iter().all(|o| o.rows().is_empty()));

    let verbose = MigrationRunner::new(executor, RunnerConfig::new().show_results(true));
    let report = verbose.run(&ordered).await;
    let accounts = report
        .outcome("root::db/001-app.sql::accounts")
        .unwrap();
    assert_eq!(
        accounts.rows()[0].get("name"),
        Some(&Some("accounts".to_string()))
    );
}

#[tokio::test]
async fn test_failure_halts_later_sequential_work() {
    let content = "\
-- +migration: first
SELECT FAIL;
-- +endmigration
-- +migration: second
SELECT 2;
-- +endmigration
";
    let ordered = organize(content);
    let executor = Arc::new(RecordingExecutor::default());
    let runner = MigrationRunner::new(Arc::clone(&executor), RunnerConfig::new());

    assert!(!runner.run_migrations(&ordered).await);
    assert_eq!(executor.names(), vec!["first"]);
}

#[tokio::test]
async fn test_concurrent_failure_is_reported_after_drain() {
    let content = "\
-- +migration: base
SELECT 1;
-- +endmigration
-- +migration: broken_idx
-- +tags: concurrent
-- +dependency: base
CREATE INDEX CONCURRENTLY FAIL;
-- +endmigration
-- +migration: fine_idx
-- +tags: concurrent
-- +dependency: base
CREATE INDEX CONCURRENTLY fine_idx ON t (c);
-- +endmigration
";
    let ordered = organize(content);
    let executor = Arc::new(RecordingExecutor::default());
    let runner = MigrationRunner::new(
        Arc::clone(&executor),
        RunnerConfig::new().max_concurrent(2),
    );

    let report = runner.run(&ordered).await;

    assert!(!report.is_success());
    let failed: Vec<&str> = report.failed().map(|o| o.name.as_str()).collect();
    assert!(failed.contains(&"broken_idx"));
    // Every dispatched context reported back before run() returned.
    assert_eq!(
        report.outcomes.len() + report.skipped.len(),
        ordered.len()
    );
}

#[tokio::test]
async fn test_empty_run_is_not_success() {
    let runner = MigrationRunner::new(
        Arc::new(RecordingExecutor::default()),
        RunnerConfig::default(),
    );
    assert!(!runner.run_migrations(&[]).await);
}
