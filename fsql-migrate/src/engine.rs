//! Migration execution engine.
//!
//! Migrations run in organizer order on the calling task. Those tagged
//! `CONCURRENT` are handed to isolated execution contexts instead: each is a
//! spawned task with its own connection, a one-shot start signal, a one-shot
//! result channel and a clone of the run's abort token. At most
//! [`RunnerConfig::max_concurrent`] contexts are alive at once.
//!
//! The first failure cancels the abort token. Nothing new is dispatched after
//! that, contexts that have not started yet stand down, and contexts already
//! running finish their query. The runner always waits for every dispatched
//! context before returning.

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ExecutionError;
use crate::organizer::OrganizedMigration;

/// Default number of simultaneously active isolated execution contexts.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// A row returned by a migration, column name to text value.
pub type ResultRow = IndexMap<String, Option<String>>;

/// What a migration returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Rows produced by the statement batch.
    pub rows: Vec<ResultRow>,
    /// Rows affected across all statements.
    pub rows_affected: u64,
}

/// Executes migration SQL against a database.
#[async_trait::async_trait]
pub trait MigrationExecutor: Send + Sync + 'static {
    /// Execute on a shared, pooled connection.
    async fn execute(&self, migration: &OrganizedMigration) -> Result<ExecutionOutput, ExecutionError>;

    /// Execute on a connection owned by a single isolated context.
    async fn execute_isolated(
        &self,
        migration: &OrganizedMigration,
    ) -> Result<ExecutionOutput, ExecutionError> {
        self.execute(migration).await
    }
}

/// Configuration for the migration runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Maximum number of simultaneously active isolated contexts.
    pub max_concurrent: usize,
    /// Whether returned rows are kept for display.
    pub show_results: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            show_results: false,
        }
    }
}

impl RunnerConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolated context capacity (at least 1).
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Keep returned rows in the report.
    pub fn show_results(mut self, show: bool) -> Self {
        self.show_results = show;
        self
    }
}

/// Where a migration ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Isolated,
}

/// Result of a single migration.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub id: String,
    pub name: String,
    pub mode: ExecutionMode,
    pub duration_ms: i64,
    pub result: Result<ExecutionOutput, ExecutionError>,
}

impl MigrationOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Rows returned, if the migration succeeded.
    pub fn rows(&self) -> &[ResultRow] {
        match &self.result {
            Ok(output) => &output.rows,
            Err(_) => &[],
        }
    }
}

/// Result of a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Outcomes in completion order.
    pub outcomes: Vec<MigrationOutcome>,
    /// IDs never dispatched because the run aborted.
    pub skipped: Vec<String>,
    /// Total duration in milliseconds.
    pub duration_ms: i64,
}

impl RunReport {
    /// True only if something ran and nothing failed or was skipped.
    pub fn is_success(&self) -> bool {
        !self.outcomes.is_empty()
            && self.skipped.is_empty()
            && self.outcomes.iter().all(MigrationOutcome::is_success)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &MigrationOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &MigrationOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Look up the outcome of a migration by canonical ID.
    pub fn outcome(&self, id: &str) -> Option<&MigrationOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// Get a summary of the run.
    pub fn summary(&self) -> String {
        if self.outcomes.is_empty() && self.skipped.is_empty() {
            return "No migrations run".to_string();
        }

        let mut parts = vec![format!("{} succeeded", self.succeeded().count())];
        let failed = self.failed().count();
        if failed > 0 {
            parts.push(format!("{failed} failed"));
        }
        if !self.skipped.is_empty() {
            parts.push(format!("{} skipped", self.skipped.len()));
        }
        format!("{} in {}ms", parts.join(", "), self.duration_ms)
    }
}

/// Runs organized migrations through a [`MigrationExecutor`].
pub struct MigrationRunner<E: MigrationExecutor> {
    executor: Arc<E>,
    config: RunnerConfig,
}

impl<E: MigrationExecutor> MigrationRunner<E> {
    /// Create a new runner.
    pub fn new(executor: Arc<E>, config: RunnerConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Run every migration and report whether all of them succeeded.
    ///
    /// An empty list is a failure.
    pub async fn run_migrations(&self, migrations: &[OrganizedMigration]) -> bool {
        self.run(migrations).await.is_success()
    }

    /// Run every migration in order and collect the outcomes.
    pub async fn run(&self, migrations: &[OrganizedMigration]) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport::default();

        if migrations.is_empty() {
            warn!("no migrations to run");
            return report;
        }

        let abort = CancellationToken::new();
        let mut pool = ContextPool::new(self.config.max_concurrent, abort.clone());

        for (index, migration) in migrations.iter().enumerate() {
            pool.collect_finished(&mut report);

            let dispatched = if abort.is_cancelled() {
                false
            } else if migration.migration.is_concurrent() {
                pool.dispatch(
                    Arc::clone(&self.executor),
                    migration,
                    self.config.show_results,
                    &mut report,
                )
                .await
            } else {
                let outcome = self.run_migration(migration).await;
                if !outcome.is_success() {
                    abort.cancel();
                }
                report.outcomes.push(outcome);
                true
            };

            if !dispatched {
                info!(
                    remaining = migrations.len() - index,
                    "run aborted, not dispatching remaining migrations"
                );
                report.skipped.extend(migrations[index..].iter().map(|m| m.id.clone()));
                break;
            }
        }

        pool.drain(&mut report).await;
        report.duration_ms = start.elapsed().as_millis() as i64;

        if report.is_success() {
            info!(summary = %report.summary(), "all migrations completed");
        } else {
            warn!(summary = %report.summary(), "migration run failed");
        }
        report
    }

    /// Run a single migration on the pooled path.
    pub async fn run_migration(&self, migration: &OrganizedMigration) -> MigrationOutcome {
        info!(migration = %migration.id, "executing migration");
        let started = Instant::now();
        let result = execute_checked(self.executor.as_ref(), migration, ExecutionMode::Sequential)
            .await
            .map(|output| keep_rows(output, self.config.show_results));

        finish(migration, ExecutionMode::Sequential, started, result)
    }
}

async fn execute_checked<E: MigrationExecutor>(
    executor: &E,
    migration: &OrganizedMigration,
    mode: ExecutionMode,
) -> Result<ExecutionOutput, ExecutionError> {
    if migration.migration.sql().trim().is_empty() {
        return Err(ExecutionError::EmptySql(migration.id.clone()));
    }
    match mode {
        ExecutionMode::Sequential => executor.execute(migration).await,
        ExecutionMode::Isolated => executor.execute_isolated(migration).await,
    }
}

fn keep_rows(mut output: ExecutionOutput, show_results: bool) -> ExecutionOutput {
    if !show_results {
        output.rows.clear();
    }
    output
}

fn finish(
    migration: &OrganizedMigration,
    mode: ExecutionMode,
    started: Instant,
    result: Result<ExecutionOutput, ExecutionError>,
) -> MigrationOutcome {
    let duration_ms = started.elapsed().as_millis() as i64;
    match &result {
        Ok(_) => info!(migration = %migration.id, duration_ms, "migration completed"),
        Err(err) => report_failure(migration, err),
    }
    MigrationOutcome {
        id: migration.id.clone(),
        name: migration.name().to_string(),
        mode,
        duration_ms,
        result,
    }
}

fn report_failure(migration: &OrganizedMigration, err: &ExecutionError) {
    let m = &migration.migration;
    match err {
        ExecutionError::Aborted(_) => {
            info!(migration = %migration.id, "migration not started, run aborted");
        }
        ExecutionError::Connection(_) => {
            error!(
                migration = %migration.id,
                name = m.name(),
                error = %err,
                "failed to connect to the database"
            );
        }
        _ => {
            error!(
                migration = %migration.id,
                name = m.name(),
                lines = %m.line_range(),
                sql = m.sql(),
                error = %err,
                "migration failed"
            );
        }
    }
}

struct ContextReport {
    duration_ms: i64,
    result: Result<ExecutionOutput, ExecutionError>,
}

struct PendingContext {
    id: String,
    name: String,
    result: oneshot::Receiver<ContextReport>,
}

/// Isolated execution contexts owned by the coordinating task.
struct ContextPool {
    capacity: usize,
    abort: CancellationToken,
    contexts: JoinSet<()>,
    pending: Vec<PendingContext>,
}

impl ContextPool {
    fn new(capacity: usize, abort: CancellationToken) -> Self {
        Self {
            capacity: capacity.max(1),
            abort,
            contexts: JoinSet::new(),
            pending: Vec::new(),
        }
    }

    /// Spawn a context for `migration`, waiting for capacity first.
    ///
    /// Returns false if the run aborted while waiting.
    async fn dispatch<E: MigrationExecutor>(
        &mut self,
        executor: Arc<E>,
        migration: &OrganizedMigration,
        show_results: bool,
        report: &mut RunReport,
    ) -> bool {
        while self.contexts.len() >= self.capacity {
            debug!(active = self.contexts.len(), "context pool at capacity");
            self.join_one().await;
            self.collect_finished(report);
        }
        if self.abort.is_cancelled() {
            return false;
        }

        let (start_tx, start_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();

        self.contexts.spawn(run_context(
            executor,
            migration.clone(),
            show_results,
            self.abort.clone(),
            start_rx,
            result_tx,
        ));
        self.pending.push(PendingContext {
            id: migration.id.clone(),
            name: migration.name().to_string(),
            result: result_rx,
        });

        debug!(migration = %migration.id, active = self.contexts.len(), "dispatched isolated context");
        if start_tx.send(()).is_err() {
            warn!(migration = %migration.id, "isolated context exited before start");
        }
        true
    }

    async fn join_one(&mut self) {
        if let Some(Err(err)) = self.contexts.join_next().await {
            error!(error = %err, "isolated context terminated abnormally");
        }
    }

    /// Record results of contexts that have reported, without waiting.
    fn collect_finished(&mut self, report: &mut RunReport) {
        for mut context in std::mem::take(&mut self.pending) {
            let (duration_ms, result) = match context.result.try_recv() {
                Ok(done) => (done.duration_ms, done.result),
                Err(TryRecvError::Empty) => {
                    self.pending.push(context);
                    continue;
                }
                Err(TryRecvError::Closed) => {
                    error!(migration = %context.id, "isolated context exited without reporting");
                    (0, Err(ExecutionError::ContextLost(context.id.clone())))
                }
            };

            if result.is_err() {
                self.abort.cancel();
            }
            report.outcomes.push(MigrationOutcome {
                id: context.id,
                name: context.name,
                mode: ExecutionMode::Isolated,
                duration_ms,
                result,
            });
        }
    }

    /// Wait for every dispatched context to exit and record its result.
    async fn drain(&mut self, report: &mut RunReport) {
        if !self.contexts.is_empty() {
            debug!(active = self.contexts.len(), "draining isolated contexts");
        }
        while !self.contexts.is_empty() {
            self.join_one().await;
        }
        self.collect_finished(report);
    }
}

/// Body of an isolated execution context.
async fn run_context<E: MigrationExecutor>(
    executor: Arc<E>,
    migration: OrganizedMigration,
    show_results: bool,
    abort: CancellationToken,
    start: oneshot::Receiver<()>,
    result: oneshot::Sender<ContextReport>,
) {
    let started = Instant::now();

    let outcome = if start.await.is_err() || abort.is_cancelled() {
        Err(ExecutionError::Aborted(migration.id.clone()))
    } else {
        info!(migration = %migration.id, "executing migration in isolated context");
        execute_checked(executor.as_ref(), &migration, ExecutionMode::Isolated)
            .await
            .map(|output| keep_rows(output, show_results))
    };

    if outcome.is_err() && !abort.is_cancelled() {
        abort.cancel();
    }

    let outcome = finish(&migration, ExecutionMode::Isolated, started, outcome);
    let report = ContextReport {
        duration_ms: outcome.duration_ms,
        result: outcome.result,
    };
    if result.send(report).is_err() {
        debug!(migration = %migration.id, "coordinator stopped listening");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Migration, MigrationTag};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedExecutor {
        failing: HashSet<String>,
        delay: Duration,
        calls: Mutex<Vec<String>>,
        isolated: Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn failing(names: &[&str]) -> Self {
            Self {
                failing: names.iter().map(|n| n.to_string()).collect(),
                ..Self::default()
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn isolated_calls(&self) -> Vec<String> {
            self.isolated.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl MigrationExecutor for ScriptedExecutor {
        async fn execute(&self, migration: &OrganizedMigration) -> Result<ExecutionOutput, ExecutionError> {
            self.calls.lock().unwrap().push(migration.name().to_string());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(migration.name()) {
                return Err(ExecutionError::query(format!("{} failed", migration.name())));
            }
            let mut row = ResultRow::new();
            row.insert("name".to_string(), Some(migration.name().to_string()));
            Ok(ExecutionOutput {
                rows: vec![row],
                rows_affected: 1,
            })
        }

        async fn execute_isolated(
            &self,
            migration: &OrganizedMigration,
        ) -> Result<ExecutionOutput, ExecutionError> {
            self.isolated.lock().unwrap().push(migration.name().to_string());
            self.execute(migration).await
        }
    }

    /// Holds every isolated call until released.
    #[derive(Default)]
    struct GatedExecutor {
        started: Mutex<Vec<String>>,
        release: Notify,
    }

    impl GatedExecutor {
        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }

        async fn wait_for(&self, count: usize) {
            while self.started.lock().unwrap().len() < count {
                tokio::task::yield_now().await;
            }
        }
    }

    #[async_trait::async_trait]
    impl MigrationExecutor for GatedExecutor {
        async fn execute(&self, _migration: &OrganizedMigration) -> Result<ExecutionOutput, ExecutionError> {
            Ok(ExecutionOutput::default())
        }

        async fn execute_isolated(
            &self,
            migration: &OrganizedMigration,
        ) -> Result<ExecutionOutput, ExecutionError> {
            self.started.lock().unwrap().push(migration.name().to_string());
            self.release.notified().await;
            Ok(ExecutionOutput::default())
        }
    }

    struct PanickingExecutor;

    #[async_trait::async_trait]
    impl MigrationExecutor for PanickingExecutor {
        async fn execute(&self, _migration: &OrganizedMigration) -> Result<ExecutionOutput, ExecutionError> {
            panic!("executor blew up");
        }
    }

    fn organized(name: &str, concurrent: bool) -> OrganizedMigration {
        let mut migration = Migration::new("001-a.sql", name, 1, "SELECT 1;", 1).with_end_line(3);
        if concurrent {
            migration = migration.with_tag(MigrationTag::Concurrent);
        }
        OrganizedMigration {
            id: format!("root::001-a.sql::{name}"),
            migration: Arc::new(migration),
            group: "root::001-a.sql".to_string(),
        }
    }

    fn runner(executor: ScriptedExecutor, config: RunnerConfig) -> MigrationRunner<ScriptedExecutor> {
        MigrationRunner::new(Arc::new(executor), config)
    }

    #[test]
    fn test_config_builder() {
        let config = RunnerConfig::new().max_concurrent(0).show_results(true);
        assert_eq!(config.max_concurrent, 1);
        assert!(config.show_results);
        assert_eq!(RunnerConfig::default().max_concurrent, DEFAULT_MAX_CONCURRENT);
    }

    #[test]
    fn test_report_summary() {
        let report = RunReport::default();
        assert!(!report.is_success());
        assert_eq!(report.summary(), "No migrations run");
    }

    #[tokio::test]
    async fn test_empty_run_fails() {
        let runner = runner(ScriptedExecutor::default(), RunnerConfig::default());
        assert!(!runner.run_migrations(&[]).await);
    }

    #[tokio::test]
    async fn test_sequential_in_order() {
        let runner = runner(ScriptedExecutor::default(), RunnerConfig::default());
        let migrations = vec![organized("a", false), organized("b", false), organized("c", false)];

        let report = runner.run(&migrations).await;
        assert!(report.is_success());
        assert_eq!(runner.executor().calls(), vec!["a", "b", "c"]);
        assert_eq!(report.summary().split(" in ").next(), Some("3 succeeded"));
    }

    #[tokio::test]
    async fn test_sequential_failure_stops_walk() {
        let runner = runner(ScriptedExecutor::failing(&["a"]), RunnerConfig::default());
        let migrations = vec![organized("a", false), organized("b", false)];

        let report = runner.run(&migrations).await;
        assert!(!report.is_success());
        assert_eq!(runner.executor().calls(), vec!["a"]);
        assert_eq!(report.skipped, vec!["root::001-a.sql::b".to_string()]);
        assert_eq!(report.failed().count(), 1);
    }

    #[tokio::test]
    async fn test_rows_kept_only_when_requested() {
        let migrations = vec![organized("a", false), organized("b", true)];

        let hidden = runner(ScriptedExecutor::default(), RunnerConfig::default());
        let report = hidden.run(&migrations).await;
        assert!(report.outcomes.iter().all(|o| o.rows().is_empty()));

        let shown = runner(ScriptedExecutor::default(), RunnerConfig::new().show_results(true));
        let report = shown.run(&migrations).await;
        assert!(report.is_success());
        assert!(report.outcomes.iter().all(|o| o.rows().len() == 1));
    }

    #[tokio::test]
    async fn test_capacity_bounds_active_contexts() {
        let executor = ScriptedExecutor::default().with_delay(Duration::from_millis(20));
        let runner = runner(executor, RunnerConfig::new().max_concurrent(2));
        let migrations: Vec<_> = (0..6).map(|i| organized(&format!("c{i}"), true)).collect();

        let report = runner.run(&migrations).await;
        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 6);
        assert!(report.outcomes.iter().all(|o| o.mode == ExecutionMode::Isolated));
        assert_eq!(runner.executor().isolated_calls().len(), 6);
        assert!(runner.executor().max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_concurrent_failure_stops_dispatch() {
        let runner = runner(ScriptedExecutor::failing(&["a"]), RunnerConfig::new().max_concurrent(1));
        let migrations = vec![organized("a", true), organized("b", true), organized("c", false)];

        let report = runner.run(&migrations).await;
        assert!(!report.is_success());
        assert_eq!(runner.executor().calls(), vec!["a"]);
        assert_eq!(
            report.skipped,
            vec!["root::001-a.sql::b".to_string(), "root::001-a.sql::c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_drains_contexts_after_sequential_failure() {
        let executor = ScriptedExecutor::failing(&["seq"]).with_delay(Duration::from_millis(10));
        let runner = runner(executor, RunnerConfig::default());
        let migrations = vec![organized("slow", true), organized("seq", false)];

        let report = runner.run(&migrations).await;
        assert!(!report.is_success());
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcome("root::001-a.sql::slow").is_some());
    }

    #[tokio::test]
    async fn test_empty_sql_fails() {
        let runner = runner(ScriptedExecutor::default(), RunnerConfig::default());
        let migration = OrganizedMigration {
            id: "root::x".to_string(),
            migration: Arc::new(Migration::new("x.sql", "x", 1, "", 1)),
            group: "root".to_string(),
        };
        let outcome = runner.run_migration(&migration).await;
        assert_eq!(outcome.result, Err(ExecutionError::EmptySql("root::x".to_string())));
        assert!(runner.executor().calls().is_empty());
    }

    #[tokio::test]
    async fn test_context_stands_down_after_abort() {
        let executor = Arc::new(ScriptedExecutor::default());
        let abort = CancellationToken::new();
        abort.cancel();
        let (start_tx, start_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        start_tx.send(()).unwrap();

        run_context(
            Arc::clone(&executor),
            organized("late", true),
            false,
            abort,
            start_rx,
            result_tx,
        )
        .await;

        let report = result_rx.await.unwrap();
        assert!(matches!(report.result, Err(ExecutionError::Aborted(_))));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lost_context_is_a_failure() {
        let runner = MigrationRunner::new(Arc::new(PanickingExecutor), RunnerConfig::default());
        let report = runner.run(&[organized("boom", true)]).await;
        assert!(!report.is_success());
        assert!(matches!(
            report.outcomes[0].result,
            Err(ExecutionError::ContextLost(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_a_free_context() {
        let executor = Arc::new(GatedExecutor::default());
        let runner = MigrationRunner::new(Arc::clone(&executor), RunnerConfig::new().max_concurrent(2));
        let migrations = vec![organized("a", true), organized("b", true), organized("c", true)];

        let control = async {
            executor.wait_for(2).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let started = executor.started();
            assert_eq!(started.len(), 2);
            assert!(!started.contains(&"c".to_string()), "c started while both contexts were busy");

            executor.release.notify_one();
            executor.wait_for(3).await;
            assert_eq!(executor.started()[2], "c");
            executor.release.notify_one();
            executor.release.notify_one();
        };

        let (report, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(runner.run(&migrations), control)
        })
        .await
        .expect("run should finish once contexts are released");

        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcomes.iter().all(|o| o.mode == ExecutionMode::Isolated));
    }
}
