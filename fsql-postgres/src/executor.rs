//! [`MigrationExecutor`] backed by PostgreSQL.
//!
//! Sequential migrations share connections from a [`PgPool`]. Each isolated
//! context opens its own connection, so `CONCURRENT` statements such as
//! `CREATE INDEX CONCURRENTLY` never run inside another migration's session.

use async_trait::async_trait;
use fsql_migrate::{
    ExecutionError, ExecutionOutput, MigrationExecutor, OrganizedMigration, ResultRow,
};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, error};

use crate::config::PgConfig;
use crate::error::{PgError, PgResult};
use crate::pool::{PgPool, PoolConfig};

/// Runs migrations over the simple-query protocol.
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    /// Create an executor with a default-sized pool.
    pub fn new(config: PgConfig) -> PgResult<Self> {
        Ok(Self {
            pool: PgPool::new(config)?,
        })
    }

    /// Create an executor with a custom pool configuration.
    pub fn with_pool_config(config: PgConfig, pool_config: PoolConfig) -> PgResult<Self> {
        Ok(Self {
            pool: PgPool::with_pool_config(config, pool_config)?,
        })
    }

    /// Create an executor from a connection URL.
    pub fn from_url(url: &str) -> PgResult<Self> {
        Self::new(PgConfig::from_url(url)?)
    }

    /// The shared pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a dedicated connection outside the pool.
    ///
    /// The connection task is spawned onto the runtime and ends when the
    /// returned client is dropped.
    pub async fn connect(&self) -> PgResult<Client> {
        let config = self.pool.config();
        let (client, connection) = config
            .to_pg_config()
            .connect(NoTls)
            .await
            .map_err(|e| PgError::connection(format!("{}: {}", config.display_target(), e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "isolated connection error");
            }
        });

        Ok(client)
    }
}

#[async_trait]
impl MigrationExecutor for PgExecutor {
    async fn execute(
        &self,
        migration: &OrganizedMigration,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let client = self.pool.get().await?;
        run_migration(&client, migration).await
    }

    async fn execute_isolated(
        &self,
        migration: &OrganizedMigration,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let client = self.connect().await?;
        run_migration(&client, migration).await
    }
}

async fn run_migration(
    client: &Client,
    migration: &OrganizedMigration,
) -> Result<ExecutionOutput, ExecutionError> {
    let sql = migration.migration.sql();

    if !migration.migration.is_transactional() {
        debug!(migration = %migration.id, "executing");
        return simple_query(client, sql).await.map_err(Into::into);
    }

    debug!(migration = %migration.id, "executing in transaction");
    client.batch_execute("BEGIN").await.map_err(PgError::from)?;
    match simple_query(client, sql).await {
        Ok(output) => {
            client.batch_execute("COMMIT").await.map_err(PgError::from)?;
            Ok(output)
        }
        Err(err) => {
            if let Err(e) = client.batch_execute("ROLLBACK").await {
                error!(migration = %migration.id, error = %e, "rollback failed");
            }
            Err(err.into())
        }
    }
}

async fn simple_query(client: &Client, sql: &str) -> PgResult<ExecutionOutput> {
    let messages = client.simple_query(sql).await?;
    Ok(collect_output(messages))
}

/// Fold simple-query messages into returned rows and the total affected count.
fn collect_output(messages: Vec<SimpleQueryMessage>) -> ExecutionOutput {
    let mut output = ExecutionOutput::default();
    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => {
                let mut values = ResultRow::new();
                for (idx, column) in row.columns().iter().enumerate() {
                    values.insert(column.name().to_string(), row.get(idx).map(String::from));
                }
                output.rows.push(values);
            }
            SimpleQueryMessage::CommandComplete(count) => output.rows_affected += count,
            _ => {}
        }
    }
    output
}
