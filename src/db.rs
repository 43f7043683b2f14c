use std::{path::Path, str::FromStr, time::Duration};

use anyhow::Context;
use sqlx::{
    Sqlite, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (creating if needed) the database file and bring the schema up to date.
pub async fn connect(path: impl AsRef<Path>) -> anyhow::Result<SqlitePool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let database = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database {}", path.display()))?;
    MIGRATOR.run(&database).await.context("failed to run migrations")?;
    info!("database {} ready", path.display());
    Ok(database)
}

/// Opens a transaction that holds the write lock from its first statement.
///
/// A deferred transaction that reads before writing cannot be upgraded once
/// another connection has written, and fails with `SQLITE_BUSY` without
/// waiting. `BEGIN IMMEDIATE` waits on the busy timeout instead.
pub async fn begin_write(database: &SqlitePool) -> sqlx::Result<Transaction<'static, Sqlite>> {
    database.begin_with("BEGIN IMMEDIATE").await
}

/// Single-connection in-memory database with the schema applied.
pub async fn connect_in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    // every connection to :memory: is a separate database, keep exactly one alive
    let database = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&database).await?;
    Ok(database)
}
