use std::{path::Path, str::FromStr, time::Duration};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

use super::{DbPool, MIGRATOR};

pub async fn init_pool(db_path: impl AsRef<Path>) -> Result<DbPool, sqlx::Error> {
    init_pool_with(db_path, 5, Duration::from_secs(5)).await
}

pub async fn init_pool_with(
    db_path: impl AsRef<Path>,
    max_connections: u32,
    busy_timeout: Duration,
) -> Result<DbPool, sqlx::Error> {
    let db_url = format!("sqlite://{}", db_path.as_ref().to_string_lossy());

    // WAL 让回填批次和索引重建的读不阻塞并发写
    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    MIGRATOR.run(&pool).await?;
    tracing::debug!(path = %db_path.as_ref().display(), "Database ready");
    Ok(pool)
}
