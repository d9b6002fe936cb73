//! SQLite connection pool.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditRecorder;
use crate::config::Config;
use crate::embedding::create_provider;
use crate::migrate;
use crate::pipeline::Engine;
use crate::sqlite_store::SqliteStore;

/// Open (creating if missing) the database at `[db] path` in WAL mode.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    Ok(pool)
}

/// Open the configured database, apply migrations, and build an [`Engine`]
/// over it with the configured embedding provider and audit key.
pub async fn open_engine(config: Arc<Config>) -> Result<Engine> {
    let pool = connect(&config).await?;
    migrate::apply(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let embedder = create_provider(&config.embedding)?;
    let recorder = Arc::new(AuditRecorder::from_config(&config.audit));
    Ok(Engine::new(store, embedder, config, recorder))
}
