//! SQLite pool setup shared by the store and worker databases.

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

pub(crate) static STORE_MIGRATIONS: Migrator = sqlx::migrate!("./migrations/store");
pub(crate) static WORKER_MIGRATIONS: Migrator = sqlx::migrate!("./migrations/worker");

/// Opens (creating if needed) the database at `path` and runs `migrator`.
pub(crate) async fn open_pool(path: &Path, migrator: &Migrator) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrator.run(&pool).await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_pool_creates_store_tables() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("store.db");

        let pool = open_pool(&db_path, &STORE_MIGRATIONS).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(table_names, vec!["checkpoints", "documents", "meta"]);
    }

    #[tokio::test]
    async fn test_open_pool_creates_worker_tables() {
        let temp_dir = tempdir().unwrap();
        let pool = open_pool(&temp_dir.path().join("worker.db"), &WORKER_MIGRATIONS)
            .await
            .unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(table_names, vec!["cache_entries", "mutation_queue"]);
    }
}
