//! Shared fixtures for the integration suites.

use sqlx::SqlitePool;
use tempfile::TempDir;

use spurgo::infra::db::Database;

/// A migrated file-backed pool living in `dir`. File-backed so multiple
/// connections see the same database.
pub async fn pool_in(dir: &TempDir, max_connections: u32) -> SqlitePool {
    let path = dir.path().join("queue.db");
    let url = format!("sqlite://{}", path.display());
    let pool = Database::connect(&url, max_connections)
        .await
        .expect("pool connects");
    Database::run_migrations(&pool).await.expect("migrations run");
    pool
}
