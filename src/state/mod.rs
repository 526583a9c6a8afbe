//! Embedded sqlite plumbing shared by the persisted stores.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Open (creating if missing) the state database in WAL mode with
/// owner-only file permissions.
pub async fn open_sqlite_pool(db_path: &str) -> anyhow::Result<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    set_db_file_permissions(db_path);
    Ok(pool)
}

/// Restrictive permissions (0600) on the database and WAL files.
fn set_db_file_permissions(db_path: &str) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(db_path, mode.clone()) {
            tracing::warn!("failed to set permissions on {}: {}", db_path, e);
        }
        for suffix in &["-wal", "-shm"] {
            let path = format!("{db_path}{suffix}");
            if std::path::Path::new(&path).exists() {
                if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                    tracing::warn!("failed to set permissions on {}: {}", path, e);
                }
            }
        }
    }
}
