use sqlx::SqlitePool;

use crate::error::{Error, Result};

const SCHEMA_VERSION: i64 = 1;

pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")
        .execute(pool)
        .await
        .map_err(migration_failed)?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(migration_failed)?;
    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        tracing::debug!("Database schema is up to date (version {current_version})");
        return Ok(());
    }

    tracing::info!("Migrating database from version {current_version} to {SCHEMA_VERSION}");

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    Ok(())
}

async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await.map_err(migration_failed)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vms (
            vm_id INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL UNIQUE,
            owner_id TEXT NOT NULL,
            owner_username TEXT NOT NULL,
            cpu INTEGER NOT NULL,
            ram INTEGER NOT NULL,
            disk INTEGER NOT NULL,
            ip_address TEXT,
            ssh_username TEXT NOT NULL,
            ssh_password TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'stopped'
                CHECK (status IN ('running', 'stopped', 'paused', 'error')),
            created_at TEXT NOT NULL,
            last_started TEXT,
            node TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(migration_failed)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vms_owner_id ON vms(owner_id)")
        .execute(&mut *tx)
        .await
        .map_err(migration_failed)?;

    sqlx::query("DELETE FROM schema_version")
        .execute(&mut *tx)
        .await
        .map_err(migration_failed)?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(1_i64)
        .execute(&mut *tx)
        .await
        .map_err(migration_failed)?;

    tx.commit().await.map_err(migration_failed)?;
    Ok(())
}

fn migration_failed(e: sqlx::Error) -> Error {
    Error::Migration {
        reason: e.to_string(),
    }
}
