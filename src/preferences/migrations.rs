// Schema migrations for the preferences database

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all necessary migrations to bring the database up to date
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )
        .context("Failed to check for schema_version table")?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .context("Failed to read schema version")?;

    Ok(version.unwrap_or(0))
}

/// Version tracking and key-value settings
fn migrate_v1(conn: &Connection) -> Result<()> {
    log::info!("Running preferences migration v1");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )
    .context("Failed to run migration v1")?;

    Ok(())
}

/// Completed downloads set
fn migrate_v2(conn: &Connection) -> Result<()> {
    log::info!("Running preferences migration v2");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS completed_downloads (
            model_id TEXT PRIMARY KEY NOT NULL,
            completed_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )
    .context("Failed to run migration v2")?;

    Ok(())
}
