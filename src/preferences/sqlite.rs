// SQLite-backed preferences store
// Owns the connection and runs schema migrations on open

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{migrations, PreferencesStore, ACTIVE_MODEL_KEY};
use crate::error::CoreError;

/// A finished download as recorded in the database
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedDownload {
    pub model_id: String,
    pub completed_at: DateTime<Utc>,
}

pub struct SqlitePreferences {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqlitePreferences {
    /// Open (or create) the database at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create preferences directory")?;
        }

        let conn = Connection::open(&db_path).context("Failed to open preferences database")?;
        migrations::run_migrations(&conn).context("Failed to run preferences migrations")?;

        log::info!("Preferences database initialized at: {:?}", db_path);

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        migrations::run_migrations(&conn).context("Failed to run preferences migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
        })
    }

    /// Execute a function with access to the database connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to lock database connection: {}", e))?;
        f(&conn)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Completed downloads with their timestamps, oldest first
    pub fn completed_records(&self) -> Result<Vec<CompletedDownload>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT model_id, completed_at FROM completed_downloads ORDER BY completed_at")
                .context("Failed to prepare completed_downloads query")?;

            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .context("Failed to query completed downloads")?;

            let mut records = Vec::new();
            for row in rows {
                let (model_id, completed_at) = row.context("Failed to read completed download")?;
                let completed_at = DateTime::parse_from_rfc3339(&completed_at)
                    .with_context(|| format!("Invalid timestamp for {}", model_id))?
                    .with_timezone(&Utc);
                records.push(CompletedDownload {
                    model_id,
                    completed_at,
                });
            }
            Ok(records)
        })
    }
}

fn get_setting_impl(conn: &Connection, key: &str) -> Result<Option<String>> {
    let result = conn.query_row(
        "SELECT value FROM settings WHERE key = ?",
        params![key],
        |row| row.get(0),
    );

    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context("Failed to get setting"),
    }
}

fn set_setting_impl(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?1, ?2, datetime('now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = datetime('now')
        "#,
        params![key, value],
    )
    .context("Failed to set setting")?;

    Ok(())
}

impl PreferencesStore for SqlitePreferences {
    fn active_selection(&self) -> Result<Option<String>, CoreError> {
        Ok(self.with_connection(|conn| get_setting_impl(conn, ACTIVE_MODEL_KEY))?)
    }

    fn set_active_selection(&self, model_id: Option<&str>) -> Result<(), CoreError> {
        Ok(self.with_connection(|conn| match model_id {
            Some(id) => set_setting_impl(conn, ACTIVE_MODEL_KEY, id),
            None => {
                conn.execute("DELETE FROM settings WHERE key = ?", params![ACTIVE_MODEL_KEY])
                    .context("Failed to clear active model")?;
                Ok(())
            }
        })?)
    }

    fn completed_downloads(&self) -> Result<BTreeSet<String>, CoreError> {
        Ok(self
            .completed_records()?
            .into_iter()
            .map(|r| r.model_id)
            .collect())
    }

    fn insert_completed(&self, model_id: &str) -> Result<(), CoreError> {
        let now = Utc::now().to_rfc3339();
        Ok(self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO completed_downloads (model_id, completed_at) VALUES (?1, ?2)",
                params![model_id, now],
            )
            .context("Failed to record completed download")?;
            Ok(())
        })?)
    }

    fn remove_completed(&self, model_id: &str) -> Result<(), CoreError> {
        Ok(self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM completed_downloads WHERE model_id = ?",
                params![model_id],
            )
            .context("Failed to remove completed download")?;
            Ok(())
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_database_creation() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("prefs.db");

        let prefs = SqlitePreferences::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(prefs.db_path(), Some(db_path.as_path()));
        assert_eq!(prefs.active_selection().unwrap(), None);
        assert!(prefs.completed_downloads().unwrap().is_empty());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("prefs.db");

        {
            let prefs = SqlitePreferences::open(&db_path).unwrap();
            prefs.set_active_selection(Some("llama-3.2-1b-instruct")).unwrap();
            prefs.insert_completed("llama-3.2-1b-instruct").unwrap();
            prefs.insert_completed("gemma-2-2b-it").unwrap();
            prefs.remove_completed("gemma-2-2b-it").unwrap();
        }

        let prefs = SqlitePreferences::open(&db_path).unwrap();
        assert_eq!(
            prefs.active_selection().unwrap().as_deref(),
            Some("llama-3.2-1b-instruct")
        );
        let completed = prefs.completed_downloads().unwrap();
        assert_eq!(completed.len(), 1);
        assert!(completed.contains("llama-3.2-1b-instruct"));

        let records = prefs.completed_records().unwrap();
        assert!(records[0].completed_at <= Utc::now());
    }

    #[test]
    fn test_clear_selection() {
        let prefs = SqlitePreferences::open_in_memory().unwrap();
        prefs.set_active_selection(Some("a")).unwrap();
        prefs.set_active_selection(Some("b")).unwrap();
        assert_eq!(prefs.active_selection().unwrap().as_deref(), Some("b"));

        prefs.set_active_selection(None).unwrap();
        assert_eq!(prefs.active_selection().unwrap(), None);
    }
}
