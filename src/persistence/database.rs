//! SQLite database implementation for persistent storage

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::Settings;

/// Instance lifecycle events kept in the history table
pub mod events {
    pub const LAUNCHED: &str = "launched";
    pub const RUNNING: &str = "running";
    pub const STOPPED: &str = "stopped";
    pub const CRASHED: &str = "crashed";
    pub const REMOVED: &str = "removed";
}

/// One row of instance history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        info!("Database opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private database that disappears with the connection
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Instance history
            CREATE TABLE IF NOT EXISTS instance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_time TEXT NOT NULL,
                details TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_instance_history_instance
                ON instance_history (instance_id);
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = 'app_settings'")?;
        let result: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;

        match result {
            Some(json) => {
                let mut settings: Settings =
                    serde_json::from_str(&json).context("Failed to deserialize settings")?;
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.connection()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('app_settings', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === History ===

    /// Record an instance event
    pub fn record_instance_event(
        &self,
        instance_id: &str,
        event_type: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO instance_history (instance_id, event_type, event_time, details)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                instance_id,
                event_type,
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                details,
            ],
        )?;
        Ok(())
    }

    /// Get instance history, newest first
    pub fn get_instance_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, event_time, details FROM instance_history WHERE instance_id = ?1 ORDER BY event_time DESC, id DESC",
        )?;

        let rows = stmt.query_map(params![instance_id], |row| {
            let event_type: String = row.get(0)?;
            let event_time: String = row.get(1)?;
            let details: Option<String> = row.get(2)?;
            Ok((event_type, event_time, details))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (event_type, event_time, details) = row?;
            let event_time = DateTime::parse_from_rfc3339(&event_time)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("Invalid event time '{}'", event_time))?;
            result.push(HistoryEvent {
                event_type,
                event_time,
                details,
            });
        }

        Ok(result)
    }

    /// Clean up old history entries
    pub fn cleanup_history(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.connection()?;
        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(retention_days as i64)
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM instance_history WHERE event_time < ?1",
            params![cutoff.to_rfc3339_opts(SecondsFormat::Micros, true)],
        )?;

        debug!("Cleaned up {} old history entries", count);
        Ok(count)
    }

    #[cfg(test)]
    fn insert_event_at(&self, instance_id: &str, event_type: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO instance_history (instance_id, event_type, event_time) VALUES (?1, ?2, ?3)",
            params![instance_id, event_type, at.to_rfc3339_opts(SecondsFormat::Micros, true)],
        )?;
        Ok(())
    }
}
