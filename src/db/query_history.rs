//! Query history repository for pipeline requests

use crate::error::{GatewayError, Result};
use crate::pipeline::{PipelineFailure, PipelineResponse};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub request_id: String,
    pub question: String,
    /// `completed` or `failed`
    pub status: String,
    pub stage: Option<String>,
    pub reason: Option<String>,
    pub sql: Option<String>,
    pub row_count: Option<i64>,
    pub fixes_applied: Vec<String>,
    pub elapsed_ms: i64,
    pub created_at: String,
}

impl HistoryEntry {
    pub fn completed(response: &PipelineResponse) -> Self {
        Self {
            request_id: response.request_id.to_string(),
            question: response.question.clone(),
            status: "completed".to_string(),
            stage: None,
            reason: None,
            sql: Some(response.sql_shown.clone()),
            row_count: Some(response.row_count as i64),
            fixes_applied: response.fixes_applied.clone(),
            elapsed_ms: response.elapsed_ms as i64,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn failed(question: &str, failure: &PipelineFailure) -> Self {
        Self {
            request_id: failure.request_id.to_string(),
            question: question.to_string(),
            status: "failed".to_string(),
            stage: Some(failure.stage.to_string()),
            reason: Some(failure.reason.clone()),
            sql: failure.sql_shown.clone(),
            row_count: None,
            fixes_applied: failure.fixes_applied.clone(),
            elapsed_ms: failure.elapsed_ms as i64,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

pub struct QueryHistory {
    db: Mutex<Connection>,
}

impl QueryHistory {
    /// Open or create the history database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)
            .map_err(|e| GatewayError::History(format!("Failed to open database: {}", e)))?;
        let history = Self { db: Mutex::new(db) };
        history.init_schema()?;
        info!("Query history at {}", path.display());
        Ok(history)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        let history = Self { db: Mutex::new(db) };
        history.init_schema()?;
        Ok(history)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| GatewayError::History("history connection poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS query_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                question TEXT NOT NULL,
                status TEXT NOT NULL,
                stage TEXT,
                reason TEXT,
                sql_text TEXT,
                row_count INTEGER,
                fixes_applied TEXT NOT NULL DEFAULT '[]',
                elapsed_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| GatewayError::History(format!("Failed to create table: {}", e)))?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_query_history_created ON query_history(created_at)",
            [],
        )
        .map_err(|e| GatewayError::History(format!("Failed to create index: {}", e)))?;
        Ok(())
    }

    pub fn record(&self, entry: &HistoryEntry) -> Result<()> {
        let fixes = serde_json::to_string(&entry.fixes_applied)?;
        let db = self.lock()?;
        db.execute(
            r#"
            INSERT INTO query_history
                (request_id, question, status, stage, reason, sql_text, row_count,
                 fixes_applied, elapsed_ms, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                entry.request_id,
                entry.question,
                entry.status,
                entry.stage,
                entry.reason,
                entry.sql,
                entry.row_count,
                fixes,
                entry.elapsed_ms,
                entry.created_at,
            ],
        )?;
        debug!("Recorded history entry {}", entry.request_id);
        Ok(())
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            r#"
            SELECT request_id, question, status, stage, reason, sql_text, row_count,
                   fixes_applied, elapsed_ms, created_at
            FROM query_history
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let fixes: String = row.get(7)?;
            Ok(HistoryEntry {
                request_id: row.get(0)?,
                question: row.get(1)?,
                status: row.get(2)?,
                stage: row.get(3)?,
                reason: row.get(4)?,
                sql: row.get(5)?,
                row_count: row.get(6)?,
                fixes_applied: serde_json::from_str(&fixes).unwrap_or_default(),
                elapsed_ms: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, status: &str) -> HistoryEntry {
        HistoryEntry {
            request_id: id.to_string(),
            question: "total sales by region".to_string(),
            status: status.to_string(),
            stage: None,
            reason: None,
            sql: Some("SELECT 1".to_string()),
            row_count: Some(1),
            fixes_applied: vec!["table 'intl_sales' renamed to 'international_sales'".to_string()],
            elapsed_ms: 5,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_record_and_recent_order() {
        let history = QueryHistory::in_memory().unwrap();
        history.record(&entry("a", "completed")).unwrap();
        history.record(&entry("b", "failed")).unwrap();
        history.record(&entry("c", "completed")).unwrap();

        let recent = history.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, "c");
        assert_eq!(recent[1].request_id, "b");
        assert_eq!(recent[0].fixes_applied.len(), 1);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        {
            let history = QueryHistory::open(&path).unwrap();
            history.record(&entry("x", "completed")).unwrap();
        }
        let reopened = QueryHistory::open(&path).unwrap();
        assert_eq!(reopened.recent(10).unwrap()[0].request_id, "x");
    }
}
