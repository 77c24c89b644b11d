//! Agent session storage
//!
//! One SQLite row per chat session, holding the completed runs (as JSON) and
//! the latest session summary. The table name is configurable so several
//! agents can share one database file.

use crate::memory::SessionSummary;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One completed exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub user: String,
    pub assistant: String,
    pub created_at: DateTime<Utc>,
}

impl AgentRun {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
            created_at: Utc::now(),
        }
    }
}

/// A persisted chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub user_id: Option<String>,
    pub runs: Vec<AgentRun>,
    pub summary: Option<SessionSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(session_id: impl Into<String>, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id,
            runs: Vec::new(),
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The most recent `n` runs, oldest first
    pub fn last_runs(&self, n: usize) -> &[AgentRun] {
        let start = self.runs.len().saturating_sub(n);
        &self.runs[start..]
    }
}

fn validate_table_name(name: &str) -> Result<()> {
    let valid = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$")?;
    if !valid.is_match(name) {
        bail!("Invalid storage table name: {:?}", name);
    }
    Ok(())
}

/// SQLite-backed session storage
pub struct AgentStorage {
    db_path: PathBuf,
    table: String,
    db: Arc<Mutex<Connection>>,
}

impl AgentStorage {
    /// Open or create the storage database, creating parent directories
    pub fn open(path: impl AsRef<Path>, table_name: &str) -> Result<Self> {
        validate_table_name(table_name)?;
        let db_path = path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    session_id TEXT PRIMARY KEY,
                    user_id TEXT,
                    runs TEXT NOT NULL,
                    summary TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table_name}_user ON {table_name}(user_id)"
            ),
            [],
        )?;

        tracing::debug!(path = %db_path.display(), table = table_name, "Opened agent storage");

        Ok(Self {
            db_path,
            table: table_name.to_string(),
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn read(&self, session_id: &str) -> Result<Option<AgentSession>> {
        let conn = self.db.lock().unwrap();
        Self::read_locked(&conn, &self.table, session_id)
    }

    fn read_locked(conn: &Connection, table: &str, session_id: &str) -> Result<Option<AgentSession>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT session_id, user_id, runs, summary, created_at, updated_at
                     FROM {table} WHERE session_id = ?1"
                ),
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((session_id, user_id, runs, summary, created_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(AgentSession {
            session_id,
            user_id,
            runs: serde_json::from_str(&runs).context("Corrupt runs column")?,
            summary: summary
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .context("Corrupt summary column")?,
            created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
        }))
    }

    fn upsert_locked(conn: &Connection, table: &str, session: &AgentSession) -> Result<()> {
        let summary = session
            .summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            &format!(
                "INSERT INTO {table} (session_id, user_id, runs, summary, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    user_id = excluded.user_id,
                    runs = excluded.runs,
                    summary = excluded.summary,
                    updated_at = excluded.updated_at"
            ),
            params![
                session.session_id,
                session.user_id,
                serde_json::to_string(&session.runs)?,
                summary,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Insert or replace a whole session
    pub fn upsert(&self, session: &AgentSession) -> Result<()> {
        let conn = self.db.lock().unwrap();
        Self::upsert_locked(&conn, &self.table, session)
    }

    /// Append a run to a session, creating the session on first use
    pub fn append_run(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        run: AgentRun,
    ) -> Result<AgentSession> {
        let conn = self.db.lock().unwrap();
        let mut session = Self::read_locked(&conn, &self.table, session_id)?
            .unwrap_or_else(|| AgentSession::new(session_id, user_id.map(str::to_string)));
        session.runs.push(run);
        session.updated_at = Utc::now();
        Self::upsert_locked(&conn, &self.table, &session)?;
        Ok(session)
    }

    /// Replace the summary of an existing session
    pub fn set_summary(&self, session_id: &str, summary: &SessionSummary) -> Result<()> {
        let conn = self.db.lock().unwrap();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET summary = ?1, updated_at = ?2 WHERE session_id = ?3",
                self.table
            ),
            params![
                serde_json::to_string(summary)?,
                Utc::now().to_rfc3339(),
                session_id
            ],
        )?;
        if changed == 0 {
            bail!("Session not found: {}", session_id);
        }
        Ok(())
    }

    /// Session ids, most recently updated first
    pub fn session_ids(&self) -> Result<Vec<String>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT session_id FROM {} ORDER BY updated_at DESC",
            self.table
        ))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let conn = self.db.lock().unwrap();
        let rows = conn.execute(
            &format!("DELETE FROM {} WHERE session_id = ?1", self.table),
            params![session_id],
        )?;
        Ok(rows > 0)
    }
}
