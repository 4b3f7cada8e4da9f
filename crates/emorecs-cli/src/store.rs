//! SQLite persistence for emotion logs and per-session dominant emotions.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use emorecs_core::{Emotion, EmotionSink, SinkError, UserId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const CURRENT_SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS emotion_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    detected_emotion TEXT NOT NULL,
    confidence REAL NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_emotion_logs_user ON emotion_logs (user_id, timestamp);

CREATE TABLE IF NOT EXISTS emotion_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    dominant_emotion TEXT NOT NULL,
    session_end TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_emotion_sessions_user ON emotion_sessions (user_id, session_end);
";

#[derive(Debug, Clone, PartialEq)]
pub struct EmotionLog {
    pub emotion: Emotion,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub dominant_emotion: Emotion,
    pub session_end: DateTime<Utc>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        run_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn insert_log(&self, user_id: UserId, emotion: Emotion, confidence: f32, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO emotion_logs (user_id, detected_emotion, confidence, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, emotion.as_str(), confidence as f64, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_session(&self, user_id: UserId, emotion: Emotion, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO emotion_sessions (user_id, dominant_emotion, session_end)
             VALUES (?1, ?2, ?3)",
            params![user_id, emotion.as_str(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Dominant emotion of the user's most recent session.
    pub fn latest_session(&self, user_id: UserId) -> Result<Option<SessionRecord>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT dominant_emotion, session_end FROM emotion_sessions
                 WHERE user_id = ?1
                 ORDER BY id DESC
                 LIMIT 1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(emotion, end)| -> Result<SessionRecord> {
            Ok(SessionRecord {
                dominant_emotion: parse_emotion(&emotion)?,
                session_end: parse_datetime(&end)?,
            })
        })
        .transpose()
    }

    /// Newest `limit` log rows for the user, newest first.
    pub fn recent_logs(&self, user_id: UserId, limit: usize) -> Result<Vec<EmotionLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT detected_emotion, confidence, timestamp FROM emotion_logs
             WHERE user_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut logs = Vec::new();
        for row in rows {
            let (emotion, confidence, timestamp) = row?;
            logs.push(EmotionLog {
                emotion: parse_emotion(&emotion)?,
                confidence: confidence as f32,
                timestamp: parse_datetime(&timestamp)?,
            });
        }
        Ok(logs)
    }
}

impl EmotionSink for SqliteStore {
    fn log_emotion(&mut self, user_id: UserId, label: Emotion, confidence: f32) -> Result<(), SinkError> {
        self.insert_log(user_id, label, confidence, Utc::now())
            .map_err(|e| SinkError::Storage(format!("{e:#}")))
    }

    fn save_dominant_emotion(&mut self, user_id: UserId, label: Emotion) -> Result<(), SinkError> {
        self.insert_session(user_id, label, Utc::now())
            .map_err(|e| SinkError::Storage(format!("{e:#}")))
    }
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database version ({}) is newer than supported schema ({})",
            version,
            CURRENT_SCHEMA_VERSION
        );
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction().context("failed to open migration transaction")?;
    tx.execute_batch(SCHEMA_V1).context("failed to create schema")?;
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;
    Ok(())
}

fn parse_emotion(value: &str) -> Result<Emotion> {
    value
        .parse()
        .map_err(|err| anyhow!("invalid emotion '{value}' in database: {err}"))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}
