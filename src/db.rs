// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Persistence: session metadata and per-tick time-series.
//!
//! Every operation borrows a pooled connection and commits immediately.
//! Tick writes are best-effort; callers log failures and keep streaming.

use std::str::FromStr;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};

use crate::error::Result;
use crate::params::Params;

const SCHEMA_SESSION: &str = r#"
CREATE TABLE IF NOT EXISTS session (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  camera_id       TEXT NOT NULL DEFAULT '',
  camera_name     TEXT NOT NULL DEFAULT '',
  location        TEXT NOT NULL DEFAULT '',
  source_type     TEXT NOT NULL DEFAULT 'video',
  source_url      TEXT NOT NULL DEFAULT '',
  fps             INTEGER,
  conf_water      REAL,
  iou_water       REAL,
  conf_risk       REAL,
  iou_risk        REAL,
  send_mask_every INTEGER,
  imgsz_water     INTEGER,
  imgsz_risk      INTEGER,
  status          TEXT NOT NULL DEFAULT 'running',
  started_at      TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
  ended_at        TEXT,
  record_path     TEXT
)
"#;

const SCHEMA_TICK: &str = r#"
CREATE TABLE IF NOT EXISTS tick (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id    INTEGER NOT NULL,
  ts_ms         INTEGER NOT NULL,
  video_sec     REAL NOT NULL,
  water_percent INTEGER NOT NULL,
  risk_level    INTEGER NOT NULL,
  mask_h        INTEGER,
  mask_w        INTEGER,
  water_polys   TEXT,
  risk_boxes    TEXT
)
"#;

const SCHEMA_TICK_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tick_session ON tick (session_id, video_sec, ts_ms)";

/// Session attributes captured at creation time.
pub struct SessionMeta<'a> {
    pub camera_id: &'a str,
    pub camera_name: &'a str,
    pub location: &'a str,
    pub source_type: &'a str,
    pub source_url: &'a str,
}

/// One persisted tick, ready for insertion.
#[derive(Debug, Clone)]
pub struct TickRow {
    pub ts_ms: i64,
    pub video_sec: f64,
    pub water_percent: i64,
    pub risk_level: i64,
    pub mask_h: i64,
    pub mask_w: i64,
    pub water_polys: Option<String>,
    pub risk_boxes: Option<String>,
}

/// Session row as read back for the history surface.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SessionRecord {
    pub id: i64,
    pub camera_id: String,
    pub camera_name: String,
    pub location: String,
    pub source_type: String,
    pub source_url: String,
    pub status: String,
    pub record_path: Option<String>,
    pub started_at: Option<chrono::NaiveDateTime>,
    pub ended_at: Option<chrono::NaiveDateTime>,
}

/// Tick row as read back for the history surface.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TickRecord {
    pub id: i64,
    pub session_id: i64,
    pub ts_ms: i64,
    pub video_sec: f64,
    pub water_percent: i64,
    pub risk_level: i64,
    pub mask_h: Option<i64>,
    pub mask_w: Option<i64>,
    pub water_polys: Option<String>,
    pub risk_boxes: Option<String>,
}

/// Shared connection pool handle. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Connect and create the schema if missing.
    ///
    /// SQLite is single-writer; one pooled connection serialises commits
    /// across sessions.
    pub async fn connect(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        sqlx::query(SCHEMA_SESSION).execute(&pool).await?;
        sqlx::query(SCHEMA_TICK).execute(&pool).await?;
        sqlx::query(SCHEMA_TICK_INDEX).execute(&pool).await?;
        Ok(Db { pool })
    }

    /// Insert a session row in `running` state; returns its id.
    pub async fn create_session(&self, meta: &SessionMeta<'_>, params: &Params) -> Result<i64> {
        let res = sqlx::query(
            "INSERT INTO session (camera_id, camera_name, location, source_type, source_url, \
             fps, conf_water, iou_water, conf_risk, iou_risk, send_mask_every, imgsz_water, imgsz_risk) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(meta.camera_id)
        .bind(meta.camera_name)
        .bind(meta.location)
        .bind(meta.source_type)
        .bind(meta.source_url)
        .bind(params.fps as i64)
        .bind(params.conf_water as f64)
        .bind(params.iou_water as f64)
        .bind(params.conf_risk as f64)
        .bind(params.iou_risk as f64)
        .bind(params.send_mask_every as i64)
        .bind(params.imgsz_water as i64)
        .bind(params.imgsz_risk as i64)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn save_tick(&self, session_id: i64, tick: &TickRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO tick (session_id, ts_ms, video_sec, water_percent, risk_level, \
             mask_h, mask_w, water_polys, risk_boxes) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(tick.ts_ms)
        .bind(tick.video_sec)
        .bind(tick.water_percent)
        .bind(tick.risk_level)
        .bind(tick.mask_h)
        .bind(tick.mask_w)
        .bind(tick.water_polys.as_deref())
        .bind(tick.risk_boxes.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set the recorded-file path, relative to the record root's parent.
    pub async fn update_record_path(&self, session_id: i64, record_path: &str) -> Result<()> {
        sqlx::query("UPDATE session SET record_path = ? WHERE id = ?")
            .bind(record_path)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp the terminal status and end time.
    pub async fn finish_session(&self, session_id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE session SET status = ?, ended_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(status)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Recent sessions, newest first. Serves the history endpoint only;
    /// the streaming core never calls it.
    pub async fn list_sessions(
        &self,
        camera_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SessionRecord>> {
        let rows = match camera_id {
            Some(camera_id) => {
                sqlx::query_as::<_, SessionRecord>(
                    "SELECT id, camera_id, camera_name, location, source_type, source_url, \
                     status, record_path, started_at, ended_at FROM session \
                     WHERE camera_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
                )
                .bind(camera_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SessionRecord>(
                    "SELECT id, camera_id, camera_name, location, source_type, source_url, \
                     status, record_path, started_at, ended_at FROM session \
                     ORDER BY started_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Tick time-series for one session. `limit == 0` means unlimited.
    pub async fn list_ticks(&self, session_id: i64, limit: i64) -> Result<Vec<TickRecord>> {
        let limit = if limit <= 0 { i64::MAX } else { limit };
        let rows = sqlx::query_as::<_, TickRecord>(
            "SELECT id, session_id, ts_ms, video_sec, water_percent, risk_level, \
             mask_h, mask_w, water_polys, risk_boxes FROM tick \
             WHERE session_id = ? ORDER BY video_sec ASC, ts_ms ASC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete a session and its ticks. Returns false if the id is unknown.
    pub async fn delete_session(&self, session_id: i64) -> Result<bool> {
        sqlx::query("DELETE FROM tick WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        let res = sqlx::query("DELETE FROM session WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Close the pool. Later operations fail fast instead of hanging.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Current status string of a session, for tests and diagnostics.
    pub async fn session_status(&self, session_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT status FROM session WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("status")))
    }
}
