use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{
        format_datetime, parse_datetime, parse_optional_datetime, parse_sync_status, to_i64,
        to_u32, to_u64,
    },
    models::{NewEvent, Session, SessionCounters, SessionEvent},
    repositories::events::append_events_tx,
};

const SESSION_COLUMNS: &str = "id, remote_id, start_time, end_time, duration_seconds, focused_seconds,
     distraction_count, is_complete, interrupted, sync_status, updated_at";

fn row_to_session(row: &Row) -> Result<Session> {
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let updated_at: String = row.get("updated_at")?;
    let sync_status: String = row.get("sync_status")?;

    Ok(Session {
        id: row.get("id")?,
        remote_id: row.get("remote_id")?,
        start_time: parse_datetime(&start_time, "start_time")?,
        end_time: parse_optional_datetime(end_time, "end_time")?,
        duration_seconds: to_u64(row.get("duration_seconds")?, "duration_seconds")?,
        focused_seconds: to_u64(row.get("focused_seconds")?, "focused_seconds")?,
        distraction_count: to_u32(row.get("distraction_count")?, "distraction_count")?,
        is_complete: row.get("is_complete")?,
        interrupted: row.get("interrupted")?,
        sync_status: parse_sync_status(&sync_status)?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

/// Status transition applied on every local write to a session row.
const FLIP_SYNCED: &str =
    "CASE sync_status WHEN 'synced' THEN 'pendingUpdate' WHEN 'pendingUpdate' THEN 'pendingUpdate' ELSE sync_status END";

impl Database {
    /// Create the session row and its START event in one transaction, so a
    /// crash can never leave a session without its opening event.
    pub async fn insert_session_with_start(
        &self,
        session: &Session,
        start: NewEvent,
    ) -> Result<SessionEvent> {
        let record = session.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO sessions (id, remote_id, start_time, end_time, duration_seconds, focused_seconds,
                                       distraction_count, is_complete, interrupted, sync_status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    record.remote_id,
                    format_datetime(&record.start_time),
                    record.end_time.as_ref().map(format_datetime),
                    to_i64(record.duration_seconds)?,
                    to_i64(record.focused_seconds)?,
                    record.distraction_count,
                    record.is_complete,
                    record.interrupted,
                    record.sync_status.as_str(),
                    format_datetime(&record.updated_at),
                ],
            )
            .context("failed to insert session")?;
            let mut events = append_events_tx(&tx, &record.id, vec![start])?;
            tx.commit()?;
            events
                .pop()
                .context("START event was not written")
        })
        .await
    }

    /// Durability checkpoint. Optionally appends events in the same
    /// transaction, which keeps transitions like PAUSE atomic with their
    /// counters.
    pub async fn checkpoint_session(
        &self,
        session_id: &str,
        counters: SessionCounters,
        events: Vec<NewEvent>,
        updated_at: DateTime<Utc>,
    ) -> Result<Vec<SessionEvent>> {
        let session_id = session_id.to_string();
        let counters = counters.normalized();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "UPDATE sessions
                     SET duration_seconds = ?1,
                         focused_seconds = ?2,
                         distraction_count = ?3,
                         updated_at = ?4,
                         sync_status = {FLIP_SYNCED}
                     WHERE id = ?5 AND is_complete = 0"
                ),
                params![
                    to_i64(counters.duration_seconds)?,
                    to_i64(counters.focused_seconds)?,
                    counters.distraction_count,
                    format_datetime(&updated_at),
                    session_id,
                ],
            )
            .context("failed to checkpoint session")?;
            let written = append_events_tx(&tx, &session_id, events)?;
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    /// Final write for a session: counters, end time, completeness and the
    /// closing events (any last DISTRACTION, then STOP).
    pub async fn finalize_session(
        &self,
        session_id: &str,
        counters: SessionCounters,
        end_time: DateTime<Utc>,
        interrupted: bool,
        events: Vec<NewEvent>,
    ) -> Result<Session> {
        let session_id = session_id.to_string();
        let counters = counters.normalized();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx
                .execute(
                    &format!(
                        "UPDATE sessions
                         SET duration_seconds = ?1,
                             focused_seconds = ?2,
                             distraction_count = ?3,
                             end_time = ?4,
                             is_complete = 1,
                             interrupted = ?5,
                             updated_at = ?6,
                             sync_status = {FLIP_SYNCED}
                         WHERE id = ?7 AND is_complete = 0"
                    ),
                    params![
                        to_i64(counters.duration_seconds)?,
                        to_i64(counters.focused_seconds)?,
                        counters.distraction_count,
                        format_datetime(&end_time),
                        interrupted,
                        format_datetime(&end_time),
                        session_id,
                    ],
                )
                .context("failed to finalize session")?;
            if changed == 0 {
                anyhow::bail!("session {session_id} is missing or already complete");
            }
            append_events_tx(&tx, &session_id, events)?;
            let session = tx
                .query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                    params![session_id],
                    |row| Ok(row_to_session(row)),
                )
                .context("failed to reload finalized session")??;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![session_id],
                |row| Ok(row_to_session(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    /// Most recent session that never reached its stop transition.
    pub async fn get_incomplete_session(&self) -> Result<Option<Session>> {
        self.execute(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE is_complete = 0
                     ORDER BY start_time DESC
                     LIMIT 1"
                ),
                [],
                |row| Ok(row_to_session(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    pub async fn list_sessions(&self, limit: u32) -> Result<Vec<Session>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY start_time DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query(params![limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Sessions with unsent changes, or with events that have not been
    /// acknowledged yet.
    pub async fn list_sessions_needing_sync(&self) -> Result<Vec<Session>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions s
                 WHERE s.sync_status <> 'synced'
                    OR EXISTS (SELECT 1 FROM session_events e
                               WHERE e.session_id = s.id AND e.sync_status <> 'synced')
                 ORDER BY s.start_time ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Record a successful upload. The row only becomes `synced` if nothing
    /// touched it since `uploaded_version` was read; otherwise it stays
    /// pending so the newer state goes out on the next pass.
    pub async fn mark_session_synced(
        &self,
        session_id: &str,
        remote_id: &str,
        uploaded_version: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let remote_id = remote_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET remote_id = ?1,
                     sync_status = CASE WHEN updated_at = ?2 THEN 'synced' ELSE 'pendingUpdate' END
                 WHERE id = ?3",
                params![remote_id, format_datetime(&uploaded_version), session_id],
            )
            .context("failed to mark session synced")?;
            Ok(())
        })
        .await
    }
}
