use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_sync_status, to_i64, to_u64},
    models::{EventType, NewEvent, SessionEvent, SyncStatus},
};

const EVENT_COLUMNS: &str =
    "id, session_id, sequence, event_type, timestamp, app_name, duration_seconds, metadata, sync_status";

fn row_to_event(row: &Row) -> Result<SessionEvent> {
    let event_type: String = row.get("event_type")?;
    let timestamp: String = row.get("timestamp")?;
    let duration: Option<i64> = row.get("duration_seconds")?;
    let metadata: Option<String> = row.get("metadata")?;
    let sync_status: String = row.get("sync_status")?;

    Ok(SessionEvent {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        sequence: to_u64(row.get("sequence")?, "sequence")?,
        event_type: EventType::parse(&event_type)?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        app_name: row.get("app_name")?,
        duration_seconds: duration
            .map(|value| to_u64(value, "duration_seconds"))
            .transpose()?,
        metadata: metadata
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("invalid event metadata")?,
        sync_status: parse_sync_status(&sync_status)?,
    })
}

/// Append events inside the caller's transaction. Sequence numbers continue
/// from the session's current maximum, so reads ordered by sequence replay the
/// log in append order.
pub(crate) fn append_events_tx(
    conn: &Connection,
    session_id: &str,
    events: Vec<NewEvent>,
) -> Result<Vec<SessionEvent>> {
    if events.is_empty() {
        return Ok(Vec::new());
    }

    let last: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) FROM session_events WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    let mut sequence = to_u64(last, "sequence")?;

    let mut stmt = conn.prepare(
        "INSERT INTO session_events (id, session_id, sequence, event_type, timestamp, app_name,
                                     duration_seconds, metadata, sync_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;

    let mut written = Vec::with_capacity(events.len());
    for event in events {
        sequence += 1;
        let record = SessionEvent {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            sequence,
            event_type: event.event_type,
            timestamp: event.timestamp,
            app_name: event.app_name,
            duration_seconds: event.duration_seconds,
            metadata: event.metadata,
            sync_status: SyncStatus::Local,
        };
        stmt.execute(params![
            record.id,
            record.session_id,
            to_i64(record.sequence)?,
            record.event_type.as_str(),
            format_datetime(&record.timestamp),
            record.app_name,
            record.duration_seconds.map(to_i64).transpose()?,
            record
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            record.sync_status.as_str(),
        ])
        .with_context(|| format!("failed to append {} event", record.event_type.as_str()))?;
        written.push(record);
    }

    Ok(written)
}

impl Database {
    pub async fn append_events(
        &self,
        session_id: &str,
        events: Vec<NewEvent>,
    ) -> Result<Vec<SessionEvent>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let written = append_events_tx(&tx, &session_id, events)?;
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    pub async fn list_events(&self, session_id: &str) -> Result<Vec<SessionEvent>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM session_events WHERE session_id = ?1 ORDER BY sequence ASC"
            ))?;
            let mut rows = stmt.query(params![session_id])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
        .await
    }

    pub async fn list_unsynced_events(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<SessionEvent>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM session_events
                 WHERE session_id = ?1 AND sync_status <> 'synced'
                 ORDER BY sequence ASC
                 LIMIT ?2"
            ))?;
            let mut rows = stmt.query(params![session_id, limit])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
        .await
    }

    pub async fn count_unsynced_events(&self, session_id: &str) -> Result<u64> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM session_events WHERE session_id = ?1 AND sync_status <> 'synced'",
                params![session_id],
                |row| row.get(0),
            )?;
            to_u64(count, "count")
        })
        .await
    }

    /// Flip a whole acknowledged batch to `synced` in one transaction.
    pub async fn mark_events_synced(&self, event_ids: Vec<String>) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare("UPDATE session_events SET sync_status = 'synced' WHERE id = ?1")?;
                for id in &event_ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit().context("failed to mark events synced")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::db::models::Session;
    use crate::db::test_support::temp_db;

    #[tokio::test]
    async fn appended_events_read_back_in_sequence_order() {
        let (_dir, db) = temp_db();
        let now = Utc::now();
        let session = Session::begin("s1".into(), now);
        db.insert_session_with_start(&session, NewEvent::lifecycle(EventType::Start, now))
            .await
            .expect("insert");

        db.append_events(
            "s1",
            vec![
                NewEvent::distraction(now, "Slack", 12, Some(json!({ "blockMode": "soft-warn" }))),
                NewEvent::lifecycle(EventType::Pause, now),
            ],
        )
        .await
        .expect("append");
        db.append_events("s1", vec![NewEvent::lifecycle(EventType::Resume, now)])
            .await
            .expect("append");

        let events = db.list_events("s1").await.expect("list");
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::Start,
                EventType::Distraction,
                EventType::Pause,
                EventType::Resume
            ]
        );
        let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(events[1].duration_seconds, Some(12));
        assert_eq!(events[1].metadata, Some(json!({ "blockMode": "soft-warn" })));
    }

    #[tokio::test]
    async fn only_sync_status_may_change() {
        let (_dir, db) = temp_db();
        let now = Utc::now();
        let session = Session::begin("s1".into(), now);
        let start = db
            .insert_session_with_start(&session, NewEvent::lifecycle(EventType::Start, now))
            .await
            .expect("insert");

        assert_eq!(db.count_unsynced_events("s1").await.expect("count"), 1);
        db.mark_events_synced(vec![start.id.clone()])
            .await
            .expect("mark");
        assert_eq!(db.count_unsynced_events("s1").await.expect("count"), 0);

        let id = start.id.clone();
        let tampered = db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE session_events SET app_name = 'x' WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await;
        assert!(tampered.is_err());
    }
}
