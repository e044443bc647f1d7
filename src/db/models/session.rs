//! Session-related data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sync::{SyncStatus, Syncable};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub remote_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub focused_seconds: u64,
    pub distraction_count: u32,
    pub is_complete: bool,
    /// The process died while this session was active; it was closed on the
    /// next launch instead of by an explicit stop.
    pub interrupted: bool,
    pub sync_status: SyncStatus,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn begin(id: String, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            remote_id: None,
            start_time,
            end_time: None,
            duration_seconds: 0,
            focused_seconds: 0,
            distraction_count: 0,
            is_complete: false,
            interrupted: false,
            sync_status: SyncStatus::Local,
            updated_at: start_time,
        }
    }
}

impl Syncable for Session {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Counters written by periodic checkpoints and on finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounters {
    pub duration_seconds: u64,
    pub focused_seconds: u64,
    pub distraction_count: u32,
}

impl SessionCounters {
    /// Clamp focused time so it never exceeds the session length.
    pub fn normalized(self) -> Self {
        Self {
            focused_seconds: self.focused_seconds.min(self.duration_seconds),
            ..self
        }
    }
}
