//! Projects and tasks: user-managed entities that ride along with sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sync::{SyncStatus, Syncable};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub remote_id: Option<String>,
    pub name: String,
    pub sync_status: SyncStatus,
    pub updated_at: DateTime<Utc>,
}

impl Syncable for Project {
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

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub remote_id: Option<String>,
    /// Local id of the owning project.
    pub project_id: Option<String>,
    pub title: String,
    pub estimate_minutes: Option<u32>,
    /// 0 = low, 1 = medium, 2 = high, 3 = urgent
    pub priority: u8,
    /// 0 = todo, 1 = in progress, 2 = done
    pub status: u8,
    pub due_date: Option<DateTime<Utc>>,
    pub sort_order: i64,
    pub sync_status: SyncStatus,
    pub updated_at: DateTime<Utc>,
}

impl Syncable for Task {
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

/// Editable task fields, used both for local edits and remote upserts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskFields {
    pub project_id: Option<String>,
    pub title: String,
    pub estimate_minutes: Option<u32>,
    pub priority: u8,
    pub status: u8,
    pub due_date: Option<DateTime<Utc>>,
    pub sort_order: i64,
}

/// What a remote upsert did to the local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Overwritten,
    /// The local row holds an unsynced edit newer than the remote copy.
    KeptLocal,
}
