//! Sync bookkeeping shared by every entity that crosses the backend boundary.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Local,
    PendingUpload,
    PendingUpdate,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::PendingUpload => "pendingUpload",
            SyncStatus::PendingUpdate => "pendingUpdate",
            SyncStatus::Synced => "synced",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "local" => Ok(SyncStatus::Local),
            "pendingUpload" => Ok(SyncStatus::PendingUpload),
            "pendingUpdate" => Ok(SyncStatus::PendingUpdate),
            "synced" => Ok(SyncStatus::Synced),
            other => Err(anyhow!("unknown sync status '{other}'")),
        }
    }

    /// Status an entity takes after it is modified locally.
    pub fn after_local_change(self) -> Self {
        match self {
            SyncStatus::Synced | SyncStatus::PendingUpdate => SyncStatus::PendingUpdate,
            SyncStatus::Local => SyncStatus::Local,
            SyncStatus::PendingUpload => SyncStatus::PendingUpload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Create,
    Update,
}

/// The shape Session, Task and Project share at the sync boundary.
pub trait Syncable {
    fn local_id(&self) -> &str;
    fn remote_id(&self) -> Option<&str>;
    fn sync_status(&self) -> SyncStatus;
    fn last_modified(&self) -> DateTime<Utc>;

    /// Create vs. update is decided by the presence of a remote id, not by the
    /// status alone: a row whose create succeeded but whose status write was
    /// lost must never be created twice.
    fn sync_action(&self) -> Option<SyncAction> {
        if self.sync_status() == SyncStatus::Synced {
            return None;
        }
        match self.remote_id() {
            Some(_) => Some(SyncAction::Update),
            None => Some(SyncAction::Create),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row {
        remote: Option<String>,
        status: SyncStatus,
    }

    impl Syncable for Row {
        fn local_id(&self) -> &str {
            "row"
        }
        fn remote_id(&self) -> Option<&str> {
            self.remote.as_deref()
        }
        fn sync_status(&self) -> SyncStatus {
            self.status
        }
        fn last_modified(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    #[test]
    fn remote_id_decides_between_create_and_update() {
        let fresh = Row { remote: None, status: SyncStatus::PendingUpload };
        assert_eq!(fresh.sync_action(), Some(SyncAction::Create));

        let half_synced = Row {
            remote: Some("r1".into()),
            status: SyncStatus::PendingUpload,
        };
        assert_eq!(half_synced.sync_action(), Some(SyncAction::Update));

        let done = Row { remote: Some("r1".into()), status: SyncStatus::Synced };
        assert_eq!(done.sync_action(), None);
    }

    #[test]
    fn local_change_flips_synced_rows() {
        assert_eq!(SyncStatus::Synced.after_local_change(), SyncStatus::PendingUpdate);
        assert_eq!(SyncStatus::Local.after_local_change(), SyncStatus::Local);
        assert_eq!(SyncStatus::parse("pendingUpdate").ok(), Some(SyncStatus::PendingUpdate));
    }
}
