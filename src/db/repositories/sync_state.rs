use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime},
};

pub const LAST_SYNC_AT: &str = "last_sync_at";
pub const LAST_FULL_RECONCILE_AT: &str = "last_full_reconcile_at";

impl Database {
    pub async fn get_sync_marker(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let key = key.to_string();
        self.execute(move |conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM sync_state WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            value.map(|raw| parse_datetime(&raw, &key)).transpose()
        })
        .await
    }

    pub async fn set_sync_marker(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let key = key.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, format_datetime(&at)],
            )?;
            Ok(())
        })
        .await
    }
}
