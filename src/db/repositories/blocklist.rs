use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime},
    models::{BlockMode, BlockTarget, BlocklistItem},
};

const BLOCKLIST_COLUMNS: &str = "id, bundle_id, domain, display_name, enabled, block_mode, created_at";

fn row_to_item(row: &Row) -> Result<BlocklistItem> {
    let bundle_id: Option<String> = row.get("bundle_id")?;
    let domain: Option<String> = row.get("domain")?;
    let mode: String = row.get("block_mode")?;
    let created_at: String = row.get("created_at")?;

    let target = match (bundle_id, domain) {
        (Some(bundle_id), None) => BlockTarget::Process { bundle_id },
        (None, Some(domain)) => BlockTarget::Domain { domain },
        _ => return Err(anyhow!("blocklist row must target a process or a domain")),
    };

    Ok(BlocklistItem {
        id: row.get("id")?,
        target,
        display_name: row.get("display_name")?,
        enabled: row.get("enabled")?,
        mode: BlockMode::parse(&mode)?,
        created_at: parse_datetime(&created_at, "created_at")?,
    })
}

impl Database {
    pub async fn insert_blocklist_item(
        &self,
        target: BlockTarget,
        display_name: &str,
        mode: BlockMode,
    ) -> Result<BlocklistItem> {
        let display_name = match display_name.trim() {
            "" => match &target {
                BlockTarget::Process { bundle_id } => bundle_id.clone(),
                BlockTarget::Domain { domain } => domain.clone(),
            },
            name => name.to_string(),
        };
        let item = BlocklistItem {
            id: Uuid::new_v4().to_string(),
            target,
            display_name,
            enabled: true,
            mode,
            created_at: Utc::now(),
        };
        let record = item.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO blocklist_items (id, bundle_id, domain, display_name, enabled, block_mode, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id,
                    record.target.bundle_id(),
                    record.target.domain_name(),
                    record.display_name,
                    record.enabled,
                    record.mode.as_str(),
                    format_datetime(&record.created_at),
                ],
            )
            .context("failed to insert blocklist item (is the target already listed?)")?;
            Ok(())
        })
        .await?;
        Ok(item)
    }

    pub async fn list_blocklist_items(&self) -> Result<Vec<BlocklistItem>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BLOCKLIST_COLUMNS} FROM blocklist_items ORDER BY created_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(row_to_item(row)?);
            }
            Ok(items)
        })
        .await
    }

    pub async fn list_enabled_blocklist_items(&self) -> Result<Vec<BlocklistItem>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BLOCKLIST_COLUMNS} FROM blocklist_items WHERE enabled = 1 ORDER BY created_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(row_to_item(row)?);
            }
            Ok(items)
        })
        .await
    }

    pub async fn set_blocklist_item_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let id = id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE blocklist_items SET enabled = ?1 WHERE id = ?2",
                params![enabled, id],
            )?;
            if changed == 0 {
                bail!("blocklist item {id} not found");
            }
            Ok(())
        })
        .await
    }

    pub async fn set_blocklist_item_mode(&self, id: &str, mode: BlockMode) -> Result<()> {
        let id = id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE blocklist_items SET block_mode = ?1 WHERE id = ?2",
                params![mode.as_str(), id],
            )?;
            if changed == 0 {
                bail!("blocklist item {id} not found");
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_blocklist_item(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.execute(move |conn| {
            conn.execute("DELETE FROM blocklist_items WHERE id = ?1", params![id])
                .context("failed to delete blocklist item")?;
            Ok(())
        })
        .await
    }
}
