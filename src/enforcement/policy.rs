use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Result;
use log::{info, warn};
use tokio::sync::{watch, Mutex};

use crate::db::{BlockMode, BlockTarget, BlocklistItem, Database};

use super::handoff::SnapshotWriter;

/// Immutable view of the enabled blocklist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlocklistPolicy {
    processes: HashMap<String, BlocklistItem>,
    domains: Vec<String>,
}

impl BlocklistPolicy {
    pub fn from_items(items: impl IntoIterator<Item = BlocklistItem>) -> Self {
        let mut processes = HashMap::new();
        let mut domains = Vec::new();
        for item in items.into_iter().filter(|item| item.enabled) {
            match &item.target {
                BlockTarget::Process { bundle_id } => {
                    processes.insert(bundle_id.to_lowercase(), item.clone());
                }
                BlockTarget::Domain { domain } => domains.push(domain.clone()),
            }
        }
        domains.sort();
        domains.dedup();
        Self { processes, domains }
    }

    pub fn process_rule(&self, bundle_id: &str) -> Option<&BlocklistItem> {
        self.processes.get(&bundle_id.to_lowercase())
    }

    pub fn mode_for(&self, bundle_id: &str) -> Option<BlockMode> {
        self.process_rule(bundle_id).map(|item| item.mode)
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty() && self.domains.is_empty()
    }
}

/// Blocklist CRUD. Every change republishes the policy; a change to the
/// domain set also rewrites the DNS handoff file.
pub struct PolicyService {
    db: Database,
    tx: watch::Sender<Arc<BlocklistPolicy>>,
    writer: Mutex<SnapshotWriter>,
}

impl PolicyService {
    pub async fn load(db: Database, snapshot_path: PathBuf) -> Result<Self> {
        let policy = BlocklistPolicy::from_items(db.list_enabled_blocklist_items().await?);
        let mut writer = SnapshotWriter::new(snapshot_path);
        let snapshot = writer.write(policy.domains())?;
        info!(
            "Blocklist loaded: {} process rules, {} domains (snapshot v{})",
            policy.processes.len(),
            policy.domains.len(),
            snapshot.version
        );

        let (tx, _rx) = watch::channel(Arc::new(policy));
        Ok(Self {
            db,
            tx,
            writer: Mutex::new(writer),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<BlocklistPolicy>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<BlocklistPolicy> {
        self.tx.borrow().clone()
    }

    pub async fn list(&self) -> Result<Vec<BlocklistItem>> {
        self.db.list_blocklist_items().await
    }

    pub async fn block_process(
        &self,
        bundle_id: &str,
        display_name: &str,
        mode: BlockMode,
    ) -> Result<BlocklistItem> {
        let item = self
            .db
            .insert_blocklist_item(BlockTarget::process(bundle_id)?, display_name, mode)
            .await?;
        self.refresh().await?;
        Ok(item)
    }

    pub async fn block_domain(
        &self,
        domain: &str,
        display_name: &str,
        mode: BlockMode,
    ) -> Result<BlocklistItem> {
        let item = self
            .db
            .insert_blocklist_item(BlockTarget::domain(domain)?, display_name, mode)
            .await?;
        self.refresh().await?;
        Ok(item)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.db.set_blocklist_item_enabled(id, enabled).await?;
        self.refresh().await
    }

    pub async fn set_mode(&self, id: &str, mode: BlockMode) -> Result<()> {
        self.db.set_blocklist_item_mode(id, mode).await?;
        self.refresh().await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.db.delete_blocklist_item(id).await?;
        self.refresh().await
    }

    /// Rebuild from the database and publish.
    pub async fn refresh(&self) -> Result<()> {
        let policy = BlocklistPolicy::from_items(self.db.list_enabled_blocklist_items().await?);

        let mut writer = self.writer.lock().await;
        let domains_changed = self.tx.borrow().domains() != policy.domains();
        if domains_changed {
            match writer.write(policy.domains()) {
                Ok(snapshot) => info!(
                    "Domain snapshot v{} written with {} domains",
                    snapshot.version,
                    snapshot.domains.len()
                ),
                Err(err) => warn!("Failed to write domain snapshot: {err:#}"),
            }
        }
        self.tx.send_replace(Arc::new(policy));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use crate::enforcement::handoff::read_snapshot;

    #[tokio::test]
    async fn domain_changes_rewrite_the_snapshot() {
        let (dir, db) = temp_db();
        let path = dir.path().join("domains.json");
        let service = PolicyService::load(db, path.clone()).await.expect("load");
        assert_eq!(read_snapshot(&path).expect("snapshot").version, 1);

        let mut rx = service.subscribe();
        let item = service
            .block_domain("www.reddit.com", "Reddit", BlockMode::HardBlock)
            .await
            .expect("block");
        assert!(rx.has_changed().expect("channel open"));
        assert_eq!(rx.borrow_and_update().domains(), ["reddit.com".to_string()]);

        let snapshot = read_snapshot(&path).expect("snapshot");
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.domains, vec!["reddit.com"]);

        service
            .block_process("slack", "Slack", BlockMode::SoftWarn)
            .await
            .expect("block");
        assert_eq!(
            read_snapshot(&path).expect("snapshot").version,
            2,
            "process-only changes leave the domain file alone"
        );
        assert_eq!(service.current().mode_for("Slack"), Some(BlockMode::SoftWarn));

        service.set_enabled(&item.id, false).await.expect("disable");
        let snapshot = read_snapshot(&path).expect("snapshot");
        assert_eq!(snapshot.version, 3);
        assert!(snapshot.domains.is_empty());
    }
}
