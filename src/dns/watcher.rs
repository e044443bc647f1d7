use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use log::{info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::enforcement::read_snapshot;

use super::blocklist::{DnsBlocklist, SharedBlocklist};

/// Read the snapshot at `path`. Anything unreadable means "block nothing".
pub fn load_blocklist(path: &Path) -> DnsBlocklist {
    match read_snapshot(path) {
        Ok(snapshot) => DnsBlocklist::new(snapshot.version, snapshot.domains),
        Err(err) => {
            warn!("Domain snapshot unavailable, blocking nothing: {err:#}");
            DnsBlocklist::default()
        }
    }
}

/// Keeps a [`SharedBlocklist`] in step with the snapshot file written by the
/// main process.
pub struct SnapshotWatcher {
    path: PathBuf,
    blocklist: Arc<SharedBlocklist>,
    _watcher: RecommendedWatcher,
}

impl SnapshotWatcher {
    pub fn start(path: PathBuf) -> Result<Self> {
        let blocklist = Arc::new(SharedBlocklist::new(load_blocklist(&path)));
        info!(
            "Loaded {} blocked domain(s) from {}",
            blocklist.current().len(),
            path.display()
        );

        // The writer renames over the file, so the directory is what has to
        // be watched.
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .context("snapshot path has no parent directory")?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .context("snapshot path has no file name")?;

        let target = blocklist.clone();
        let reload_path = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!("Snapshot watch error: {err}");
                    return;
                }
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            let touches_snapshot = event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()));
            if touches_snapshot {
                let next = load_blocklist(&reload_path);
                if next != *target.current() {
                    info!(
                        "Domain snapshot v{} loaded ({} domain(s))",
                        next.version(),
                        next.len()
                    );
                    target.replace(next);
                }
            }
        })
        .context("failed to create snapshot watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        Ok(Self {
            path,
            blocklist,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blocklist(&self) -> Arc<SharedBlocklist> {
        self.blocklist.clone()
    }
}
