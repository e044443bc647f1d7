//! File handoff of the enabled-domain set to the DNS process.
//!
//! The file is only ever replaced whole: it is written to a sibling temp file
//! and renamed over the target, so a reader sees either the previous or the
//! next snapshot. The rename doubles as the change notification watched by
//! `tether-dns`.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSnapshot {
    pub version: u64,
    pub written_at: DateTime<Utc>,
    /// Sorted, normalised, deduplicated.
    pub domains: Vec<String>,
}

pub fn read_snapshot(path: &Path) -> Result<DomainSnapshot> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read domain snapshot {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("corrupt domain snapshot {}", path.display()))
}

pub struct SnapshotWriter {
    path: PathBuf,
    version: u64,
}

impl SnapshotWriter {
    /// Continues numbering from an existing snapshot so versions stay
    /// increasing across restarts.
    pub fn new(path: PathBuf) -> Self {
        let version = read_snapshot(&path).map(|s| s.version).unwrap_or(0);
        Self { path, version }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, domains: &[String]) -> Result<DomainSnapshot> {
        let mut domains = domains.to_vec();
        domains.sort();
        domains.dedup();

        let snapshot = DomainSnapshot {
            version: self.version + 1,
            written_at: Utc::now(),
            domains,
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".into());
        let tmp_path = parent.join(format!(".{file_name}.tmp"));

        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(serde_json::to_string_pretty(&snapshot)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to move snapshot into place at {}",
                self.path.display()
            )
        })?;

        self.version = snapshot.version;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_increase_across_writers() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("domains.json");

        let mut writer = SnapshotWriter::new(path.clone());
        let first = writer
            .write(&["reddit.com".into(), "news.ycombinator.com".into(), "reddit.com".into()])
            .expect("write");
        assert_eq!(first.version, 1);
        assert_eq!(first.domains, vec!["news.ycombinator.com", "reddit.com"]);

        let mut reopened = SnapshotWriter::new(path.clone());
        let second = reopened.write(&[]).expect("write");
        assert_eq!(second.version, 2);

        let on_disk = read_snapshot(&path).expect("read");
        assert_eq!(on_disk, second);
        assert!(!dir.path().join(".domains.json.tmp").exists());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("domains.json");
        fs::write(&path, "[}").expect("write");
        assert!(read_snapshot(&path).is_err());
        assert_eq!(SnapshotWriter::new(path).version, 0);
    }
}
