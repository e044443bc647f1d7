use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use crate::distraction::DistractionScope;

pub const ENV_DATA_DIR: &str = "TETHER_DATA_DIR";
pub const ENV_API_URL: &str = "TETHER_API_URL";
pub const ENV_API_TOKEN: &str = "TETHER_API_TOKEN";
pub const ENV_SETTINGS: &str = "TETHER_SETTINGS";

const DATABASE_FILE: &str = "tether.db";
const SNAPSHOT_FILE: &str = "blocked-domains.json";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub api_base_url: String,
    pub api_token: Option<String>,
    /// Identifier of the app hosting the core; switching to it never counts
    /// as a distraction.
    pub host_bundle_id: String,
    pub data_dir: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
    pub dns_listen_addr: String,
    pub dns_upstream_addr: String,
    pub distraction_scope: DistractionScope,
    pub reachability_probe: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api/v1".into(),
            api_token: None,
            host_bundle_id: "tether".into(),
            data_dir: None,
            snapshot_path: None,
            dns_listen_addr: "127.0.0.1:5353".into(),
            dns_upstream_addr: "1.1.1.1:53".into(),
            distraction_scope: DistractionScope::AnyApp,
            reachability_probe: true,
        }
    }
}

impl Settings {
    /// Environment wins over the file. `lookup` is `std::env::var` in
    /// production.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(token) = lookup(ENV_API_TOKEN).filter(|v| !v.is_empty()) {
            self.api_token = Some(token);
        }
        self
    }

    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.resolved_data_dir()?.join(DATABASE_FILE))
    }

    pub fn resolved_snapshot_path(&self) -> Result<PathBuf> {
        match &self.snapshot_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.resolved_data_dir()?.join(SNAPSHOT_FILE)),
        }
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "tether", "Tether")
        .ok_or_else(|| anyhow!("could not determine project directories"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Settings file location: `TETHER_SETTINGS`, else the data dir.
pub fn default_settings_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(ENV_SETTINGS) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    match std::env::var(ENV_DATA_DIR) {
        Ok(dir) if !dir.is_empty() => Ok(PathBuf::from(dir).join(SETTINGS_FILE)),
        _ => Ok(default_data_dir()?.join(SETTINGS_FILE)),
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = read_settings(&path)?;
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::new(default_settings_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file contents with environment overrides applied.
    pub fn effective(&self) -> Settings {
        self.stored().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn stored(&self) -> Settings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update<F>(&self, apply: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
        self.persist(&guard)?;
        Ok(guard.clone())
    }

    pub fn reload(&self) -> Result<()> {
        let data = read_settings(&self.path)?;
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = data;
        Ok(())
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

fn read_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    match serde_json::from_str(&contents) {
        Ok(settings) => Ok(settings),
        Err(err) => {
            log::warn!(
                "Ignoring unreadable settings file {}: {err}",
                path.display()
            );
            Ok(Settings::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "host_bundle_id": "org.example.host" }"#).expect("write");

        let store = SettingsStore::new(path).expect("load");
        let settings = store.stored();
        assert_eq!(settings.host_bundle_id, "org.example.host");
        assert_eq!(settings.dns_upstream_addr, Settings::default().dns_upstream_addr);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").expect("write");
        let store = SettingsStore::new(path).expect("load");
        assert_eq!(store.stored(), Settings::default());
    }

    #[test]
    fn updates_persist_and_reload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone()).expect("load");
        store
            .update(|s| s.distraction_scope = DistractionScope::BlocklistOnly)
            .expect("update");

        let reopened = SettingsStore::new(path).expect("reload");
        assert_eq!(
            reopened.stored().distraction_scope,
            DistractionScope::BlocklistOnly
        );
    }

    #[test]
    fn environment_overrides_the_file() {
        let settings = Settings::default().with_overrides(|key| match key {
            ENV_API_URL => Some("https://api.example.com/v1".into()),
            ENV_API_TOKEN => Some("secret".into()),
            ENV_DATA_DIR => Some(String::new()),
            _ => None,
        });
        assert_eq!(settings.api_base_url, "https://api.example.com/v1");
        assert_eq!(settings.api_token.as_deref(), Some("secret"));
        assert_eq!(settings.data_dir, None, "empty values are ignored");
    }
}
