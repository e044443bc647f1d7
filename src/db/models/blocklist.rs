//! Blocklist policy units.
//!
//! A blocked target is either a process (bundle identifier, or WM_CLASS on
//! Linux) or a domain, never both. The enum makes that structural; the
//! table backs it with a CHECK constraint.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BlockMode {
    SoftWarn,
    HardBlock,
    TimedLock,
}

impl BlockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockMode::SoftWarn => "soft-warn",
            BlockMode::HardBlock => "hard-block",
            BlockMode::TimedLock => "timed-lock",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "soft-warn" => Ok(BlockMode::SoftWarn),
            "hard-block" => Ok(BlockMode::HardBlock),
            "timed-lock" => Ok(BlockMode::TimedLock),
            other => Err(anyhow!("unknown block mode '{other}'")),
        }
    }

    pub fn terminates_process(&self) -> bool {
        matches!(self, BlockMode::HardBlock | BlockMode::TimedLock)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum BlockTarget {
    Process { bundle_id: String },
    Domain { domain: String },
}

impl BlockTarget {
    pub fn process(bundle_id: &str) -> Result<Self> {
        let bundle_id = bundle_id.trim();
        if bundle_id.is_empty() {
            bail!("bundle identifier must not be empty");
        }
        Ok(BlockTarget::Process {
            bundle_id: bundle_id.to_string(),
        })
    }

    pub fn domain(raw: &str) -> Result<Self> {
        Ok(BlockTarget::Domain {
            domain: normalize_domain(raw)?,
        })
    }

    pub fn bundle_id(&self) -> Option<&str> {
        match self {
            BlockTarget::Process { bundle_id } => Some(bundle_id),
            BlockTarget::Domain { .. } => None,
        }
    }

    pub fn domain_name(&self) -> Option<&str> {
        match self {
            BlockTarget::Process { .. } => None,
            BlockTarget::Domain { domain } => Some(domain),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlocklistItem {
    pub id: String,
    pub target: BlockTarget,
    pub display_name: String,
    pub enabled: bool,
    pub mode: BlockMode,
    pub created_at: DateTime<Utc>,
}

/// Reduce user input like `https://www.Reddit.com/r/rust` to `reddit.com`.
pub fn normalize_domain(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("domain must not be empty");
    }

    let host = if trimmed.contains("://") {
        let parsed = url::Url::parse(trimmed).map_err(|err| anyhow!("invalid url '{raw}': {err}"))?;
        parsed
            .host_str()
            .ok_or_else(|| anyhow!("url '{raw}' has no host"))?
            .to_string()
    } else {
        let without_path = trimmed.split(['/', '?', '#']).next().unwrap_or(trimmed);
        without_path
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map(|(host, _)| host)
            .unwrap_or(without_path)
            .to_string()
    };

    let mut host = host.trim_end_matches('.').to_ascii_lowercase();
    if let Some(stripped) = host.strip_prefix("www.") {
        host = stripped.to_string();
    }

    if host.is_empty() || host.len() > 253 {
        bail!("invalid domain '{raw}'");
    }
    let labels_ok = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });
    if !labels_ok {
        bail!("invalid domain '{raw}'");
    }

    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_user_entered_domains() {
        assert_eq!(normalize_domain("Reddit.com").ok().as_deref(), Some("reddit.com"));
        assert_eq!(
            normalize_domain("https://www.youtube.com/watch?v=1").ok().as_deref(),
            Some("youtube.com")
        );
        assert_eq!(normalize_domain("news.ycombinator.com.").ok().as_deref(), Some("news.ycombinator.com"));
        assert_eq!(normalize_domain("example.org:8080/path").ok().as_deref(), Some("example.org"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize_domain("   ").is_err());
        assert!(normalize_domain("bad..domain").is_err());
        assert!(normalize_domain("spa ce.com").is_err());
        assert!(BlockTarget::process("  ").is_err());
    }

    #[test]
    fn block_mode_round_trips_through_storage_strings() {
        for mode in [BlockMode::SoftWarn, BlockMode::HardBlock, BlockMode::TimedLock] {
            assert_eq!(BlockMode::parse(mode.as_str()).ok(), Some(mode));
        }
        assert!(!BlockMode::SoftWarn.terminates_process());
        assert!(BlockMode::TimedLock.terminates_process());
    }
}
