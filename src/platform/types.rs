use serde::{Deserialize, Serialize};

/// Identity of the foreground application as the platform reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIdentity {
    pub name: String,
    /// Stable identifier: bundle id on macOS, WM_CLASS instance on X11.
    pub bundle_id: String,
    pub pid: Option<u32>,
}

impl AppIdentity {
    pub fn new(name: impl Into<String>, bundle_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bundle_id: bundle_id.into(),
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// Source of foreground and idle signals. `None` means "no signal this tick".
pub trait ForegroundProbe: Send + Sync {
    fn frontmost_app(&self) -> Option<AppIdentity>;
    fn idle_seconds(&self) -> Option<u64>;
}

/// Probe for hosts without a usable window system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl ForegroundProbe for NullProbe {
    fn frontmost_app(&self) -> Option<AppIdentity> {
        None
    }

    fn idle_seconds(&self) -> Option<u64> {
        None
    }
}
