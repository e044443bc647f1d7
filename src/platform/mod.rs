pub mod scripted;
pub mod types;

pub use scripted::ScriptedProbe;
pub use types::{AppIdentity, ForegroundProbe, NullProbe};

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxProbe;

use std::sync::Arc;

/// Best probe available on this host, falling back to [`NullProbe`].
pub fn native_probe() -> Arc<dyn ForegroundProbe> {
    #[cfg(target_os = "linux")]
    {
        match LinuxProbe::connect() {
            Ok(probe) => return Arc::new(probe),
            Err(err) => log::warn!("X11 probe unavailable, running without app signals: {err:#}"),
        }
    }
    Arc::new(NullProbe)
}
