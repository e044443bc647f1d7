pub mod controller;
pub mod idle;
pub mod loop_worker;

pub use controller::ActivityMonitor;
pub use idle::{IdleDetector, IDLE_THRESHOLD};
pub use loop_worker::POLL_INTERVAL;

use tokio::sync::mpsc;

use crate::platform::AppIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    AppSwitch { app: AppIdentity, user_idle: bool },
    IdleBegan { idle_seconds: u64 },
    IdleEnded { idle_seconds: u64 },
}

/// Where the monitor delivers events. Returns `false` once nobody listens.
pub trait ActivitySink: Send + Sync + 'static {
    fn emit(&self, event: ActivityEvent) -> bool;
}

impl ActivitySink for mpsc::UnboundedSender<ActivityEvent> {
    fn emit(&self, event: ActivityEvent) -> bool {
        self.send(event).is_ok()
    }
}
