use std::{collections::HashSet, sync::Arc, time::Duration};

use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{clock::SharedClock, db::BlockMode, platform::AppIdentity};

use super::{
    countdown::{remaining_secs, spawn_countdown, TIMED_LOCK_COOLDOWN},
    policy::BlocklistPolicy,
    process::ProcessTerminator,
};

/// What the block overlay should show. `None` on the channel means hidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockOverlay {
    pub id: u64,
    pub app_name: String,
    pub bundle_id: String,
    pub mode: BlockMode,
    /// Whole seconds left on a timed lock.
    pub countdown_remaining: Option<u64>,
    pub override_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecision {
    Allow,
    Enforced { mode: BlockMode },
}

impl BlockDecision {
    pub fn mode(&self) -> Option<BlockMode> {
        match self {
            BlockDecision::Allow => None,
            BlockDecision::Enforced { mode } => Some(*mode),
        }
    }
}

struct TimedLock {
    overlay_id: u64,
    bundle_id: String,
    started_at: Duration,
    cancel: CancellationToken,
}

/// Process-level enforcement for one device. Owned by the session task, so
/// it takes `&mut self` and holds no locks of its own.
pub struct EnforcementEngine {
    policy: watch::Receiver<Arc<BlocklistPolicy>>,
    terminator: Arc<dyn ProcessTerminator>,
    clock: SharedClock,
    overlay: Arc<watch::Sender<Option<BlockOverlay>>>,
    active: bool,
    next_overlay_id: u64,
    lock: Option<TimedLock>,
}

impl EnforcementEngine {
    pub fn new(
        policy: watch::Receiver<Arc<BlocklistPolicy>>,
        terminator: Arc<dyn ProcessTerminator>,
        clock: SharedClock,
    ) -> Self {
        let (overlay, _rx) = watch::channel(None);
        Self {
            policy,
            terminator,
            clock,
            overlay: Arc::new(overlay),
            active: false,
            next_overlay_id: 0,
            lock: None,
        }
    }

    pub fn overlay(&self) -> watch::Receiver<Option<BlockOverlay>> {
        self.overlay.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        self.active = true;
        info!("Enforcement active");
    }

    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.clear();
        info!("Enforcement inactive");
    }

    pub fn on_app_switch(&mut self, app: &AppIdentity, exemptions: &HashSet<String>) -> BlockDecision {
        if !self.active || exemptions.contains(&app.bundle_id) {
            return BlockDecision::Allow;
        }
        let Some(mode) = self.policy.borrow().mode_for(&app.bundle_id) else {
            return BlockDecision::Allow;
        };

        if mode.terminates_process() {
            self.terminate(app);
        }

        self.next_overlay_id += 1;
        let overlay_id = self.next_overlay_id;
        let countdown = (mode == BlockMode::TimedLock).then_some(TIMED_LOCK_COOLDOWN.as_secs());

        if let Some(previous) = self.lock.take() {
            previous.cancel.cancel();
        }
        self.overlay.send_replace(Some(BlockOverlay {
            id: overlay_id,
            app_name: app.name.clone(),
            bundle_id: app.bundle_id.clone(),
            mode,
            countdown_remaining: countdown,
            override_available: false,
        }));

        if mode == BlockMode::TimedLock {
            let started_at = self.clock.monotonic();
            let cancel = CancellationToken::new();
            spawn_countdown(
                self.clock.clone(),
                started_at,
                overlay_id,
                self.overlay.clone(),
                cancel.clone(),
            );
            self.lock = Some(TimedLock {
                overlay_id,
                bundle_id: app.bundle_id.clone(),
                started_at,
                cancel,
            });
        }

        info!("Blocked {} ({})", app.bundle_id, mode.as_str());
        BlockDecision::Enforced { mode }
    }

    /// Whether the current timed lock has run its full cooldown.
    pub fn override_available(&self) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| remaining_secs(&self.clock, lock.started_at) == 0)
    }

    /// Consume an available override. Returns the bundle id the user chose
    /// to keep using, which the caller exempts for the rest of the session.
    pub fn take_override(&mut self) -> Option<String> {
        if !self.override_available() {
            return None;
        }
        let lock = self.lock.take()?;
        lock.cancel.cancel();
        self.overlay
            .send_if_modified(|current| hide_if(current, lock.overlay_id));
        Some(lock.bundle_id)
    }

    pub fn dismiss_overlay(&mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.cancel.cancel();
        }
        self.overlay.send_if_modified(|current| current.take().is_some());
    }

    fn terminate(&self, app: &AppIdentity) {
        let terminator = self.terminator.clone();
        let app = app.clone();
        // sysinfo scans can take a while; keep them off the session task.
        tokio::task::spawn_blocking(move || {
            if let Err(err) = terminator.terminate(&app) {
                warn!("Failed to terminate {}: {err:#}", app.bundle_id);
            }
        });
    }
}

impl Drop for EnforcementEngine {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.cancel.cancel();
        }
    }
}

fn hide_if(current: &mut Option<BlockOverlay>, overlay_id: u64) -> bool {
    if current.as_ref().is_some_and(|o| o.id == overlay_id) {
        *current = None;
        true
    } else {
        false
    }
}
