use std::sync::Mutex;

use super::{AppIdentity, ForegroundProbe};

#[derive(Debug, Default)]
struct ScriptState {
    frontmost: Option<AppIdentity>,
    idle_seconds: Option<u64>,
}

/// Probe whose answers are set by the caller. Used by tests and by the
/// daemon when it runs headless.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    state: Mutex<ScriptState>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_frontmost(&self, app: Option<AppIdentity>) {
        self.with_state(|state| state.frontmost = app);
    }

    pub fn set_idle_seconds(&self, idle: Option<u64>) {
        self.with_state(|state| state.idle_seconds = idle);
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl ForegroundProbe for ScriptedProbe {
    fn frontmost_app(&self) -> Option<AppIdentity> {
        self.with_state(|state| state.frontmost.clone())
    }

    fn idle_seconds(&self) -> Option<u64> {
        self.with_state(|state| state.idle_seconds)
    }
}
