use std::{sync::Arc, time::Duration};

use crate::platform::ForegroundProbe;

/// Input inactivity after which the user counts as away.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct IdleDetector {
    probe: Arc<dyn ForegroundProbe>,
    threshold: Duration,
}

impl IdleDetector {
    pub fn new(probe: Arc<dyn ForegroundProbe>) -> Self {
        Self::with_threshold(probe, IDLE_THRESHOLD)
    }

    pub fn with_threshold(probe: Arc<dyn ForegroundProbe>, threshold: Duration) -> Self {
        Self { probe, threshold }
    }

    /// Seconds since the last user input, if the platform can tell.
    pub fn idle_seconds(&self) -> Option<u64> {
        self.probe.idle_seconds()
    }

    pub fn is_idle(&self) -> bool {
        self.exceeds_threshold(self.idle_seconds())
    }

    pub fn exceeds_threshold(&self, idle_seconds: Option<u64>) -> bool {
        idle_seconds.is_some_and(|secs| secs >= self.threshold.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ScriptedProbe;

    #[test]
    fn threshold_is_inclusive_and_unknown_means_active() {
        let probe = Arc::new(ScriptedProbe::new());
        let detector = IdleDetector::new(probe.clone());
        assert!(!detector.is_idle());

        probe.set_idle_seconds(Some(299));
        assert!(!detector.is_idle());
        probe.set_idle_seconds(Some(300));
        assert!(detector.is_idle());
        assert_eq!(detector.idle_seconds(), Some(300));
    }
}
