use std::sync::Arc;

use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::platform::{AppIdentity, ForegroundProbe};

use super::idle::IdleDetector;
use super::{ActivityEvent, ActivitySink};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = false;

use crate::{log_debug, log_info, log_warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Edge detector over raw probe samples. Kept apart from the loop so the
/// transitions can be tested without timers.
#[derive(Debug, Default)]
pub(crate) struct PollState {
    last_bundle_id: Option<String>,
    idle: bool,
    idle_peak: u64,
}

impl PollState {
    pub(crate) fn observe(
        &mut self,
        app: Option<AppIdentity>,
        idle_seconds: Option<u64>,
        detector: &IdleDetector,
    ) -> Vec<ActivityEvent> {
        let mut events = Vec::new();
        let user_idle = detector.exceeds_threshold(idle_seconds);
        let idle_seconds = idle_seconds.unwrap_or(0);

        if user_idle {
            self.idle_peak = self.idle_peak.max(idle_seconds);
            if !self.idle {
                self.idle = true;
                events.push(ActivityEvent::IdleBegan { idle_seconds });
            }
        } else if self.idle {
            self.idle = false;
            events.push(ActivityEvent::IdleEnded {
                idle_seconds: self.idle_peak,
            });
            self.idle_peak = 0;
            // Re-evaluate the current app once the user is back.
            self.last_bundle_id = None;
        }

        // No frontmost app is "no signal", never a switch.
        if let Some(app) = app {
            if self.last_bundle_id.as_deref() != Some(app.bundle_id.as_str()) {
                self.last_bundle_id = Some(app.bundle_id.clone());
                events.push(ActivityEvent::AppSwitch { app, user_idle });
            }
        }

        events
    }
}

pub async fn activity_loop(
    probe: Arc<dyn ForegroundProbe>,
    detector: IdleDetector,
    sink: Box<dyn ActivitySink>,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = PollState::default();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log_info!("activity loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let probe = probe.clone();
                let sample = tokio::time::timeout(
                    PROBE_TIMEOUT,
                    tokio::task::spawn_blocking(move || (probe.frontmost_app(), probe.idle_seconds())),
                )
                .await;

                let (app, idle_seconds) = match sample {
                    Ok(Ok(sample)) => sample,
                    Ok(Err(err)) => {
                        log_warn!("activity probe panicked: {err}");
                        continue;
                    }
                    Err(_) => {
                        log_warn!("activity probe timed out (> {}s)", PROBE_TIMEOUT.as_secs());
                        continue;
                    }
                };

                // A cancel that lands while the probe runs wins over its result.
                if cancel_token.is_cancelled() {
                    break;
                }

                for event in state.observe(app, idle_seconds, &detector) {
                    log_debug!("activity event: {event:?}");
                    if !sink.emit(event) {
                        log_info!("activity sink closed, stopping loop");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ScriptedProbe;

    fn detector() -> IdleDetector {
        IdleDetector::new(Arc::new(ScriptedProbe::new()))
    }

    #[test]
    fn emits_only_on_identifier_changes() {
        let detector = detector();
        let mut state = PollState::default();
        let code = AppIdentity::new("Code", "code");

        assert_eq!(state.observe(Some(code.clone()), Some(0), &detector).len(), 1);
        assert!(state.observe(Some(code.clone()), Some(1), &detector).is_empty());
        assert!(state.observe(None, None, &detector).is_empty());
        assert!(state.observe(Some(code), Some(2), &detector).is_empty());

        let events = state.observe(Some(AppIdentity::new("Slack", "slack")), Some(0), &detector);
        assert!(matches!(
            events.as_slice(),
            [ActivityEvent::AppSwitch { app, user_idle: false }] if app.bundle_id == "slack"
        ));
    }

    #[test]
    fn idle_edges_and_re_evaluation() {
        let detector = detector();
        let mut state = PollState::default();
        let code = AppIdentity::new("Code", "code");

        state.observe(Some(code.clone()), Some(0), &detector);
        let began = state.observe(Some(code.clone()), Some(300), &detector);
        assert_eq!(began, vec![ActivityEvent::IdleBegan { idle_seconds: 300 }]);
        assert!(state.observe(Some(code.clone()), Some(420), &detector).is_empty());

        let ended = state.observe(Some(code.clone()), Some(0), &detector);
        assert_eq!(
            ended,
            vec![
                ActivityEvent::IdleEnded { idle_seconds: 420 },
                ActivityEvent::AppSwitch { app: code, user_idle: false },
            ]
        );
    }
}
