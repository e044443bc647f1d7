use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::{
    db::{BlockMode, NewEvent},
    platform::AppIdentity,
};

use super::classifier::{classify, ClassifierContext, Verdict};

/// App name recorded for coarse (foreground/background only) distractions.
pub const BACKGROUND_APP_NAME: &str = "Background";

const MIN_DISTRACTION_SECS: u64 = 1;

#[derive(Debug, Clone)]
struct OpenWindow {
    app_name: String,
    bundle_id: Option<String>,
    opened_at: Duration,
    opened_wall: DateTime<Utc>,
    block_mode: Option<BlockMode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchOutcome {
    /// DISTRACTION event for a window this switch closed.
    pub closed: Option<NewEvent>,
    pub opened: bool,
    pub verdict: Verdict,
}

/// Open distraction window plus the totals of closed ones. All instants are
/// monotonic offsets from the session clock.
#[derive(Debug, Clone, Default)]
pub struct DistractionTracker {
    open: Option<OpenWindow>,
    closed_total: Duration,
    count: u32,
}

impl DistractionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_distracted(&self) -> bool {
        self.open.is_some()
    }

    pub fn open_app(&self) -> Option<&str> {
        self.open.as_ref().map(|w| w.app_name.as_str())
    }

    /// Closed distraction time plus the running portion of an open window.
    pub fn distracted(&self, now: Duration) -> Duration {
        let open = self
            .open
            .as_ref()
            .map(|w| now.saturating_sub(w.opened_at))
            .unwrap_or_default();
        self.closed_total + open
    }

    pub fn on_app_switch(
        &mut self,
        app: &AppIdentity,
        ctx: &ClassifierContext<'_>,
        block_mode: Option<BlockMode>,
        now: Duration,
        wall: DateTime<Utc>,
    ) -> SwitchOutcome {
        if let Some(open) = &self.open {
            if open.bundle_id.as_deref() == Some(app.bundle_id.as_str()) {
                return SwitchOutcome {
                    closed: None,
                    opened: false,
                    verdict: Verdict::Distraction,
                };
            }
        }

        let closed = self.close(now);
        let verdict = classify(app, ctx);
        let opened = verdict == Verdict::Distraction;
        if opened {
            self.open = Some(OpenWindow {
                app_name: app.name.clone(),
                bundle_id: Some(app.bundle_id.clone()),
                opened_at: now,
                opened_wall: wall,
                block_mode,
            });
            self.count += 1;
        }

        SwitchOutcome {
            closed,
            opened,
            verdict,
        }
    }

    /// Close the open window, if any, on pause, stop or idle.
    pub fn close(&mut self, now: Duration) -> Option<NewEvent> {
        let window = self.open.take()?;
        let elapsed = now.saturating_sub(window.opened_at);
        let secs = ((elapsed.as_millis() + 500) / 1000) as u64;
        let secs = secs.max(MIN_DISTRACTION_SECS);
        self.closed_total += Duration::from_secs(secs);

        let mut metadata = Map::new();
        if let Some(bundle_id) = &window.bundle_id {
            metadata.insert("bundleId".into(), json!(bundle_id));
        }
        if let Some(mode) = window.block_mode {
            metadata.insert("blockMode".into(), json!(mode.as_str()));
        }
        let metadata = (!metadata.is_empty()).then_some(Value::Object(metadata));

        Some(NewEvent::distraction(
            window.opened_wall,
            window.app_name,
            secs,
            metadata,
        ))
    }

    /// An app became exempt mid-session; a window open for it ends now.
    pub fn exempt(&mut self, bundle_id: &str, now: Duration) -> Option<NewEvent> {
        let matches = self
            .open
            .as_ref()
            .is_some_and(|w| w.bundle_id.as_deref() == Some(bundle_id));
        if matches {
            self.close(now)
        } else {
            None
        }
    }

    /// Coarse detector: the host lost the foreground. Counts once per
    /// backgrounding.
    pub fn open_background(&mut self, now: Duration, wall: DateTime<Utc>) -> bool {
        if self.open.is_some() {
            return false;
        }
        self.open = Some(OpenWindow {
            app_name: BACKGROUND_APP_NAME.into(),
            bundle_id: None,
            opened_at: now,
            opened_wall: wall,
            block_mode: None,
        });
        self.count += 1;
        true
    }

    pub fn close_background(&mut self, now: Duration) -> Option<NewEvent> {
        let is_background = self
            .open
            .as_ref()
            .is_some_and(|w| w.bundle_id.is_none());
        if is_background {
            self.close(now)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::db::EventType;
    use crate::distraction::DistractionScope;
    use crate::enforcement::BlocklistPolicy;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    struct Fixture {
        exemptions: HashSet<String>,
        policy: BlocklistPolicy,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                exemptions: HashSet::new(),
                policy: BlocklistPolicy::default(),
            }
        }

        fn ctx(&self) -> ClassifierContext<'_> {
            ClassifierContext {
                host_bundle_id: "tether",
                exemptions: &self.exemptions,
                policy: &self.policy,
                scope: DistractionScope::AnyApp,
                user_idle: false,
            }
        }
    }

    #[test]
    fn one_window_per_switch_not_per_poll() {
        let fx = Fixture::new();
        let mut tracker = DistractionTracker::new();
        let wall = Utc::now();
        let slack = AppIdentity::new("Slack", "slack");

        let first = tracker.on_app_switch(&slack, &fx.ctx(), None, secs(10), wall);
        assert!(first.opened);
        let again = tracker.on_app_switch(&slack, &fx.ctx(), None, secs(11), wall);
        assert!(!again.opened);
        assert_eq!(tracker.count(), 1);

        let back = tracker.on_app_switch(&AppIdentity::new("Tether", "tether"), &fx.ctx(), None, secs(25), wall);
        assert_eq!(back.verdict, Verdict::HostApp);
        let event = back.closed.expect("window closed");
        assert_eq!(event.event_type, EventType::Distraction);
        assert_eq!(event.app_name.as_deref(), Some("Slack"));
        assert_eq!(event.duration_seconds, Some(15));
        assert_eq!(tracker.distracted(secs(100)), secs(15));
    }

    #[test]
    fn switching_between_distractions_closes_then_opens() {
        let fx = Fixture::new();
        let mut tracker = DistractionTracker::new();
        let wall = Utc::now();

        tracker.on_app_switch(&AppIdentity::new("Slack", "slack"), &fx.ctx(), None, secs(0), wall);
        let outcome = tracker.on_app_switch(
            &AppIdentity::new("Steam", "steam"),
            &fx.ctx(),
            Some(BlockMode::SoftWarn),
            secs(0),
            wall,
        );
        assert_eq!(outcome.closed.and_then(|e| e.duration_seconds), Some(1), "minimum one second");
        assert!(outcome.opened);
        assert_eq!(tracker.count(), 2);

        let closed = tracker.close(secs(4)).expect("open window");
        assert_eq!(
            closed.metadata,
            Some(json!({ "bundleId": "steam", "blockMode": "soft-warn" }))
        );
        assert!(tracker.close(secs(5)).is_none());
    }

    #[test]
    fn exemption_closes_only_the_matching_window() {
        let fx = Fixture::new();
        let mut tracker = DistractionTracker::new();
        tracker.on_app_switch(&AppIdentity::new("Slack", "slack"), &fx.ctx(), None, secs(0), Utc::now());
        assert!(tracker.exempt("discord", secs(3)).is_none());
        assert!(tracker.exempt("slack", secs(3)).is_some());
        assert!(!tracker.is_distracted());
    }

    #[test]
    fn background_windows_are_coarse() {
        let mut tracker = DistractionTracker::new();
        assert!(tracker.open_background(secs(5), Utc::now()));
        assert!(!tracker.open_background(secs(6), Utc::now()));
        let event = tracker.close_background(secs(65)).expect("closed");
        assert_eq!(event.app_name.as_deref(), Some(BACKGROUND_APP_NAME));
        assert_eq!(event.duration_seconds, Some(60));
        assert_eq!(tracker.count(), 1);
    }
}
