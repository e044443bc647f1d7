//! Pure session state machine.
//!
//! Nothing in here performs IO or reads a clock. Callers pass the monotonic
//! offset (`now`) and the wall time (`wall`) into every transition and get
//! back what has to be persisted. Guards return `None` for calls that are
//! not allowed in the current phase; those are no-ops, not errors.

use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    db::{BlockMode, EventType, NewEvent, Session, SessionCounters},
    distraction::{ClassifierContext, DistractionScope, DistractionTracker},
    enforcement::BlocklistPolicy,
    platform::AppIdentity,
};

/// Elapsed seconds between durability checkpoints.
pub const CHECKPOINT_EVERY_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Running,
    Paused,
    Summary,
}

#[derive(Debug, Clone)]
struct ActiveSession {
    session: Session,
    epoch: Duration,
    paused_at: Option<Duration>,
    total_paused: Duration,
    tracker: DistractionTracker,
    exemptions: HashSet<String>,
    last_checkpoint_secs: u64,
}

impl ActiveSession {
    /// The instant time stops at: `now` while running, the pause instant
    /// while paused.
    fn effective_now(&self, now: Duration) -> Duration {
        self.paused_at.unwrap_or(now)
    }

    fn elapsed(&self, now: Duration) -> Duration {
        self.effective_now(now)
            .saturating_sub(self.epoch)
            .saturating_sub(self.total_paused)
    }

    fn focused(&self, now: Duration) -> Duration {
        let elapsed = self.elapsed(now);
        elapsed
            .saturating_sub(self.tracker.distracted(self.effective_now(now)))
            .min(elapsed)
    }

    fn counters(&self, now: Duration) -> SessionCounters {
        SessionCounters {
            duration_seconds: self.elapsed(now).as_secs(),
            focused_seconds: self.focused(now).as_secs(),
            distraction_count: self.tracker.count(),
        }
        .normalized()
    }
}

#[derive(Debug, Clone)]
enum MachineState {
    Idle,
    Active(ActiveSession),
    Summary(Session),
}

/// Host-level inputs for classifying an app switch.
pub struct ClassifyEnv<'a> {
    pub host_bundle_id: &'a str,
    pub policy: &'a BlocklistPolicy,
    pub scope: DistractionScope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartEffects {
    pub session: Session,
    pub event: NewEvent,
}

/// Writes required by pause, resume or stop.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEffects {
    pub session_id: String,
    pub counters: SessionCounters,
    pub events: Vec<NewEvent>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub focused_seconds: u64,
    pub distraction_count: u32,
    pub distracted_app: Option<String>,
    pub exemptions: Vec<String>,
    /// The finalized session while in `Summary`.
    pub summary: Option<Session>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: SessionPhase::Idle,
            session_id: None,
            started_at: None,
            elapsed_seconds: 0,
            focused_seconds: 0,
            distraction_count: 0,
            distracted_app: None,
            exemptions: Vec::new(),
            summary: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: MachineState,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: MachineState::Idle,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.state {
            MachineState::Idle => SessionPhase::Idle,
            MachineState::Active(active) if active.paused_at.is_some() => SessionPhase::Paused,
            MachineState::Active(_) => SessionPhase::Running,
            MachineState::Summary(_) => SessionPhase::Summary,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.state {
            MachineState::Active(active) => Some(active.session.id.as_str()),
            MachineState::Summary(session) => Some(session.id.as_str()),
            MachineState::Idle => None,
        }
    }

    pub fn exemptions(&self) -> Option<&HashSet<String>> {
        match &self.state {
            MachineState::Active(active) => Some(&active.exemptions),
            _ => None,
        }
    }

    fn running_mut(&mut self) -> Option<&mut ActiveSession> {
        match &mut self.state {
            MachineState::Active(active) if active.paused_at.is_none() => Some(active),
            _ => None,
        }
    }

    /// Allowed from `Idle`, and from `Summary` as "start new".
    pub fn start(&mut self, id: String, now: Duration, wall: DateTime<Utc>) -> Option<StartEffects> {
        if matches!(self.state, MachineState::Active(_)) {
            return None;
        }
        let session = Session::begin(id, wall);
        self.state = MachineState::Active(ActiveSession {
            session: session.clone(),
            epoch: now,
            paused_at: None,
            total_paused: Duration::ZERO,
            tracker: DistractionTracker::new(),
            exemptions: HashSet::new(),
            last_checkpoint_secs: 0,
        });
        Some(StartEffects {
            session,
            event: NewEvent::lifecycle(EventType::Start, wall),
        })
    }

    pub fn pause(&mut self, now: Duration, wall: DateTime<Utc>) -> Option<TransitionEffects> {
        let active = self.running_mut()?;
        let mut events: Vec<NewEvent> = active.tracker.close(now).into_iter().collect();
        active.paused_at = Some(now);
        events.push(NewEvent::lifecycle(EventType::Pause, wall));
        let counters = active.counters(now);
        active.last_checkpoint_secs = counters.duration_seconds;
        Some(TransitionEffects {
            session_id: active.session.id.clone(),
            counters,
            events,
        })
    }

    pub fn resume(&mut self, now: Duration, wall: DateTime<Utc>) -> Option<TransitionEffects> {
        let MachineState::Active(active) = &mut self.state else {
            return None;
        };
        let paused_at = active.paused_at.take()?;
        active.total_paused += now.saturating_sub(paused_at);
        Some(TransitionEffects {
            session_id: active.session.id.clone(),
            counters: active.counters(now),
            events: vec![NewEvent::lifecycle(EventType::Resume, wall)],
        })
    }

    /// Allowed from `Running` or `Paused`. Moves to `Summary` with the
    /// in-memory view of the finished session; the caller replaces it with
    /// the stored row through [`SessionMachine::set_summary`].
    pub fn stop(&mut self, now: Duration, wall: DateTime<Utc>) -> Option<TransitionEffects> {
        let MachineState::Active(active) = &mut self.state else {
            return None;
        };
        let close_at = active.effective_now(now);
        let mut events: Vec<NewEvent> = active.tracker.close(close_at).into_iter().collect();
        events.push(NewEvent::lifecycle(EventType::Stop, wall));
        let counters = active.counters(now);

        let mut session = active.session.clone();
        session.duration_seconds = counters.duration_seconds;
        session.focused_seconds = counters.focused_seconds;
        session.distraction_count = counters.distraction_count;
        session.end_time = Some(wall);
        session.is_complete = true;
        session.updated_at = wall;

        let effects = TransitionEffects {
            session_id: session.id.clone(),
            counters,
            events,
        };
        self.state = MachineState::Summary(session);
        Some(effects)
    }

    pub fn set_summary(&mut self, session: Session) {
        if matches!(self.state, MachineState::Summary(_)) {
            self.state = MachineState::Summary(session);
        }
    }

    /// A session recovered after a crash goes straight to `Summary`.
    pub fn recover(&mut self, session: Session) {
        self.state = MachineState::Summary(session);
    }

    pub fn dismiss_summary(&mut self) -> bool {
        if matches!(self.state, MachineState::Summary(_)) {
            self.state = MachineState::Idle;
            true
        } else {
            false
        }
    }

    /// Counters to persist if a checkpoint is due.
    pub fn checkpoint_due(&mut self, now: Duration) -> Option<(String, SessionCounters)> {
        let active = self.running_mut()?;
        let counters = active.counters(now);
        if counters.duration_seconds < active.last_checkpoint_secs + CHECKPOINT_EVERY_SECS {
            return None;
        }
        active.last_checkpoint_secs = counters.duration_seconds;
        Some((active.session.id.clone(), counters))
    }

    /// Returns the DISTRACTION event closed by this switch, if any.
    pub fn on_app_switch(
        &mut self,
        app: &AppIdentity,
        user_idle: bool,
        env: &ClassifyEnv<'_>,
        block_mode: Option<BlockMode>,
        now: Duration,
        wall: DateTime<Utc>,
    ) -> Option<NewEvent> {
        let active = self.running_mut()?;
        let ctx = ClassifierContext {
            host_bundle_id: env.host_bundle_id,
            exemptions: &active.exemptions,
            policy: env.policy,
            scope: env.scope,
            user_idle,
        };
        active
            .tracker
            .on_app_switch(app, &ctx, block_mode, now, wall)
            .closed
    }

    pub fn on_idle_began(&mut self, now: Duration) -> Option<NewEvent> {
        self.running_mut()?.tracker.close(now)
    }

    pub fn on_idle_ended(&mut self, idle_seconds: u64, wall: DateTime<Utc>) -> Option<NewEvent> {
        self.running_mut()?;
        Some(NewEvent::idle(wall, idle_seconds))
    }

    /// Exempt an app for the rest of this session. Returns the event for a
    /// window that was open for it.
    pub fn add_exemption(&mut self, bundle_id: &str, now: Duration) -> Option<NewEvent> {
        let MachineState::Active(active) = &mut self.state else {
            return None;
        };
        active.exemptions.insert(bundle_id.to_string());
        let close_at = active.effective_now(now);
        active.tracker.exempt(bundle_id, close_at)
    }

    pub fn on_background(&mut self, now: Duration, wall: DateTime<Utc>) -> bool {
        self.running_mut()
            .is_some_and(|active| active.tracker.open_background(now, wall))
    }

    pub fn on_foreground(&mut self, now: Duration) -> Option<NewEvent> {
        self.running_mut()?.tracker.close_background(now)
    }

    pub fn snapshot(&self, now: Duration) -> SessionSnapshot {
        match &self.state {
            MachineState::Idle => SessionSnapshot::idle(),
            MachineState::Active(active) => {
                let counters = active.counters(now);
                let mut exemptions: Vec<String> = active.exemptions.iter().cloned().collect();
                exemptions.sort();
                SessionSnapshot {
                    phase: self.phase(),
                    session_id: Some(active.session.id.clone()),
                    started_at: Some(active.session.start_time),
                    elapsed_seconds: counters.duration_seconds,
                    focused_seconds: counters.focused_seconds,
                    distraction_count: counters.distraction_count,
                    distracted_app: active.tracker.open_app().map(str::to_string),
                    exemptions,
                    summary: None,
                }
            }
            MachineState::Summary(session) => SessionSnapshot {
                phase: SessionPhase::Summary,
                session_id: Some(session.id.clone()),
                started_at: Some(session.start_time),
                elapsed_seconds: session.duration_seconds,
                focused_seconds: session.focused_seconds,
                distraction_count: session.distraction_count,
                distracted_app: None,
                exemptions: Vec::new(),
                summary: Some(session.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn env(policy: &BlocklistPolicy) -> ClassifyEnv<'_> {
        ClassifyEnv {
            host_bundle_id: "tether",
            policy,
            scope: DistractionScope::AnyApp,
        }
    }

    #[test]
    fn guards_turn_disallowed_calls_into_no_ops() {
        let mut machine = SessionMachine::new();
        let wall = Utc::now();

        assert!(machine.pause(secs(1), wall).is_none());
        assert!(machine.resume(secs(1), wall).is_none());
        assert!(machine.stop(secs(1), wall).is_none());
        assert!(!machine.dismiss_summary());
        assert_eq!(machine.phase(), SessionPhase::Idle);

        let start = machine.start("s1".into(), secs(0), wall).expect("start");
        assert_eq!(start.event.event_type, EventType::Start);
        assert!(machine.start("s2".into(), secs(1), wall).is_none());
        assert!(machine.resume(secs(1), wall).is_none());

        machine.pause(secs(5), wall).expect("pause");
        assert!(machine.pause(secs(6), wall).is_none());
        assert_eq!(machine.phase(), SessionPhase::Paused);

        machine.stop(secs(7), wall).expect("stop from paused");
        assert_eq!(machine.phase(), SessionPhase::Summary);
        assert!(machine.pause(secs(8), wall).is_none());

        assert!(machine.start("s3".into(), secs(9), wall).is_some(), "start new from summary");
        assert_eq!(machine.session_id(), Some("s3"));
    }

    #[test]
    fn paused_time_is_excluded_from_elapsed() {
        let mut machine = SessionMachine::new();
        let wall = Utc::now();
        machine.start("s".into(), secs(100), wall);

        let pause = machine.pause(secs(160), wall).expect("pause");
        assert_eq!(pause.counters.duration_seconds, 60);
        assert_eq!(machine.snapshot(secs(400)).elapsed_seconds, 60, "frozen while paused");

        machine.resume(secs(400), wall).expect("resume");
        assert_eq!(machine.snapshot(secs(430)).elapsed_seconds, 90);

        let stop = machine.stop(secs(440), wall).expect("stop");
        assert_eq!(stop.counters.duration_seconds, 100);
        let kinds: Vec<_> = stop.events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::Stop]);
    }

    #[test]
    fn focused_time_stops_while_distracted() {
        let mut machine = SessionMachine::new();
        let policy = BlocklistPolicy::default();
        let wall = Utc::now();
        machine.start("s".into(), secs(0), wall);

        machine.on_app_switch(&AppIdentity::new("Slack", "slack"), false, &env(&policy), None, secs(10), wall);
        let during = machine.snapshot(secs(25));
        assert_eq!(during.focused_seconds, 10);
        assert_eq!(during.distracted_app.as_deref(), Some("Slack"));

        let closed = machine
            .on_app_switch(&AppIdentity::new("Tether", "tether"), false, &env(&policy), None, secs(30), wall)
            .expect("closed window");
        assert_eq!(closed.duration_seconds, Some(20));

        let stop = machine.stop(secs(60), wall).expect("stop");
        assert_eq!(stop.counters.duration_seconds, 60);
        assert_eq!(stop.counters.focused_seconds, 40);
        assert_eq!(stop.counters.distraction_count, 1);
    }

    #[test]
    fn stop_closes_an_open_window_before_stop_event() {
        let mut machine = SessionMachine::new();
        let policy = BlocklistPolicy::default();
        let wall = Utc::now();
        machine.start("s".into(), secs(0), wall);
        machine.on_app_switch(&AppIdentity::new("Steam", "steam"), false, &env(&policy), None, secs(0), wall);

        let stop = machine.stop(secs(12), wall).expect("stop");
        let kinds: Vec<_> = stop.events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::Distraction, EventType::Stop]);
        assert_eq!(stop.counters.focused_seconds, 0);
        assert!(stop.counters.focused_seconds <= stop.counters.duration_seconds);
    }

    #[test]
    fn checkpoints_every_thirty_elapsed_seconds() {
        let mut machine = SessionMachine::new();
        machine.start("s".into(), secs(0), Utc::now());

        assert!(machine.checkpoint_due(secs(29)).is_none());
        let (_, counters) = machine.checkpoint_due(secs(30)).expect("due");
        assert_eq!(counters.duration_seconds, 30);
        assert!(machine.checkpoint_due(secs(45)).is_none());
        assert!(machine.checkpoint_due(secs(61)).is_some());
    }

    #[test]
    fn idle_closes_windows_and_logs_idle_time() {
        let mut machine = SessionMachine::new();
        let policy = BlocklistPolicy::default();
        let wall = Utc::now();
        machine.start("s".into(), secs(0), wall);
        machine.on_app_switch(&AppIdentity::new("Slack", "slack"), false, &env(&policy), None, secs(5), wall);

        let closed = machine.on_idle_began(secs(305)).expect("closed");
        assert_eq!(closed.duration_seconds, Some(300));

        let idle = machine.on_idle_ended(420, wall).expect("idle event");
        assert_eq!(idle.event_type, EventType::Idle);
        assert_eq!(idle.duration_seconds, Some(420));

        // Switches while idle never open a window.
        assert!(machine
            .on_app_switch(&AppIdentity::new("Mail", "mail"), true, &env(&policy), None, secs(500), wall)
            .is_none());
        assert_eq!(machine.snapshot(secs(600)).distracted_app, None);
    }

    #[test]
    fn exemptions_last_for_the_session_only() {
        let mut machine = SessionMachine::new();
        let policy = BlocklistPolicy::default();
        let wall = Utc::now();
        machine.start("s".into(), secs(0), wall);
        machine.on_app_switch(&AppIdentity::new("Zoom", "zoom"), false, &env(&policy), None, secs(0), wall);
        assert!(machine.add_exemption("zoom", secs(4)).is_some());

        machine.on_app_switch(&AppIdentity::new("Code", "code"), false, &env(&policy), None, secs(5), wall);
        machine.on_app_switch(&AppIdentity::new("Zoom", "zoom"), false, &env(&policy), None, secs(6), wall);
        assert_eq!(machine.snapshot(secs(7)).distraction_count, 2, "code opened one, zoom is exempt");

        machine.stop(secs(8), wall);
        machine.dismiss_summary();
        machine.start("t".into(), secs(9), wall);
        assert!(machine.exemptions().expect("active").is_empty());
    }

    #[test]
    fn background_is_counted_once_per_backgrounding() {
        let mut machine = SessionMachine::new();
        let wall = Utc::now();
        machine.start("s".into(), secs(0), wall);

        assert!(machine.on_background(secs(10), wall));
        assert!(!machine.on_background(secs(11), wall));
        let event = machine.on_foreground(secs(40)).expect("closed");
        assert_eq!(event.app_name.as_deref(), Some("Background"));
        assert_eq!(event.duration_seconds, Some(30));
        assert_eq!(machine.snapshot(secs(40)).distraction_count, 1);
    }
}
