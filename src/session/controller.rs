use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::Duration as ChronoDuration;
use log::{error, info, warn};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    db::{BlockMode, Database, EventType, NewEvent, Session, SessionCounters},
    distraction::DistractionScope,
    enforcement::{BlockOverlay, BlocklistPolicy, EnforcementEngine},
    platform::{AppIdentity, ForegroundProbe},
    sensing::{ActivityEvent, ActivityMonitor, ActivitySink},
    sync::{SyncHandle, SyncRequest},
};

use super::state::{ClassifyEnv, SessionMachine, SessionPhase, SessionSnapshot};

/// Unsynced events that trigger an early event upload.
pub const EVENT_SYNC_BATCH: u64 = 10;

/// How the platform reports distraction.
pub enum SignalSource {
    /// Full foreground-app switches with identity.
    AppSwitch(Arc<dyn ForegroundProbe>),
    /// Only "the host went to the background / came back".
    Coarse,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host_bundle_id: String,
    pub scope: DistractionScope,
    pub tick_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_bundle_id: "tether".into(),
            scope: DistractionScope::default(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

pub struct SessionDeps {
    pub db: Database,
    pub clock: SharedClock,
    pub source: SignalSource,
    pub enforcement: EnforcementEngine,
    pub policy: watch::Receiver<Arc<BlocklistPolicy>>,
    pub sync: Option<SyncHandle>,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionNotification {
    Started { session_id: String },
    Paused { session_id: String },
    Resumed { session_id: String },
    Stopped { session: Session },
    /// A session left open by a previous run was closed on launch.
    Recovered { session: Session },
    SummaryDismissed,
    Distraction { app_name: String, duration_seconds: u64 },
    Blocked { app_name: String, mode: BlockMode },
}

#[derive(Debug, Clone)]
enum Command {
    Status,
    Start,
    Pause,
    Resume,
    Stop,
    DismissSummary,
    AddExemption(String),
    DismissOverlay,
    OverrideBlock,
    SystemWillSleep,
    SystemDidWake,
    EnterBackground,
    BecomeActive,
}

enum Message {
    Command(Command, oneshot::Sender<Result<SessionSnapshot>>),
    Tick { generation: u64 },
    Activity { generation: u64, event: ActivityEvent },
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the session owner task. Cheap to clone; every method is a
/// message to the single task that owns the state machine.
#[derive(Clone)]
pub struct SessionController {
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<SessionSnapshot>,
    notifications: broadcast::Sender<SessionNotification>,
    overlay: watch::Receiver<Option<BlockOverlay>>,
}

impl SessionController {
    /// Recover any session left open by a previous run, then start the
    /// owner task.
    pub async fn spawn(deps: SessionDeps) -> Result<Self> {
        let SessionDeps {
            db,
            clock,
            source,
            enforcement,
            policy,
            sync,
            config,
        } = deps;

        let mut machine = SessionMachine::new();
        let recovered = recover_incomplete(&db).await?;
        if let Some(session) = &recovered {
            machine.recover(session.clone());
            if let Some(sync) = &sync {
                sync.request(SyncRequest::FinalizeSession(session.id.clone()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(machine.snapshot(clock.monotonic()));
        let (notifications, _) = broadcast::channel(64);
        let overlay = enforcement.overlay();

        if let Some(session) = recovered {
            let _ = notifications.send(SessionNotification::Recovered { session });
        }

        let monitor = match source {
            SignalSource::AppSwitch(probe) => Some(ActivityMonitor::new(probe)),
            SignalSource::Coarse => None,
        };

        let owner = SessionOwner {
            machine,
            db,
            clock,
            monitor,
            enforcement,
            policy,
            sync,
            config,
            ticker: None,
            generation: 0,
            events_since_request: 0,
            self_tx: tx.downgrade(),
            state_tx,
            notifications: notifications.clone(),
        };
        tokio::spawn(owner.run(rx));

        Ok(Self {
            tx,
            state,
            notifications,
            overlay,
        })
    }

    async fn send(&self, command: Command) -> Result<SessionSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Message::Command(command, reply_tx))
            .map_err(|_| anyhow!("session task is not running"))?;
        reply_rx.await.context("session task dropped the reply")?
    }

    pub async fn start(&self) -> Result<SessionSnapshot> {
        self.send(Command::Start).await
    }

    pub async fn pause(&self) -> Result<SessionSnapshot> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<SessionSnapshot> {
        self.send(Command::Resume).await
    }

    pub async fn stop(&self) -> Result<SessionSnapshot> {
        self.send(Command::Stop).await
    }

    pub async fn dismiss_summary(&self) -> Result<SessionSnapshot> {
        self.send(Command::DismissSummary).await
    }

    /// Exempt an app from distraction tracking and enforcement for the rest
    /// of the current session.
    pub async fn add_exemption(&self, bundle_id: impl Into<String>) -> Result<SessionSnapshot> {
        self.send(Command::AddExemption(bundle_id.into())).await
    }

    pub async fn dismiss_block_overlay(&self) -> Result<SessionSnapshot> {
        self.send(Command::DismissOverlay).await
    }

    /// Takes effect only once a timed lock's cooldown has run out.
    pub async fn override_block(&self) -> Result<SessionSnapshot> {
        self.send(Command::OverrideBlock).await
    }

    pub async fn system_will_sleep(&self) -> Result<SessionSnapshot> {
        self.send(Command::SystemWillSleep).await
    }

    pub async fn system_did_wake(&self) -> Result<SessionSnapshot> {
        self.send(Command::SystemDidWake).await
    }

    pub async fn scene_did_enter_background(&self) -> Result<SessionSnapshot> {
        self.send(Command::EnterBackground).await
    }

    pub async fn scene_did_become_active(&self) -> Result<SessionSnapshot> {
        self.send(Command::BecomeActive).await
    }

    /// Live snapshot computed by the owner task.
    pub async fn status(&self) -> Result<SessionSnapshot> {
        self.send(Command::Status).await
    }

    /// Last published snapshot, without a round trip.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }

    pub fn overlay(&self) -> watch::Receiver<Option<BlockOverlay>> {
        self.overlay.clone()
    }

    /// Stop background work without touching the session. A session that
    /// is still running is recovered on the next launch.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn recover_incomplete(db: &Database) -> Result<Option<Session>> {
    let Some(session) = db.get_incomplete_session().await? else {
        return Ok(None);
    };
    let end_time = session.start_time
        + ChronoDuration::seconds(session.duration_seconds.min(u64::from(u32::MAX)) as i64);
    let counters = SessionCounters {
        duration_seconds: session.duration_seconds,
        focused_seconds: session.focused_seconds,
        distraction_count: session.distraction_count,
    };
    let recovered = db
        .finalize_session(
            &session.id,
            counters,
            end_time,
            true,
            vec![NewEvent::lifecycle(EventType::Stop, end_time)],
        )
        .await
        .with_context(|| format!("failed to recover session {}", session.id))?;
    warn!(
        "Recovered interrupted session {} ({}s)",
        recovered.id, recovered.duration_seconds
    );
    Ok(Some(recovered))
}

/// Tags monitor events with the run they belong to.
struct MonitorSink {
    tx: mpsc::WeakUnboundedSender<Message>,
    generation: u64,
}

impl ActivitySink for MonitorSink {
    fn emit(&self, event: ActivityEvent) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        tx.send(Message::Activity {
            generation: self.generation,
            event,
        })
        .is_ok()
    }
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

fn spawn_ticker(
    tx: mpsc::WeakUnboundedSender<Message>,
    generation: u64,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(tx) = tx.upgrade() else { break };
                    if tx.send(Message::Tick { generation }).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

struct SessionOwner {
    machine: SessionMachine,
    db: Database,
    clock: SharedClock,
    monitor: Option<ActivityMonitor>,
    enforcement: EnforcementEngine,
    policy: watch::Receiver<Arc<BlocklistPolicy>>,
    sync: Option<SyncHandle>,
    config: SessionConfig,
    ticker: Option<Ticker>,
    /// Bumped on every run start and stop; messages from older runs are
    /// dropped.
    generation: u64,
    events_since_request: u64,
    self_tx: mpsc::WeakUnboundedSender<Message>,
    state_tx: watch::Sender<SessionSnapshot>,
    notifications: broadcast::Sender<SessionNotification>,
}

impl SessionOwner {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Command(command, reply) => {
                    let result = self.handle_command(command).await;
                    self.publish();
                    let _ = reply.send(result.map(|_| self.current_snapshot()));
                }
                Message::Tick { generation } => {
                    if generation == self.generation {
                        self.on_tick().await;
                        self.publish();
                    }
                }
                Message::Activity { generation, event } => {
                    if generation == self.generation {
                        self.on_activity(event).await;
                        self.publish();
                    }
                }
                Message::Shutdown(done) => {
                    self.stop_run().await;
                    self.enforcement.deactivate();
                    let _ = done.send(());
                    info!("Session task shut down");
                    return;
                }
            }
        }
        self.stop_run().await;
        self.enforcement.deactivate();
    }

    fn current_snapshot(&self) -> SessionSnapshot {
        self.machine.snapshot(self.clock.monotonic())
    }

    fn publish(&self) {
        let snapshot = self.current_snapshot();
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn notify(&self, notification: SessionNotification) {
        let _ = self.notifications.send(notification);
    }

    fn request_sync(&self, request: SyncRequest) {
        if let Some(sync) = &self.sync {
            sync.request(request);
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Status => Ok(()),
            Command::Start => self.start().await,
            Command::Pause | Command::SystemWillSleep => self.pause().await,
            Command::Resume => self.resume().await,
            Command::Stop => self.stop().await,
            Command::DismissSummary => {
                if self.machine.dismiss_summary() {
                    self.notify(SessionNotification::SummaryDismissed);
                }
                Ok(())
            }
            Command::AddExemption(bundle_id) => {
                self.exempt(&bundle_id).await;
                Ok(())
            }
            Command::DismissOverlay => {
                self.enforcement.dismiss_overlay();
                Ok(())
            }
            Command::OverrideBlock => {
                if let Some(bundle_id) = self.enforcement.take_override() {
                    info!("Block overridden for {bundle_id}");
                    self.exempt(&bundle_id).await;
                }
                Ok(())
            }
            Command::SystemDidWake => {
                info!("System woke; session stays {:?}", self.machine.phase());
                Ok(())
            }
            Command::EnterBackground => {
                if self.monitor.is_none() {
                    let now = self.clock.monotonic();
                    self.machine.on_background(now, self.clock.wall());
                }
                Ok(())
            }
            Command::BecomeActive => {
                if self.monitor.is_none() {
                    let now = self.clock.monotonic();
                    if let Some(event) = self.machine.on_foreground(now) {
                        self.append_background(vec![event]).await;
                    }
                }
                Ok(())
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        let before = self.machine.clone();
        let id = Uuid::new_v4().to_string();
        let Some(effects) = self
            .machine
            .start(id, self.clock.monotonic(), self.clock.wall())
        else {
            return Ok(());
        };

        if let Err(err) = self
            .db
            .insert_session_with_start(&effects.session, effects.event)
            .await
        {
            self.machine = before;
            return Err(err.context("failed to start session"));
        }

        let session_id = effects.session.id;
        self.events_since_request = 1;
        self.enforcement.activate();
        self.start_run();
        self.request_sync(SyncRequest::Session(session_id.clone()));
        info!("Session {session_id} started");
        self.notify(SessionNotification::Started { session_id });
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        let before = self.machine.clone();
        let Some(effects) = self
            .machine
            .pause(self.clock.monotonic(), self.clock.wall())
        else {
            return Ok(());
        };

        let written = effects.events.len() as u64;
        if let Err(err) = self
            .db
            .checkpoint_session(
                &effects.session_id,
                effects.counters,
                effects.events,
                self.clock.wall(),
            )
            .await
        {
            self.machine = before;
            return Err(err.context("failed to pause session"));
        }

        self.stop_run().await;
        self.note_events(&effects.session_id, written);
        info!("Session {} paused", effects.session_id);
        self.notify(SessionNotification::Paused {
            session_id: effects.session_id,
        });
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        let before = self.machine.clone();
        let Some(effects) = self
            .machine
            .resume(self.clock.monotonic(), self.clock.wall())
        else {
            return Ok(());
        };

        if let Err(err) = self
            .db
            .checkpoint_session(
                &effects.session_id,
                effects.counters,
                effects.events,
                self.clock.wall(),
            )
            .await
        {
            self.machine = before;
            return Err(err.context("failed to resume session"));
        }

        self.start_run();
        self.note_events(&effects.session_id, 1);
        info!("Session {} resumed", effects.session_id);
        self.notify(SessionNotification::Resumed {
            session_id: effects.session_id,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let before = self.machine.clone();
        let wall = self.clock.wall();
        let Some(effects) = self.machine.stop(self.clock.monotonic(), wall) else {
            return Ok(());
        };

        let session = match self
            .db
            .finalize_session(&effects.session_id, effects.counters, wall, false, effects.events)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                self.machine = before;
                return Err(err.context("failed to stop session"));
            }
        };

        self.stop_run().await;
        self.enforcement.deactivate();
        self.machine.set_summary(session.clone());
        self.events_since_request = 0;
        self.request_sync(SyncRequest::FinalizeSession(session.id.clone()));
        info!(
            "Session {} stopped: {}s elapsed, {}s focused, {} distraction(s)",
            session.id, session.duration_seconds, session.focused_seconds, session.distraction_count
        );
        self.notify(SessionNotification::Stopped { session });
        Ok(())
    }

    async fn exempt(&mut self, bundle_id: &str) {
        let now = self.clock.monotonic();
        if let Some(event) = self.machine.add_exemption(bundle_id, now) {
            self.append_background(vec![event]).await;
        }
    }

    /// Start tick and monitor for a new run.
    fn start_run(&mut self) {
        self.generation += 1;
        let cancel = CancellationToken::new();
        let handle = spawn_ticker(
            self.self_tx.clone(),
            self.generation,
            self.config.tick_interval,
            cancel.clone(),
        );
        self.ticker = Some(Ticker { cancel, handle });

        if let Some(monitor) = &mut self.monitor {
            let sink = MonitorSink {
                tx: self.self_tx.clone(),
                generation: self.generation,
            };
            if let Err(err) = monitor.start(Box::new(sink)) {
                warn!("Activity monitor did not start: {err}");
            }
        }
    }

    /// Cancel and join tick and monitor. Nothing from the finished run is
    /// processed after this returns.
    async fn stop_run(&mut self) {
        self.generation += 1;
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel.cancel();
            if let Err(err) = ticker.handle.await {
                warn!("Session ticker failed to join: {err}");
            }
        }
        if let Some(monitor) = &mut self.monitor {
            if let Err(err) = monitor.stop().await {
                warn!("Activity monitor failed to stop: {err}");
            }
        }
    }

    async fn on_tick(&mut self) {
        let Some((session_id, counters)) = self.machine.checkpoint_due(self.clock.monotonic())
        else {
            return;
        };
        if let Err(err) = self
            .db
            .checkpoint_session(&session_id, counters, Vec::new(), self.clock.wall())
            .await
        {
            warn!("Checkpoint for session {session_id} failed: {err:#}");
        }
    }

    async fn on_activity(&mut self, event: ActivityEvent) {
        if self.machine.phase() != SessionPhase::Running {
            return;
        }
        let now = self.clock.monotonic();
        let wall = self.clock.wall();
        let closed = match event {
            ActivityEvent::AppSwitch { app, user_idle } => self.on_app_switch(&app, user_idle, now, wall),
            ActivityEvent::IdleBegan { .. } => self.machine.on_idle_began(now),
            ActivityEvent::IdleEnded { idle_seconds } => self.machine.on_idle_ended(idle_seconds, wall),
        };
        if let Some(event) = closed {
            self.append_background(vec![event]).await;
        }
    }

    fn on_app_switch(
        &mut self,
        app: &AppIdentity,
        user_idle: bool,
        now: Duration,
        wall: chrono::DateTime<chrono::Utc>,
    ) -> Option<NewEvent> {
        let exemptions = self.machine.exemptions().cloned().unwrap_or_default();
        let block_mode = self.enforcement.on_app_switch(app, &exemptions).mode();
        if let Some(mode) = block_mode {
            self.notify(SessionNotification::Blocked {
                app_name: app.name.clone(),
                mode,
            });
        }

        let policy = self.policy.borrow().clone();
        let env = ClassifyEnv {
            host_bundle_id: &self.config.host_bundle_id,
            policy: &policy,
            scope: self.config.scope,
        };
        self.machine
            .on_app_switch(app, user_idle, &env, block_mode, now, wall)
    }

    /// Append events outside of a user-initiated call: failures are logged.
    async fn append_background(&mut self, events: Vec<NewEvent>) {
        let Some(session_id) = self.machine.session_id().map(str::to_string) else {
            return;
        };
        for event in &events {
            if let (EventType::Distraction, Some(app_name), Some(secs)) =
                (event.event_type, &event.app_name, event.duration_seconds)
            {
                self.notify(SessionNotification::Distraction {
                    app_name: app_name.clone(),
                    duration_seconds: secs,
                });
            }
        }
        let count = events.len() as u64;
        match self.db.append_events(&session_id, events).await {
            Ok(_) => self.note_events(&session_id, count),
            Err(err) => error!("Failed to log events for session {session_id}: {err:#}"),
        }
    }

    fn note_events(&mut self, session_id: &str, count: u64) {
        self.events_since_request += count;
        if self.events_since_request >= EVENT_SYNC_BATCH {
            self.events_since_request = 0;
            self.request_sync(SyncRequest::SessionEvents(session_id.to_string()));
        }
    }
}
