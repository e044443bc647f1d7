use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::db::{
    Database, Project, SyncAction, Syncable, Task, TaskFields, UpsertOutcome,
    LAST_FULL_RECONCILE_AT, LAST_SYNC_AT,
};

use super::{
    client::{ApiError, AuthState, RemoteApi},
    types::{
        EventBatch, EventPayload, ProjectPayload, RemoteTask, SessionPayload, TaskPayload,
        MAX_EVENT_BATCH,
    },
};

/// Full reconciliation cadence.
pub const FULL_RECONCILE_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

/// What observers see of the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub in_progress: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub pulled: usize,
    pub kept_local: usize,
    pub failed: usize,
}

/// Resets the in-progress flag however the pass ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    db: Database,
    api: Arc<dyn RemoteApi>,
    auth: AuthState,
    in_progress: AtomicBool,
    /// Serialises session uploads, so a finalize and a batch request for the
    /// same session can never both create it remotely.
    session_gate: Mutex<()>,
    progress: watch::Sender<SyncProgress>,
}

impl SyncEngine {
    pub fn new(db: Database, api: Arc<dyn RemoteApi>, auth: AuthState) -> Self {
        let (progress, _rx) = watch::channel(SyncProgress::default());
        Self {
            db,
            api,
            auth,
            in_progress: AtomicBool::new(false),
            session_gate: Mutex::new(()),
            progress,
        }
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    fn set_progress(&self, apply: impl FnOnce(&mut SyncProgress)) {
        self.progress.send_modify(apply);
    }

    /// One pass over projects and tasks. `None` when skipped: signed out, or
    /// another pass is still running.
    pub async fn run_once(&self) -> Result<Option<SyncReport>> {
        if !self.auth.is_authenticated() {
            return Ok(None);
        }
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let _guard = PassGuard(&self.in_progress);
        self.set_progress(|p| p.in_progress = true);

        let result = self.pass().await;
        let now = Utc::now();
        match &result {
            Ok(report) => {
                self.db.set_sync_marker(LAST_SYNC_AT, now).await?;
                self.set_progress(|p| {
                    p.in_progress = false;
                    p.last_sync_at = Some(now);
                    p.last_error = None;
                });
                info!(
                    "Sync pass: {} created, {} updated, {} pulled, {} kept local, {} failed",
                    report.created, report.updated, report.pulled, report.kept_local, report.failed
                );
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.set_progress(|p| {
                    p.in_progress = false;
                    p.last_error = Some(message);
                });
            }
        }
        result.map(Some)
    }

    async fn pass(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let projects = self.db.list_projects_needing_sync().await?;
        let tasks = self.db.list_tasks_needing_sync().await?;

        // Creates go first so tasks can reference freshly created projects.
        for project in projects.iter().filter(|p| p.sync_action() == Some(SyncAction::Create)) {
            self.tally(&mut report, self.push_project(project).await, "project", &project.id);
        }
        for task in tasks.iter().filter(|t| t.sync_action() == Some(SyncAction::Create)) {
            self.tally(&mut report, self.push_task(task).await, "task", &task.id);
        }
        for project in projects.iter().filter(|p| p.sync_action() == Some(SyncAction::Update)) {
            self.tally(&mut report, self.push_project(project).await, "project", &project.id);
        }
        for task in tasks.iter().filter(|t| t.sync_action() == Some(SyncAction::Update)) {
            self.tally(&mut report, self.push_task(task).await, "task", &task.id);
        }

        // Each collection is pulled on its own so one failing endpoint does
        // not hold back the other.
        if let Err(err) = self.pull_projects(&mut report).await {
            report.failed += 1;
            warn!("Project pull failed: {err:#}");
        }
        if let Err(err) = self.pull_tasks(&mut report).await {
            report.failed += 1;
            warn!("Task pull failed: {err:#}");
        }
        Ok(report)
    }

    fn tally(&self, report: &mut SyncReport, result: Result<SyncAction>, kind: &str, id: &str) {
        match result {
            Ok(SyncAction::Create) => report.created += 1,
            Ok(SyncAction::Update) => report.updated += 1,
            Err(err) => {
                report.failed += 1;
                warn!("Failed to sync {kind} {id}: {err:#}");
            }
        }
    }

    async fn push_project(&self, project: &Project) -> Result<SyncAction> {
        let payload = ProjectPayload::from(project);
        match project.remote_id() {
            None => {
                let remote = self.api.create_project(payload).await?;
                self.db
                    .mark_project_synced(&project.id, &remote.id, project.updated_at)
                    .await?;
                Ok(SyncAction::Create)
            }
            Some(remote_id) => {
                self.api.update_project(remote_id.to_string(), payload).await?;
                self.db
                    .mark_project_synced(&project.id, remote_id, project.updated_at)
                    .await?;
                Ok(SyncAction::Update)
            }
        }
    }

    async fn push_task(&self, task: &Task) -> Result<SyncAction> {
        let remote_project_id = match &task.project_id {
            None => None,
            Some(project_id) => {
                let project = self
                    .db
                    .get_project(project_id)
                    .await?
                    .with_context(|| format!("task references missing project {project_id}"))?;
                match project.remote_id {
                    Some(remote_id) => Some(remote_id),
                    None => bail!("project {project_id} is not on the backend yet"),
                }
            }
        };
        let payload = TaskPayload::from_task(task, remote_project_id);
        match task.remote_id() {
            None => {
                let remote = self.api.create_task(payload).await?;
                self.db
                    .mark_task_synced(&task.id, &remote.id, task.updated_at)
                    .await?;
                Ok(SyncAction::Create)
            }
            Some(remote_id) => {
                self.api.update_task(remote_id.to_string(), payload).await?;
                self.db
                    .mark_task_synced(&task.id, remote_id, task.updated_at)
                    .await?;
                Ok(SyncAction::Update)
            }
        }
    }

    async fn pull_projects(&self, report: &mut SyncReport) -> Result<()> {
        let remote_projects = self.api.list_projects().await.context("failed to pull projects")?;
        for remote in &remote_projects {
            match self
                .db
                .upsert_remote_project(&remote.id, &remote.name, remote.updated_at)
                .await
            {
                Ok(outcome) => count_upsert(report, outcome),
                Err(err) => {
                    report.failed += 1;
                    warn!("Failed to apply remote project {}: {err:#}", remote.id);
                }
            }
        }
        Ok(())
    }

    async fn pull_tasks(&self, report: &mut SyncReport) -> Result<()> {
        let remote_tasks = self.api.list_tasks().await.context("failed to pull tasks")?;
        for remote in &remote_tasks {
            if let Err(err) = self.apply_remote_task(report, remote).await {
                report.failed += 1;
                warn!("Failed to apply remote task {}: {err:#}", remote.id);
            }
        }
        Ok(())
    }

    async fn apply_remote_task(&self, report: &mut SyncReport, remote: &RemoteTask) -> Result<()> {
        let project_id = match &remote.project_id {
            Some(remote_project) => self
                .db
                .find_project_by_remote_id(remote_project)
                .await?
                .map(|p| p.id),
            None => None,
        };
        let fields = TaskFields {
            project_id,
            title: remote.title.clone(),
            estimate_minutes: remote.estimate_minutes,
            priority: remote.priority,
            status: remote.status,
            due_date: remote.due_date,
            sort_order: remote.sort_order,
        };
        let outcome = self
            .db
            .upsert_remote_task(&remote.id, fields, remote.updated_at)
            .await?;
        count_upsert(report, outcome);
        Ok(())
    }

    /// Upload the session row: create when it has no remote id, otherwise
    /// PATCH. Returns the remote id.
    pub async fn sync_session(&self, session_id: &str) -> Result<Option<String>> {
        if !self.auth.is_authenticated() {
            return Ok(None);
        }
        let _gate = self.session_gate.lock().await;
        self.push_session(session_id).await.map(Some)
    }

    async fn push_session(&self, session_id: &str) -> Result<String> {
        let session = self
            .db
            .get_session(session_id)
            .await?
            .with_context(|| format!("session {session_id} not found"))?;
        let payload = SessionPayload::from(&session);

        let remote_id = match (session.sync_action(), session.remote_id.clone()) {
            (None, Some(remote_id)) => return Ok(remote_id),
            (_, Some(remote_id)) => {
                self.api.update_session(remote_id.clone(), payload).await?;
                remote_id
            }
            (_, None) => self.api.create_session(payload).await?.id,
        };
        self.db
            .mark_session_synced(&session.id, &remote_id, session.updated_at)
            .await?;
        Ok(remote_id)
    }

    /// Upload unsent events in order, in batches the backend accepts. A batch
    /// is marked synced only once the backend acknowledged all of it.
    pub async fn sync_session_events(&self, session_id: &str) -> Result<usize> {
        if !self.auth.is_authenticated() {
            return Ok(0);
        }
        let _gate = self.session_gate.lock().await;
        self.push_events(session_id).await
    }

    async fn push_events(&self, session_id: &str) -> Result<usize> {
        let session = self
            .db
            .get_session(session_id)
            .await?
            .with_context(|| format!("session {session_id} not found"))?;
        let remote_id = match session.remote_id.clone() {
            Some(remote_id) => remote_id,
            None => self.push_session(session_id).await?,
        };

        let mut uploaded = 0;
        loop {
            let events = self
                .db
                .list_unsynced_events(session_id, MAX_EVENT_BATCH as u32)
                .await?;
            if events.is_empty() {
                break;
            }
            let batch = EventBatch {
                events: events.iter().map(EventPayload::from).collect(),
            };
            let stored = match self.api.append_events(remote_id.clone(), batch).await {
                Ok(acked) => acked.len(),
                // The backend answers 404 both for an unknown session and for a
                // batch it had already stored in full. Only the first is a failure.
                Err(err) if ApiError::status_of(&err) == Some(404) => {
                    self.api
                        .update_session(remote_id.clone(), SessionPayload::from(&session))
                        .await
                        .with_context(|| {
                            format!("event upload for session {session_id} failed: {err:#}")
                        })?;
                    0
                }
                Err(err) => {
                    return Err(err.context(format!("event upload for session {session_id} failed")))
                }
            };
            if stored < events.len() {
                debug!(
                    "Backend already had {} of {} events for session {session_id}",
                    events.len() - stored,
                    events.len()
                );
            }
            uploaded += events.len();
            self.db
                .mark_events_synced(events.into_iter().map(|e| e.id).collect())
                .await?;
        }
        Ok(uploaded)
    }

    /// The session row, then its events.
    pub async fn finalize_session(&self, session_id: &str) -> Result<()> {
        if !self.auth.is_authenticated() {
            return Ok(());
        }
        let _gate = self.session_gate.lock().await;
        self.push_session(session_id).await?;
        self.push_events(session_id).await?;
        Ok(())
    }

    /// Everything still unsynced, sessions included.
    pub async fn reconcile_full(&self) -> Result<()> {
        if !self.auth.is_authenticated() {
            return Ok(());
        }
        if let Err(err) = self.run_once().await {
            warn!("Sync pass during reconciliation failed: {err:#}");
        }

        let sessions = self.db.list_sessions_needing_sync().await?;
        let mut failed = 0;
        for session in &sessions {
            if let Err(err) = self.finalize_session(&session.id).await {
                failed += 1;
                warn!("Failed to reconcile session {}: {err:#}", session.id);
            }
        }
        self.db
            .set_sync_marker(LAST_FULL_RECONCILE_AT, Utc::now())
            .await?;
        info!(
            "Full reconciliation: {} session(s) pending, {failed} failed",
            sessions.len()
        );
        Ok(())
    }

    pub async fn reconcile_due(&self, now: DateTime<Utc>) -> Result<bool> {
        let last = self.db.get_sync_marker(LAST_FULL_RECONCILE_AT).await?;
        let every = FULL_RECONCILE_EVERY.as_secs() as i64;
        Ok(last.map_or(true, |at| (now - at).num_seconds() >= every))
    }
}

fn count_upsert(report: &mut SyncReport, outcome: UpsertOutcome) {
    match outcome {
        UpsertOutcome::Inserted | UpsertOutcome::Overwritten => report.pulled += 1,
        UpsertOutcome::KeptLocal => report.kept_local += 1,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::{
        db::{test_support::temp_db, EventType, NewEvent, Session, SyncStatus},
        sync::{
            client::{ApiFuture, HttpApi},
            types::{RemoteEvent, RemoteProject, RemoteSession, RemoteTask, SessionSummary},
        },
    };

    /// In-memory backend. `fail_appends_after` makes event uploads fail once
    /// that many batches went through; `fail_project_pulls` makes
    /// `list_projects` answer with an error.
    #[derive(Default)]
    pub(crate) struct FakeApi {
        pub sessions_created: StdMutex<Vec<SessionPayload>>,
        pub sessions_updated: StdMutex<Vec<String>>,
        pub batches: StdMutex<Vec<usize>>,
        pub fail_appends_after: StdMutex<Option<usize>>,
        pub fail_project_pulls: StdMutex<bool>,
        pub projects: StdMutex<Vec<RemoteProject>>,
        pub tasks: StdMutex<Vec<RemoteTask>>,
        pub summary: StdMutex<Option<String>>,
    }

    impl RemoteApi for FakeApi {
        fn create_session(&self, payload: SessionPayload) -> ApiFuture<'_, RemoteSession> {
            Box::pin(async move {
                let mut created = self.sessions_created.lock().expect("lock");
                created.push(payload.clone());
                Ok(RemoteSession {
                    id: format!("remote-{}", created.len()),
                    start_time: payload.start_time,
                    end_time: payload.end_time,
                    duration_seconds: payload.duration_seconds,
                    focused_seconds: payload.focused_seconds,
                    distraction_count: payload.distraction_count,
                    is_complete: payload.is_complete,
                    updated_at: Utc::now(),
                })
            })
        }

        fn update_session(&self, remote_id: String, payload: SessionPayload) -> ApiFuture<'_, RemoteSession> {
            Box::pin(async move {
                self.sessions_updated.lock().expect("lock").push(remote_id.clone());
                Ok(RemoteSession {
                    id: remote_id,
                    start_time: payload.start_time,
                    end_time: payload.end_time,
                    duration_seconds: payload.duration_seconds,
                    focused_seconds: payload.focused_seconds,
                    distraction_count: payload.distraction_count,
                    is_complete: payload.is_complete,
                    updated_at: Utc::now(),
                })
            })
        }

        fn append_events(&self, _remote_session_id: String, batch: EventBatch) -> ApiFuture<'_, Vec<RemoteEvent>> {
            Box::pin(async move {
                let mut batches = self.batches.lock().expect("lock");
                if let Some(limit) = *self.fail_appends_after.lock().expect("lock") {
                    if batches.len() >= limit {
                        bail!("backend unavailable");
                    }
                }
                batches.push(batch.events.len());
                Ok(batch
                    .events
                    .iter()
                    .enumerate()
                    .map(|(i, e)| RemoteEvent {
                        id: format!("re-{i}"),
                        event_type: e.event_type.clone(),
                    })
                    .collect())
            })
        }

        fn list_projects(&self) -> ApiFuture<'_, Vec<RemoteProject>> {
            Box::pin(async move {
                if *self.fail_project_pulls.lock().expect("lock") {
                    bail!("projects 503");
                }
                Ok(self.projects.lock().expect("lock").clone())
            })
        }

        fn create_project(&self, payload: ProjectPayload) -> ApiFuture<'_, RemoteProject> {
            Box::pin(async move {
                let mut projects = self.projects.lock().expect("lock");
                let project = RemoteProject {
                    id: format!("rp-{}", projects.len() + 1),
                    name: payload.name,
                    updated_at: Utc::now() - chrono::Duration::hours(1),
                };
                projects.push(project.clone());
                Ok(project)
            })
        }

        fn update_project(&self, remote_id: String, payload: ProjectPayload) -> ApiFuture<'_, RemoteProject> {
            Box::pin(async move {
                Ok(RemoteProject {
                    id: remote_id,
                    name: payload.name,
                    updated_at: Utc::now(),
                })
            })
        }

        fn list_tasks(&self) -> ApiFuture<'_, Vec<RemoteTask>> {
            Box::pin(async move { Ok(self.tasks.lock().expect("lock").clone()) })
        }

        fn create_task(&self, payload: TaskPayload) -> ApiFuture<'_, RemoteTask> {
            Box::pin(async move {
                let mut tasks = self.tasks.lock().expect("lock");
                let task = RemoteTask {
                    id: format!("rt-{}", tasks.len() + 1),
                    project_id: payload.project_id,
                    title: payload.title,
                    estimate_minutes: payload.estimate_minutes,
                    priority: payload.priority,
                    status: payload.status,
                    due_date: payload.due_date,
                    sort_order: payload.sort_order,
                    updated_at: Utc::now() - chrono::Duration::hours(1),
                };
                tasks.push(task.clone());
                Ok(task)
            })
        }

        fn update_task(&self, remote_id: String, payload: TaskPayload) -> ApiFuture<'_, RemoteTask> {
            Box::pin(async move {
                Ok(RemoteTask {
                    id: remote_id,
                    project_id: payload.project_id,
                    title: payload.title,
                    estimate_minutes: payload.estimate_minutes,
                    priority: payload.priority,
                    status: payload.status,
                    due_date: payload.due_date,
                    sort_order: payload.sort_order,
                    updated_at: Utc::now(),
                })
            })
        }

        fn session_summary(&self, _remote_session_id: String) -> ApiFuture<'_, SessionSummary> {
            Box::pin(async move {
                match self.summary.lock().expect("lock").clone() {
                    Some(summary) => Ok(SessionSummary {
                        summary,
                        is_ai_generated: true,
                    }),
                    None => bail!("insights unavailable"),
                }
            })
        }
    }

    fn engine(db: &Database, api: Arc<FakeApi>) -> SyncEngine {
        SyncEngine::new(db.clone(), api, AuthState::new(Some("token".into())))
    }

    async fn seed_session(db: &Database, id: &str, extra_events: usize) {
        let start = Utc::now();
        db.insert_session_with_start(
            &Session::begin(id.into(), start),
            NewEvent::lifecycle(EventType::Start, start),
        )
        .await
        .expect("insert");
        let events = (0..extra_events)
            .map(|i| NewEvent::distraction(start, format!("app-{i}"), 1, None))
            .collect();
        db.append_events(id, events).await.expect("append");
    }

    #[tokio::test]
    async fn session_upload_is_idempotent() {
        let (_dir, db) = temp_db();
        let api = Arc::new(FakeApi::default());
        let engine = engine(&db, api.clone());
        seed_session(&db, "s1", 0).await;

        let first = engine.sync_session("s1").await.expect("sync");
        let second = engine.sync_session("s1").await.expect("sync again");
        assert_eq!(first, second);
        assert_eq!(api.sessions_created.lock().expect("lock").len(), 1);
        assert!(api.sessions_updated.lock().expect("lock").is_empty());

        let session = db.get_session("s1").await.expect("get").expect("row");
        assert_eq!(session.sync_status, SyncStatus::Synced);
        assert_eq!(session.remote_id.as_deref(), Some("remote-1"));
    }

    #[tokio::test]
    async fn later_changes_are_patched_not_recreated() {
        let (_dir, db) = temp_db();
        let api = Arc::new(FakeApi::default());
        let engine = engine(&db, api.clone());
        seed_session(&db, "s1", 0).await;
        engine.sync_session("s1").await.expect("create");

        let counters = crate::db::SessionCounters {
            duration_seconds: 30,
            focused_seconds: 30,
            distraction_count: 0,
        };
        db.checkpoint_session("s1", counters, Vec::new(), Utc::now() + chrono::Duration::seconds(1))
            .await
            .expect("checkpoint");
        engine.sync_session("s1").await.expect("patch");

        assert_eq!(api.sessions_created.lock().expect("lock").len(), 1);
        assert_eq!(*api.sessions_updated.lock().expect("lock"), vec!["remote-1".to_string()]);
    }

    #[tokio::test]
    async fn events_go_out_in_backend_sized_batches() {
        let (_dir, db) = temp_db();
        let api = Arc::new(FakeApi::default());
        let engine = engine(&db, api.clone());
        seed_session(&db, "s1", 1199).await;

        let uploaded = engine.sync_session_events("s1").await.expect("upload");
        assert_eq!(uploaded, 1200);
        assert_eq!(*api.batches.lock().expect("lock"), vec![500, 500, 200]);
        assert_eq!(db.count_unsynced_events("s1").await.expect("count"), 0);
        assert_eq!(api.sessions_created.lock().expect("lock").len(), 1, "session created first");
    }

    #[tokio::test]
    async fn a_failed_batch_stays_unsynced() {
        let (_dir, db) = temp_db();
        let api = Arc::new(FakeApi::default());
        *api.fail_appends_after.lock().expect("lock") = Some(1);
        let engine = engine(&db, api.clone());
        seed_session(&db, "s1", 699).await;

        assert!(engine.sync_session_events("s1").await.is_err());
        assert_eq!(db.count_unsynced_events("s1").await.expect("count"), 200);

        *api.fail_appends_after.lock().expect("lock") = None;
        engine.reconcile_full().await.expect("reconcile");
        assert_eq!(db.count_unsynced_events("s1").await.expect("count"), 0);
        assert!(!engine.reconcile_due(Utc::now()).await.expect("due"));
    }

    #[tokio::test]
    async fn run_once_pushes_local_and_pulls_remote() {
        let (_dir, db) = temp_db();
        let api = Arc::new(FakeApi::default());
        api.projects.lock().expect("lock").push(RemoteProject {
            id: "rp-remote".into(),
            name: "From phone".into(),
            updated_at: Utc::now(),
        });
        let engine = engine(&db, api.clone());

        let local = db.create_project("Thesis").await.expect("project");
        db.create_task(TaskFields {
            project_id: Some(local.id.clone()),
            title: "Outline".into(),
            priority: 2,
            ..TaskFields::default()
        })
        .await
        .expect("task");

        let report = engine.run_once().await.expect("run").expect("not skipped");
        assert_eq!(report.created, 2);
        assert_eq!(report.failed, 0);

        let tasks = api.tasks.lock().expect("lock").clone();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].project_id.as_deref(), Some("rp-2"));

        let names: Vec<_> = db
            .list_projects()
            .await
            .expect("projects")
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert!(names.contains(&"From phone".to_string()));
        assert!(db.list_projects_needing_sync().await.expect("pending").is_empty());
        assert!(engine.progress().borrow().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn signed_out_engine_does_nothing() {
        let (_dir, db) = temp_db();
        let api = Arc::new(FakeApi::default());
        let engine = SyncEngine::new(db.clone(), api.clone(), AuthState::default());
        seed_session(&db, "s1", 0).await;

        assert!(engine.run_once().await.expect("run").is_none());
        assert!(engine.sync_session("s1").await.expect("sync").is_none());
        assert!(api.sessions_created.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn task_pull_survives_a_failing_project_pull() {
        let (_dir, db) = temp_db();
        let api = Arc::new(FakeApi::default());
        *api.fail_project_pulls.lock().expect("lock") = true;
        api.tasks.lock().expect("lock").push(RemoteTask {
            id: "rt-remote".into(),
            project_id: None,
            title: "Read chapter 3".into(),
            estimate_minutes: Some(25),
            priority: 1,
            status: 0,
            due_date: None,
            sort_order: 0,
            updated_at: Utc::now(),
        });
        let engine = engine(&db, api.clone());

        let report = engine.run_once().await.expect("run").expect("not skipped");
        assert_eq!(report.failed, 1);
        assert_eq!(report.pulled, 1);

        let tasks = db.list_tasks().await.expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Read chapter 3");
        assert!(db.get_sync_marker(LAST_SYNC_AT).await.expect("marker").is_some());
    }

    const DUPLICATE_BATCH: &str =
        r#"{"detail":"Session not found or all events were duplicates"}"#;

    async fn synced_session(db: &Database, id: &str, remote_id: &str) {
        seed_session(db, id, 0).await;
        let session = db.get_session(id).await.expect("get").expect("row");
        db.mark_session_synced(id, remote_id, session.updated_at)
            .await
            .expect("mark synced");
    }

    fn remote_session_body(id: &str) -> String {
        serde_json::json!({
            "id": id,
            "start_time": "2026-01-01T10:00:00Z",
            "end_time": null,
            "duration_seconds": 0,
            "focused_seconds": 0,
            "distraction_count": 0,
            "is_complete": false,
            "updated_at": "2026-01-01T10:00:00Z"
        })
        .to_string()
    }

    #[tokio::test]
    async fn resent_batch_the_backend_already_has_is_marked_synced() {
        let (_dir, db) = temp_db();
        synced_session(&db, "s1", "r1").await;

        let mut server = mockito::Server::new_async().await;
        let append = server
            .mock("POST", "/sessions/r1/events")
            .with_status(404)
            .with_body(DUPLICATE_BATCH)
            .expect(1)
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", "/sessions/r1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(remote_session_body("r1"))
            .create_async()
            .await;

        let auth = AuthState::new(Some("token".into()));
        let api = Arc::new(HttpApi::new(&server.url(), auth.clone()).expect("client"));
        let engine = SyncEngine::new(db.clone(), api, auth);

        assert_eq!(engine.sync_session_events("s1").await.expect("upload"), 1);
        assert_eq!(db.count_unsynced_events("s1").await.expect("count"), 0);
        assert_eq!(engine.sync_session_events("s1").await.expect("nothing left"), 0);
        append.assert_async().await;
        patch.assert_async().await;
    }

    #[tokio::test]
    async fn batch_for_a_session_the_backend_lost_stays_unsynced() {
        let (_dir, db) = temp_db();
        synced_session(&db, "s1", "gone").await;

        let mut server = mockito::Server::new_async().await;
        let _append = server
            .mock("POST", "/sessions/gone/events")
            .with_status(404)
            .with_body(DUPLICATE_BATCH)
            .create_async()
            .await;
        let _patch = server
            .mock("PATCH", "/sessions/gone")
            .with_status(404)
            .with_body(r#"{"detail":"Session not found"}"#)
            .create_async()
            .await;

        let auth = AuthState::new(Some("token".into()));
        let api = Arc::new(HttpApi::new(&server.url(), auth.clone()).expect("client"));
        let engine = SyncEngine::new(db.clone(), api, auth);

        assert!(engine.sync_session_events("s1").await.is_err());
        assert_eq!(db.count_unsynced_events("s1").await.expect("count"), 1);
    }
}
