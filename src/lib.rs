pub mod clock;
pub mod db;
pub mod distraction;
pub mod dns;
pub mod enforcement;
pub mod platform;
pub mod sensing;
pub mod session;
pub mod settings;
pub mod summary;
pub mod sync;
pub mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use clock::{SharedClock, SystemClock};
use db::Database;
use enforcement::{EnforcementEngine, PolicyService, ProcessTerminator, SysinfoTerminator};
use session::{SessionConfig, SessionController, SessionDeps, SignalSource};
use settings::Settings;
use summary::SummaryService;
use sync::{AuthState, HttpApi, ReachabilityMonitor, RemoteApi, SyncEngine, SyncHandle};

/// Platform services the core runs against. `native` picks the real ones;
/// tests swap in doubles.
pub struct Services {
    pub clock: SharedClock,
    pub source: SignalSource,
    pub terminator: Arc<dyn ProcessTerminator>,
    /// `None` builds an HTTP client for `Settings::api_base_url`.
    pub api: Option<Arc<dyn RemoteApi>>,
    /// `None` follows `Settings::reachability_probe`.
    pub online: Option<watch::Receiver<bool>>,
}

impl Services {
    pub fn native() -> Self {
        Self {
            clock: SystemClock::shared(),
            source: SignalSource::AppSwitch(platform::native_probe()),
            terminator: Arc::new(SysinfoTerminator::new()),
            api: None,
            online: None,
        }
    }
}

/// Everything the host process keeps alive.
pub struct AppState {
    pub settings: Settings,
    pub db: Database,
    pub session: SessionController,
    pub policy: Arc<PolicyService>,
    pub auth: AuthState,
    pub sync: SyncHandle,
    pub sync_engine: Arc<SyncEngine>,
    pub summary: SummaryService,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _online_tx: Option<watch::Sender<bool>>,
}

impl AppState {
    /// Stop the session task and every background loop.
    pub async fn shutdown(self) {
        self.session.shutdown().await;
        self.cancel_token.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!("Background task failed to join: {err}");
            }
        }
        info!("Tether stopped");
    }
}

/// Open the store, recover any interrupted session and start the background
/// loops. Must be called inside a tokio runtime.
pub async fn bootstrap(settings: Settings, services: Services) -> Result<AppState> {
    let db = Database::new(settings.database_path()?).context("failed to open database")?;
    let policy = Arc::new(
        PolicyService::load(db.clone(), settings.resolved_snapshot_path()?)
            .await
            .context("failed to load blocklist")?,
    );

    let auth = AuthState::new(settings.api_token.clone());
    let api: Arc<dyn RemoteApi> = match services.api {
        Some(api) => api,
        None => Arc::new(HttpApi::new(&settings.api_base_url, auth.clone())?),
    };
    let sync_engine = Arc::new(SyncEngine::new(db.clone(), api.clone(), auth.clone()));
    let summary = SummaryService::new(api, auth.clone());

    let cancel_token = CancellationToken::new();
    let mut tasks = Vec::new();
    let mut online_tx = None;
    let online = match services.online {
        Some(online) => online,
        None if settings.reachability_probe => {
            let (rx, handle) =
                ReachabilityMonitor::for_url(&settings.api_base_url)?.spawn(cancel_token.clone());
            tasks.push(handle);
            rx
        }
        None => {
            let (tx, rx) = watch::channel(true);
            online_tx = Some(tx);
            rx
        }
    };

    let (sync, requests) = SyncHandle::channel();
    tasks.push(tokio::spawn(sync::sync_loop(
        sync_engine.clone(),
        requests,
        online,
        cancel_token.clone(),
    )));

    let enforcement = EnforcementEngine::new(
        policy.subscribe(),
        services.terminator,
        services.clock.clone(),
    );
    let session = SessionController::spawn(SessionDeps {
        db: db.clone(),
        clock: services.clock,
        source: services.source,
        enforcement,
        policy: policy.subscribe(),
        sync: Some(sync.clone()),
        config: SessionConfig {
            host_bundle_id: settings.host_bundle_id.clone(),
            scope: settings.distraction_scope,
            ..SessionConfig::default()
        },
    })
    .await?;

    info!("Tether ready (data in {})", settings.resolved_data_dir()?.display());
    Ok(AppState {
        settings,
        db,
        session,
        policy,
        auth,
        sync,
        sync_engine,
        summary,
        cancel_token,
        tasks,
        _online_tx: online_tx,
    })
}
