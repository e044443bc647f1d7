use std::sync::Arc;

use chrono::Utc;
use tokio::{
    sync::{mpsc, watch},
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::engine::SyncEngine;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Work the session side asks for outside the periodic pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Session(String),
    SessionEvents(String),
    /// Session row, then all of its events.
    FinalizeSession(String),
    /// A full reconciliation right away.
    Full,
}

#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncRequest>,
}

impl SyncHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire and forget. Anything dropped here is picked up by the next
    /// reconciliation.
    pub fn request(&self, request: SyncRequest) {
        if self.tx.send(request).is_err() {
            log::warn!("Sync loop is not running; request dropped");
        }
    }
}

async fn serve(engine: &SyncEngine, request: SyncRequest) {
    log_debug!("sync request {request:?}");
    let result = match &request {
        SyncRequest::Session(id) => engine.sync_session(id).await.map(|_| ()),
        SyncRequest::SessionEvents(id) => engine.sync_session_events(id).await.map(|_| ()),
        SyncRequest::FinalizeSession(id) => engine.finalize_session(id).await,
        SyncRequest::Full => engine.reconcile_full().await,
    };
    if let Err(err) = result {
        log_warn!("sync request {request:?} failed: {err:#}");
    }
}

async fn periodic(engine: &SyncEngine) {
    let result = match engine.reconcile_due(Utc::now()).await {
        Ok(true) => engine.reconcile_full().await,
        Ok(false) => engine.run_once().await.map(|_| ()),
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        log_warn!("periodic sync failed: {err:#}");
    }
}

/// Drive the engine: every [`SYNC_INTERVAL`], on each offline to online
/// transition, and on requests from the session side. Requests that arrive
/// while offline wait for the connection to come back.
pub async fn sync_loop(
    engine: Arc<SyncEngine>,
    mut requests: mpsc::UnboundedReceiver<SyncRequest>,
    mut online: watch::Receiver<bool>,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SYNC_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut is_online = *online.borrow();
    let mut online_open = true;
    let mut requests_open = true;
    let mut deferred: Vec<SyncRequest> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log_info!("sync loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                if cancel_token.is_cancelled() {
                    break;
                }
                if is_online {
                    periodic(&engine).await;
                }
            }
            changed = online.changed(), if online_open => {
                if changed.is_err() {
                    online_open = false;
                    continue;
                }
                let now_online = *online.borrow_and_update();
                let came_back = now_online && !is_online;
                is_online = now_online;
                if came_back {
                    log_info!("back online, reconciling");
                    for request in deferred.drain(..) {
                        serve(&engine, request).await;
                    }
                    if let Err(err) = engine.reconcile_full().await {
                        log_warn!("reconciliation after reconnect failed: {err:#}");
                    }
                }
            }
            request = requests.recv(), if requests_open => {
                match request {
                    Some(request) if is_online => serve(&engine, request).await,
                    Some(request) => {
                        if !deferred.contains(&request) {
                            deferred.push(request);
                        }
                    }
                    None => requests_open = false,
                }
            }
        }
    }
}
