use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::platform::ForegroundProbe;

use super::idle::IdleDetector;
use super::loop_worker::activity_loop;
use super::ActivitySink;

/// Owns the polling task. `start` and `stop` are called by the session owner
/// on every running-state transition.
pub struct ActivityMonitor {
    probe: Arc<dyn ForegroundProbe>,
    detector: IdleDetector,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl ActivityMonitor {
    pub fn new(probe: Arc<dyn ForegroundProbe>) -> Self {
        let detector = IdleDetector::new(probe.clone());
        Self::with_detector(probe, detector)
    }

    pub fn with_detector(probe: Arc<dyn ForegroundProbe>, detector: IdleDetector) -> Self {
        Self {
            probe,
            detector,
            handle: None,
            cancel_token: None,
        }
    }

    pub fn detector(&self) -> &IdleDetector {
        &self.detector
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self, sink: Box<dyn ActivitySink>) -> Result<()> {
        if self.handle.is_some() {
            bail!("activity monitor already running");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(activity_loop(
            self.probe.clone(),
            self.detector.clone(),
            sink,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        info!("Activity monitor started");
        Ok(())
    }

    /// Cancel the poll task and wait for it, so no event from this run can
    /// arrive after the call returns.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("activity loop task failed to join")?;
            info!("Activity monitor stopped");
        }
        Ok(())
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AppIdentity, ScriptedProbe};
    use crate::sensing::ActivityEvent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn reports_switches_until_stopped() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_frontmost(Some(AppIdentity::new("Code", "code")));

        let (tx, mut rx) = mpsc::unbounded_channel::<ActivityEvent>();
        let mut monitor = ActivityMonitor::new(probe.clone());
        monitor.start(Box::new(tx)).expect("start");
        assert!(monitor.start(Box::new(mpsc::unbounded_channel::<ActivityEvent>().0)).is_err());

        let first = rx.recv().await.expect("event");
        assert!(matches!(first, ActivityEvent::AppSwitch { ref app, .. } if app.bundle_id == "code"));

        probe.set_frontmost(Some(AppIdentity::new("Slack", "slack")));
        let second = rx.recv().await.expect("event");
        assert!(matches!(second, ActivityEvent::AppSwitch { ref app, .. } if app.bundle_id == "slack"));

        monitor.stop().await.expect("stop");
        assert!(!monitor.is_running());
        probe.set_frontmost(Some(AppIdentity::new("Mail", "mail")));
        assert!(rx.recv().await.is_none(), "sink dropped with the task");
    }
}
