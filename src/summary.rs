use std::sync::Arc;

use log::warn;

use crate::{
    db::Session,
    sync::{AuthState, RemoteApi},
};

/// Quality label for a focused/elapsed ratio.
pub fn focus_quality(duration_seconds: u64, focused_seconds: u64) -> &'static str {
    let ratio = if duration_seconds > 0 {
        focused_seconds.min(duration_seconds) as f64 / duration_seconds as f64
    } else {
        0.0
    };
    if ratio >= 0.9 {
        "excellent"
    } else if ratio >= 0.75 {
        "solid"
    } else if ratio >= 0.5 {
        "decent"
    } else {
        "challenging"
    }
}

/// Rule-based summary used whenever the backend cannot provide one.
pub fn fallback_summary(session: &Session) -> String {
    let quality = focus_quality(session.duration_seconds, session.focused_seconds);
    let duration_min = (session.duration_seconds as f64 / 60.0).round();
    let focused_min = (session.focused_seconds.min(session.duration_seconds) as f64 / 60.0).round();

    let mut text = format!(
        "You completed a {quality} {duration_min:.0}-minute session with {focused_min:.0} minutes of focused work."
    );
    match session.distraction_count {
        0 => text.push_str(" Zero distractions, impressive discipline!"),
        1 => text.push_str(" Only 1 distraction. Keep that focus strong."),
        2 => text.push_str(" Only 2 distractions. Keep that focus strong."),
        n => text.push_str(&format!(
            " You had {n} distractions. Try closing unnecessary apps before your next session."
        )),
    }
    text
}

pub struct SummaryService {
    api: Arc<dyn RemoteApi>,
    auth: AuthState,
}

impl SummaryService {
    pub fn new(api: Arc<dyn RemoteApi>, auth: AuthState) -> Self {
        Self { api, auth }
    }

    /// Backend summary for synced sessions, the local fallback otherwise.
    pub async fn summarize(&self, session: &Session) -> String {
        let Some(remote_id) = session.remote_id.clone() else {
            return fallback_summary(session);
        };
        if !self.auth.is_authenticated() {
            return fallback_summary(session);
        }
        match self.api.session_summary(remote_id).await {
            Ok(summary) if !summary.summary.trim().is_empty() => summary.summary,
            Ok(_) => fallback_summary(session),
            Err(err) => {
                warn!("Session summary unavailable, using local text: {err:#}");
                fallback_summary(session)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::sync::engine::tests::FakeApi;

    fn finished(duration: u64, focused: u64, distractions: u32) -> Session {
        let mut session = Session::begin("s".into(), Utc::now());
        session.duration_seconds = duration;
        session.focused_seconds = focused;
        session.distraction_count = distractions;
        session.is_complete = true;
        session
    }

    #[test]
    fn quality_buckets() {
        assert_eq!(focus_quality(100, 95), "excellent");
        assert_eq!(focus_quality(100, 80), "solid");
        assert_eq!(focus_quality(100, 50), "decent");
        assert_eq!(focus_quality(100, 10), "challenging");
        assert_eq!(focus_quality(0, 0), "challenging");
    }

    #[test]
    fn fallback_text() {
        assert_eq!(
            fallback_summary(&finished(1500, 1440, 0)),
            "You completed a excellent 25-minute session with 24 minutes of focused work. \
             Zero distractions, impressive discipline!"
        );
        assert!(fallback_summary(&finished(1800, 900, 5)).contains("You had 5 distractions"));
    }

    #[tokio::test]
    async fn falls_back_without_remote_id_or_on_error() {
        let api = Arc::new(FakeApi::default());
        let service = SummaryService::new(api.clone(), AuthState::new(Some("t".into())));

        let local = finished(600, 600, 0);
        assert_eq!(service.summarize(&local).await, fallback_summary(&local));

        let mut synced = finished(600, 600, 0);
        synced.remote_id = Some("remote-1".into());
        assert_eq!(service.summarize(&synced).await, fallback_summary(&synced));

        *api.summary.lock().expect("lock") = Some("Great flow today.".into());
        assert_eq!(service.summarize(&synced).await, "Great flow today.");
    }
}
