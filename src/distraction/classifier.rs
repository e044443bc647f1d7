use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{enforcement::BlocklistPolicy, platform::AppIdentity};

/// Which foreground switches may count as distractions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistractionScope {
    /// Anything that is not the host app or exempt.
    #[default]
    AnyApp,
    /// Only apps on the process blocklist.
    BlocklistOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Distraction,
    HostApp,
    Exempt,
    UserIdle,
    NotBlocklisted,
}

/// Inputs the classifier needs besides the app itself.
pub struct ClassifierContext<'a> {
    pub host_bundle_id: &'a str,
    pub exemptions: &'a HashSet<String>,
    pub policy: &'a BlocklistPolicy,
    pub scope: DistractionScope,
    pub user_idle: bool,
}

pub fn classify(app: &AppIdentity, ctx: &ClassifierContext<'_>) -> Verdict {
    if app.bundle_id.eq_ignore_ascii_case(ctx.host_bundle_id) {
        return Verdict::HostApp;
    }
    if ctx.exemptions.contains(&app.bundle_id) {
        return Verdict::Exempt;
    }
    // Idle counts as a break, not as time spent in the frontmost app.
    if ctx.user_idle {
        return Verdict::UserIdle;
    }
    if ctx.scope == DistractionScope::BlocklistOnly && ctx.policy.process_rule(&app.bundle_id).is_none() {
        return Verdict::NotBlocklisted;
    }
    Verdict::Distraction
}
