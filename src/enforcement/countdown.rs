use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;

use super::engine::BlockOverlay;

const ENABLE_LOGS: bool = false;

use crate::log_debug;

pub const TIMED_LOCK_COOLDOWN: Duration = Duration::from_secs(10);
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Seconds left before a lock started at `started_at` can be overridden.
pub fn remaining_secs(clock: &SharedClock, started_at: Duration) -> u64 {
    let elapsed = clock.monotonic().saturating_sub(started_at);
    let remaining = TIMED_LOCK_COOLDOWN.saturating_sub(elapsed);
    // Round up so the overlay shows 1 until the cooldown is really over.
    remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
}

/// Drives the overlay countdown once per second. The countdown is display
/// only: whether an override is allowed is always re-checked against the
/// clock by the engine.
pub(crate) fn spawn_countdown(
    clock: SharedClock,
    started_at: Duration,
    overlay_id: u64,
    overlay: Arc<watch::Sender<Option<BlockOverlay>>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(COUNTDOWN_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_debug!("timed-lock countdown {overlay_id} cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    // Checked after the wait as well: a cancel that races the
                    // tick must not touch the overlay.
                    if cancel.is_cancelled() {
                        break;
                    }
                    let remaining = remaining_secs(&clock, started_at);
                    overlay.send_modify(|current| {
                        if let Some(shown) = current.as_mut().filter(|o| o.id == overlay_id) {
                            shown.countdown_remaining = Some(remaining);
                            shown.override_available = remaining == 0;
                        }
                    });
                    if remaining == 0 {
                        log_debug!("timed-lock countdown {overlay_id} finished");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[test]
    fn remaining_rounds_up_and_ignores_wall_jumps() {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = clock.clone();
        let start = clock.monotonic();

        assert_eq!(remaining_secs(&shared, start), 10);
        clock.advance(Duration::from_millis(9_500));
        assert_eq!(remaining_secs(&shared, start), 1);
        clock.jump_wall(chrono::Duration::hours(-3));
        assert_eq!(remaining_secs(&shared, start), 1);
        clock.advance(Duration::from_millis(500));
        assert_eq!(remaining_secs(&shared, start), 0);
    }
}
