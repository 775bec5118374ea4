use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Session, SessionTimings};

/// Two-tier idle policy: a stream that never became active gets the longer
/// inactive timeout.
pub fn should_stop(active: bool, idle: Duration, timings: &SessionTimings) -> bool {
    if active {
        idle > timings.active_idle_timeout
    } else {
        idle > timings.inactive_idle_timeout
    }
}

pub(super) async fn reap_idle(session: Arc<Session>, shutdown: CancellationToken) {
    let period = session.timings().reaper_period;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => session.cleanup(),
        }
    }
}
