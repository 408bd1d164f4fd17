use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{inherit::StartupError, state::DispatcherState, EXIT_KEEPALIVE_TIMEOUT};

pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Exit(i32),
}

/// Recurring liveness timer: first tick one period after registration.
#[derive(Debug)]
pub struct LivenessTimer {
    interval: Interval,
}

impl LivenessTimer {
    /// # Errors
    /// Returns an error if the period is zero or its first tick cannot be scheduled.
    pub fn register(period: Duration) -> Result<Self, StartupError> {
        if period.is_zero() {
            return Err(StartupError::ZeroLivenessInterval);
        }
        let first = Instant::now()
            .checked_add(period)
            .ok_or(StartupError::DurationOutOfRange {
                setting: "liveness interval",
                secs: period.as_secs(),
            })?;
        let mut interval = interval_at(first, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(Self { interval })
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Decide whether the worker may exit now.
///
/// Exiting requires a pending stop *and* no session in flight, so a stop
/// (explicit, channel loss or keepalive starvation) always drains first.
pub fn evaluate(state: &mut DispatcherState) -> TickOutcome {
    if state.stop_requested() && state.active_sessions() == 0 {
        info!(exit_code = state.stop_exit_code(), "stop requested and no sessions in flight, exiting");
        return TickOutcome::Exit(state.stop_exit_code());
    }

    if state.keepalive_count() == 0 {
        if !state.stop_requested() {
            warn!(
                active_sessions = state.active_sessions(),
                "no keepalive from parent during the last interval, stopping"
            );
        }
        state.request_stop(EXIT_KEEPALIVE_TIMEOUT);
    }

    debug!(
        keepalives = state.keepalive_count(),
        active_sessions = state.active_sessions(),
        stop_requested = state.stop_requested(),
        "liveness tick"
    );
    state.reset_keepalives();
    TickOutcome::Continue
}
