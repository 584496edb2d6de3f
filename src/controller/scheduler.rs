use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::{ControllerState, CycleOutcome, MpcController, StateStore};
use crate::forecast::TaskStatus;

/// Start of the `step_minutes` slot containing `t` (UTC arithmetic)
pub fn floor_to_step(t: DateTime<Utc>, step_minutes: u32) -> DateTime<Utc> {
    let step = ChronoDuration::minutes(step_minutes.max(1) as i64);
    t.duration_trunc(step).unwrap_or(t)
}

pub fn quarter_hour_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_step(t, 15)
}

/// First slot boundary strictly after `t`
pub fn next_boundary(t: DateTime<Utc>, step_minutes: u32) -> DateTime<Utc> {
    floor_to_step(t, step_minutes) + ChronoDuration::minutes(step_minutes.max(1) as i64)
}

/// Periodic driver of the MPC cycle, aligned to step boundaries
pub struct ControlLoop {
    controller: Arc<MpcController>,
    store: Option<Arc<StateStore>>,
    status: Arc<RwLock<TaskStatus>>,
}

impl ControlLoop {
    pub fn new(controller: Arc<MpcController>, store: Option<Arc<StateStore>>) -> Self {
        Self {
            controller,
            store,
            status: Arc::new(RwLock::new(TaskStatus::default())),
        }
    }

    /// Run cycles until `shutdown` flips to true; returns the final state.
    ///
    /// Cycles never overlap: a tick that arrives while a cycle is still
    /// running is skipped.
    pub async fn run(
        &self,
        initial: ControllerState,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ControllerState> {
        let step_minutes = self.controller.plant().step_minutes;
        let period = Duration::from_secs(step_minutes.max(1) as u64 * 60);
        let now = Utc::now();
        let first = next_boundary(now, step_minutes);
        let delay = (first - now).to_std().unwrap_or_default();
        let mut ticker = interval_at(Instant::now() + delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(%first, step_minutes, "control loop armed");

        let mut state = initial;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let tick = floor_to_step(Utc::now(), step_minutes);
                    state = self.tick(state, tick).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(cycles = state.cycle, "control loop stopped");
        Ok(state)
    }

    /// One cycle plus persistence and bookkeeping
    pub async fn tick(&self, state: ControllerState, tick: DateTime<Utc>) -> ControllerState {
        self.status.write().await.started(Utc::now());
        let (state, report) = self.controller.run_cycle(state, tick).await;
        {
            let mut status = self.status.write().await;
            match &report.outcome {
                CycleOutcome::Committed { .. } => status.succeeded(Utc::now()),
                other => status.failed(other.to_string()),
            }
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&state).await {
                warn!(error = %e, "controller state not persisted");
            }
        }
        state
    }

    pub async fn status(&self) -> TaskStatus {
        self.status.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_floor_and_next_boundary() {
        let t = Utc.with_ymd_and_hms(2024, 11, 15, 10, 44, 59).unwrap();
        assert_eq!(
            quarter_hour_floor(t),
            Utc.with_ymd_and_hms(2024, 11, 15, 10, 30, 0).unwrap()
        );
        assert_eq!(
            next_boundary(t, 15),
            Utc.with_ymd_and_hms(2024, 11, 15, 10, 45, 0).unwrap()
        );
        let on = Utc.with_ymd_and_hms(2024, 11, 15, 23, 45, 0).unwrap();
        assert_eq!(quarter_hour_floor(on), on);
        assert_eq!(
            next_boundary(on, 15),
            Utc.with_ymd_and_hms(2024, 11, 16, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_hourly_floor() {
        let t = Utc.with_ymd_and_hms(2024, 3, 31, 1, 59, 0).unwrap();
        assert_eq!(
            floor_to_step(t, 60),
            Utc.with_ymd_and_hms(2024, 3, 31, 1, 0, 0).unwrap()
        );
    }
}
