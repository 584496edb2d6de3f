//! MPC Loop
//!
//! One receding-horizon cycle per tick: measure, take a forecast snapshot,
//! build and solve the horizon problem, re-validate step 0 against a fresh
//! measurement and commit it. Everything carried between cycles lives in the
//! owned, versioned [`ControllerState`].

pub mod fallback;
pub mod scheduler;
pub mod state_store;
pub mod validator;

pub use fallback::*;
pub use scheduler::*;
pub use state_store::*;
pub use validator::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{ForecastSnapshot, PumpCommands, PumpId, PumpStatus, Schedule};
use crate::forecast::{ForecastAdapter, ForecastError};
use crate::hardware::{read_measurement, Actuator, Measurement, SensorError, Sensors};
use crate::optimizer::{PlanError, ProblemBuilder, ProblemInput, ScheduleOptimizer};
use crate::plant::PlantModel;

/// Bumped whenever [`ControllerState`] changes shape
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    #[default]
    Idle,
    Building,
    Solving,
    Validating,
    Committed,
}

/// Cross-cycle controller state, passed into each cycle and returned updated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub version: u32,
    pub cycle: u64,
    pub phase: ControllerPhase,
    /// Horizon start of the last cycle that got a measurement
    pub last_horizon_start: Option<DateTime<Utc>>,
    pub pump_status: BTreeMap<PumpId, PumpStatus>,
    /// Last commands the actuator accepted
    pub last_commands: Option<PumpCommands>,
    pub last_schedule: Option<Schedule>,
    /// Last fresh forecast snapshot, reused when the adapter has nothing recent
    pub cached_forecast: Option<ForecastSnapshot>,
    pub consecutive_fallbacks: u32,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            cycle: 0,
            phase: ControllerPhase::Idle,
            last_horizon_start: None,
            pump_status: BTreeMap::new(),
            last_commands: None,
            last_schedule: None,
            cached_forecast: None,
            consecutive_fallbacks: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub horizon_steps: usize,
    /// Upper bound on one solve, including the blocking-pool hand-off
    pub solve_timeout: Duration,
    /// Decisions ready later than this after the tick are discarded
    pub grace: Duration,
    /// Oldest cached snapshot that may stand in for a missing forecast
    pub forecast_cache_max_age: ChronoDuration,
    pub fallback: FallbackPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            horizon_steps: 96,
            solve_timeout: Duration::from_secs(90),
            grace: Duration::from_secs(300),
            forecast_cache_max_age: ChronoDuration::hours(24),
            fallback: FallbackPolicy::default(),
        }
    }
}

/// Why a cycle could not commit an optimized decision
#[derive(Debug, Error)]
pub enum DegradationCause {
    #[error(transparent)]
    Forecast(#[from] ForecastError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Rejected(#[from] ValidatorRejection),
}

#[derive(Debug)]
pub enum CycleOutcome {
    Committed { schedule_id: Uuid, optimal: bool },
    Fallback {
        cause: DegradationCause,
        decision: FallbackDecision,
    },
    /// No fresh measurement: previous commands stay in force, nothing sent
    SensorHold(SensorError),
    /// Decision ready after the grace period; previous commands stay in force
    Discarded { late_ms: u64 },
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Committed {
                schedule_id,
                optimal,
            } => write!(f, "committed schedule {schedule_id} (optimal: {optimal})"),
            CycleOutcome::Fallback { cause, decision } => {
                write!(f, "fallback {} after: {cause}", decision.action)
            }
            CycleOutcome::SensorHold(e) => write!(f, "holding previous commands: {e}"),
            CycleOutcome::Discarded { late_ms } => {
                write!(f, "decision discarded, {late_ms} ms past the grace period")
            }
        }
    }
}

#[derive(Debug)]
pub struct CycleReport {
    pub cycle: u64,
    pub horizon_start: DateTime<Utc>,
    /// Phases entered, in order
    pub phases: Vec<ControllerPhase>,
    pub outcome: CycleOutcome,
    /// Commands in force after the cycle
    pub commands: Option<PumpCommands>,
    /// Whether commands were delivered to the actuator this cycle
    pub actuated: bool,
    pub stale_forecast: bool,
    pub schedule: Option<Schedule>,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Committed { .. })
    }
}

/// Per-cycle bookkeeping that ends up in the report
struct Trace {
    cycle: u64,
    horizon_start: DateTime<Utc>,
    started: Instant,
    phases: Vec<ControllerPhase>,
    stale_forecast: bool,
    schedule: Option<Schedule>,
}

pub struct MpcController {
    builder: ProblemBuilder,
    optimizer: Arc<dyn ScheduleOptimizer>,
    forecasts: Arc<ForecastAdapter>,
    sensors: Arc<dyn Sensors>,
    actuator: Arc<dyn Actuator>,
    validator: ScheduleValidator,
    settings: ControllerSettings,
}

impl MpcController {
    pub fn new(
        builder: ProblemBuilder,
        optimizer: Arc<dyn ScheduleOptimizer>,
        forecasts: Arc<ForecastAdapter>,
        sensors: Arc<dyn Sensors>,
        actuator: Arc<dyn Actuator>,
        settings: ControllerSettings,
    ) -> Self {
        let validator = ScheduleValidator::new(Arc::clone(builder.plant()));
        Self {
            builder,
            optimizer,
            forecasts,
            sensors,
            actuator,
            validator,
            settings,
        }
    }

    pub fn plant(&self) -> &Arc<PlantModel> {
        self.builder.plant()
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Run one receding-horizon cycle for the step containing `tick`
    pub async fn run_cycle(
        &self,
        mut state: ControllerState,
        tick: DateTime<Utc>,
    ) -> (ControllerState, CycleReport) {
        let step_minutes = self.plant().step_minutes;
        state.cycle += 1;
        let mut trace = Trace {
            cycle: state.cycle,
            horizon_start: floor_to_step(tick, step_minutes),
            started: Instant::now(),
            phases: Vec::new(),
            stale_forecast: false,
            schedule: None,
        };
        let horizon_start = trace.horizon_start;

        enter(&mut state, &mut trace, ControllerPhase::Building);
        let measurement = match read_measurement(self.sensors.as_ref(), tick).await {
            Ok(m) => m,
            Err(e) => return self.sensor_hold(state, trace, e),
        };
        state.pump_status = self.advance_status(&state, &measurement, horizon_start);
        state.last_horizon_start = Some(horizon_start);
        let reference = self.reference_outflow(&measurement, state.last_commands.as_ref());

        let snapshot = match self.forecast(&mut state, horizon_start) {
            Ok(s) => s,
            Err(e) => {
                return self
                    .fallback(state, trace, &measurement, None, e.into())
                    .await
            }
        };
        trace.stale_forecast = snapshot.stale;
        let inflow_now = snapshot.inflow_m3h.first().copied();

        let input = ProblemInput {
            horizon_start,
            initial_level_m: measurement.level_m,
            prices: snapshot.prices,
            inflow_m3h: snapshot.inflow_m3h,
            unavailable: measurement.unavailable.clone(),
            reference_outflow_m3h: reference,
            pump_status: state.pump_status.clone(),
            stale_forecast: snapshot.stale,
        };
        let problem = match self.builder.build(input) {
            Ok(p) => p,
            Err(e) => {
                return self
                    .fallback(state, trace, &measurement, inflow_now, e.into())
                    .await
            }
        };

        enter(&mut state, &mut trace, ControllerPhase::Solving);
        let solved =
            match tokio::time::timeout(self.settings.solve_timeout, self.optimizer.optimize(problem))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PlanError::SolverTimeout {
                    elapsed_ms: trace.started.elapsed().as_millis() as u64,
                    nodes: 0,
                }),
            };
        let schedule = match solved {
            Ok(s) => s,
            Err(e) => {
                return self
                    .fallback(state, trace, &measurement, inflow_now, e.into())
                    .await
            }
        };
        if !schedule.optimal {
            warn!(
                cycle = trace.cycle,
                nodes = schedule.stats.nodes_expanded,
                elapsed_ms = schedule.stats.elapsed_ms,
                "search limit reached, using best incumbent"
            );
        }
        trace.schedule = Some(schedule.clone());

        enter(&mut state, &mut trace, ControllerPhase::Validating);
        let fresh = match read_measurement(self.sensors.as_ref(), Utc::now()).await {
            Ok(m) => m,
            Err(e) => return self.sensor_hold(state, trace, e),
        };
        let ctx = ValidationContext {
            measurement: &fresh,
            inflow_m3h: inflow_now.unwrap_or(0.0),
            reference_outflow_m3h: reference,
            pump_status: &state.pump_status,
        };
        let commands = match self.validator.validate(&schedule, &ctx) {
            Ok(c) => c,
            Err(rejection) => {
                return self
                    .fallback(state, trace, &fresh, inflow_now, rejection.into())
                    .await
            }
        };

        let elapsed = trace.started.elapsed();
        if elapsed > self.settings.grace {
            let late_ms = (elapsed - self.settings.grace).as_millis() as u64;
            warn!(
                event = "control_degradation",
                cycle = trace.cycle,
                late_ms,
                "decision ready after the grace period, holding previous commands"
            );
            let held = state.last_commands.clone();
            return finish(state, trace, CycleOutcome::Discarded { late_ms }, held, false);
        }

        let actuated = self.actuate(&commands).await;
        if actuated {
            state.last_commands = Some(commands.clone());
        }
        enter(&mut state, &mut trace, ControllerPhase::Committed);
        info!(
            cycle = trace.cycle,
            horizon_start = %horizon_start,
            level_m = fresh.level_m,
            running = commands.running_count(),
            outflow_m3h = commands.total_flow_m3h(),
            horizon_cost = schedule.energy_cost,
            optimal = schedule.optimal,
            stale_forecast = schedule.stale_forecast,
            actuated,
            "step 0 committed"
        );
        let outcome = CycleOutcome::Committed {
            schedule_id: schedule.id,
            optimal: schedule.optimal,
        };
        state.last_schedule = Some(schedule);
        state.consecutive_fallbacks = 0;
        finish(state, trace, outcome, Some(commands), actuated)
    }

    /// Fresh snapshot from the adapter, else the cached one shifted and
    /// flagged stale
    fn forecast(
        &self,
        state: &mut ControllerState,
        horizon_start: DateTime<Utc>,
    ) -> Result<ForecastSnapshot, ForecastError> {
        let n = self.settings.horizon_steps;
        let step_minutes = self.plant().step_minutes;
        match self.forecasts.snapshot(horizon_start, n, step_minutes) {
            Ok(snapshot) => {
                state.cached_forecast = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                let cached = state
                    .cached_forecast
                    .as_ref()
                    .filter(|c| horizon_start - c.horizon_start <= self.settings.forecast_cache_max_age)
                    .and_then(|c| c.shifted(horizon_start, n));
                match cached {
                    Some(mut snapshot) => {
                        snapshot.stale = true;
                        warn!(
                            event = "forecast_stale",
                            error = %e,
                            issued_at = %snapshot.issued_at,
                            extrapolated_steps = snapshot.extrapolated_steps,
                            "using cached forecast"
                        );
                        Ok(snapshot)
                    }
                    None => {
                        error!(event = "forecast_missing", error = %e, "no forecast to plan with");
                        Err(e)
                    }
                }
            }
        }
    }

    /// Pump status at `horizon_start` from the measured states
    fn advance_status(
        &self,
        state: &ControllerState,
        measurement: &Measurement,
        horizon_start: DateTime<Utc>,
    ) -> BTreeMap<PumpId, PumpStatus> {
        let step = self.plant().step_minutes.max(1) as i64;
        let elapsed = state
            .last_horizon_start
            .map(|last| ((horizon_start - last).num_minutes() / step).max(0) as u32)
            .unwrap_or(0);
        self.plant()
            .pumps
            .iter()
            .map(|p| {
                let on = measurement.pump_states.get(&p.id).copied().unwrap_or(false);
                let status = match state.pump_status.get(&p.id) {
                    Some(prev) if prev.running == on => PumpStatus {
                        running: on,
                        steps_in_state: prev.steps_in_state.saturating_add(elapsed),
                    },
                    Some(_) => PumpStatus {
                        running: on,
                        steps_in_state: elapsed.max(1),
                    },
                    // no history: treat as settled
                    None => PumpStatus {
                        running: on,
                        steps_in_state: u32::MAX,
                    },
                };
                (p.id, status)
            })
            .collect()
    }

    /// Outflow the step-0 smoothness constraint is measured against
    fn reference_outflow(
        &self,
        measurement: &Measurement,
        last: Option<&PumpCommands>,
    ) -> Option<f64> {
        if let Some(q) = measurement.outflow_m3h {
            return Some(q);
        }
        if measurement.running().next().is_none() {
            return Some(0.0);
        }
        match last {
            Some(cmd)
                if self.plant().pumps.iter().all(|p| {
                    cmd.is_running(p.id)
                        == measurement.pump_states.get(&p.id).copied().unwrap_or(false)
                }) =>
            {
                Some(cmd.total_flow_m3h())
            }
            _ => {
                warn!(
                    event = "reference_unknown",
                    "measured pump states differ from the last command, step 0 outflow unconstrained"
                );
                None
            }
        }
    }

    async fn actuate(&self, commands: &PumpCommands) -> bool {
        match self.actuator.set_pump_commands(commands).await {
            Ok(()) => true,
            Err(e) => {
                error!(event = "actuation_failed", error = %e, "pump commands not delivered");
                false
            }
        }
    }

    fn sensor_hold(
        &self,
        state: ControllerState,
        trace: Trace,
        error: SensorError,
    ) -> (ControllerState, CycleReport) {
        warn!(
            event = "control_degradation",
            cycle = trace.cycle,
            error = %error,
            "no fresh measurement, holding previous commands"
        );
        let held = state.last_commands.clone();
        finish(state, trace, CycleOutcome::SensorHold(error), held, false)
    }

    async fn fallback(
        &self,
        mut state: ControllerState,
        trace: Trace,
        measurement: &Measurement,
        inflow_m3h: Option<f64>,
        cause: DegradationCause,
    ) -> (ControllerState, CycleReport) {
        warn!(
            event = "control_degradation",
            cycle = trace.cycle,
            cause = %cause,
            "no optimized decision for this step"
        );
        let previous = state
            .last_commands
            .clone()
            .unwrap_or_else(|| self.measured_commands(measurement));
        let decision = self.settings.fallback.decide(
            self.plant(),
            measurement.level_m,
            inflow_m3h,
            &previous,
            &measurement.unavailable,
        );
        let actuated = self.actuate(&decision.commands).await;
        if actuated {
            state.last_commands = Some(decision.commands.clone());
        }
        state.consecutive_fallbacks += 1;
        let commands = Some(decision.commands.clone());
        finish(
            state,
            trace,
            CycleOutcome::Fallback { cause, decision },
            commands,
            actuated,
        )
    }

    /// Commands matching the measured pump states when none were sent yet;
    /// the measured outflow is split evenly, else pumps count at capacity
    fn measured_commands(&self, measurement: &Measurement) -> PumpCommands {
        let plant = self.plant();
        let running: Vec<PumpId> = measurement.running().collect();
        let share = measurement
            .outflow_m3h
            .filter(|_| !running.is_empty())
            .map(|q| q / running.len() as f64);
        PumpCommands {
            states: plant
                .pumps
                .iter()
                .map(|p| (p.id, running.contains(&p.id)))
                .collect(),
            flow_setpoints_m3h: plant
                .pumps
                .iter()
                .filter(|p| running.contains(&p.id))
                .map(|p| (p.id, share.unwrap_or(p.max_flow())))
                .collect(),
        }
    }
}

fn enter(state: &mut ControllerState, trace: &mut Trace, phase: ControllerPhase) {
    debug!(cycle = trace.cycle, from = %state.phase, to = %phase, "phase");
    state.phase = phase;
    trace.phases.push(phase);
}

fn finish(
    mut state: ControllerState,
    trace: Trace,
    outcome: CycleOutcome,
    commands: Option<PumpCommands>,
    actuated: bool,
) -> (ControllerState, CycleReport) {
    state.phase = ControllerPhase::Idle;
    let report = CycleReport {
        cycle: trace.cycle,
        horizon_start: trace.horizon_start,
        phases: trace.phases,
        outcome,
        commands,
        actuated,
        stale_forecast: trace.stale_forecast,
        schedule: trace.schedule,
        elapsed: trace.started.elapsed(),
    };
    debug!(
        cycle = report.cycle,
        outcome = %report.outcome,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "cycle finished"
    );
    (state, report)
}
