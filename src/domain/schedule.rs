use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::PumpId;

/// Desired pump states for one control step.
///
/// The core issues a complete desired state, never a toggle, so sending the
/// same commands twice is harmless.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PumpCommands {
    pub states: BTreeMap<PumpId, bool>,
    /// Flow setpoints for running pumps (m³/h)
    pub flow_setpoints_m3h: BTreeMap<PumpId, f64>,
}

impl PumpCommands {
    pub fn running_count(&self) -> usize {
        self.states.values().filter(|on| **on).count()
    }

    pub fn total_flow_m3h(&self) -> f64 {
        self.states
            .iter()
            .filter(|(_, on)| **on)
            .map(|(id, _)| self.flow_setpoints_m3h.get(id).copied().unwrap_or(0.0))
            .sum()
    }

    pub fn is_running(&self, id: PumpId) -> bool {
        self.states.get(&id).copied().unwrap_or(false)
    }
}

/// One horizon step of an optimized schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStep {
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    /// Flow per pump; stopped pumps carry 0.0
    pub pump_flows_m3h: BTreeMap<PumpId, f64>,
    pub total_flow_m3h: f64,
    pub inflow_m3h: f64,
    pub price: f64,
    pub power_kw: f64,
    pub cost: f64,
    /// Level at the end of the step
    pub level_end_m: f64,
}

impl ScheduleStep {
    pub fn running(&self) -> impl Iterator<Item = PumpId> + '_ {
        self.pump_flows_m3h
            .iter()
            .filter(|(_, f)| **f > 0.0)
            .map(|(id, _)| *id)
    }

    pub fn commands(&self) -> PumpCommands {
        PumpCommands {
            states: self
                .pump_flows_m3h
                .iter()
                .map(|(id, f)| (*id, *f > 0.0))
                .collect(),
            flow_setpoints_m3h: self
                .pump_flows_m3h
                .iter()
                .filter(|(_, f)| **f > 0.0)
                .map(|(id, f)| (*id, *f))
                .collect(),
        }
    }
}

/// Search statistics attached to every schedule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverStats {
    pub nodes_expanded: u64,
    pub leaves_evaluated: u64,
    pub pruned_by_bound: u64,
    pub pruned_infeasible: u64,
    pub elapsed_ms: u64,
}

/// Full-horizon plan produced by one solve. Only the first step is ever
/// committed; the rest is discarded at the next re-solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub horizon_start: DateTime<Utc>,
    pub step_minutes: u32,
    pub initial_level_m: f64,
    pub steps: Vec<ScheduleStep>,
    pub energy_cost: f64,
    /// Pump state changes along the plan, counted from the committed state
    pub switches: u32,
    /// `false` when the search stopped on its deadline or node budget
    pub optimal: bool,
    /// Built from a cached forecast because no fresh one was available
    pub stale_forecast: bool,
    pub stats: SolverStats,
    pub optimizer_version: String,
}

impl Schedule {
    pub fn first_step(&self) -> Option<&ScheduleStep> {
        self.steps.first()
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.steps
            .last()
            .map(|s| s.time_end)
            .unwrap_or(self.horizon_start)
    }

    /// Level at every step boundary, starting with the initial level
    pub fn level_trajectory(&self) -> Vec<f64> {
        std::iter::once(self.initial_level_m)
            .chain(self.steps.iter().map(|s| s.level_end_m))
            .collect()
    }

    pub fn step_at(&self, t: DateTime<Utc>) -> Option<&ScheduleStep> {
        self.steps.iter().find(|s| t >= s.time_start && t < s.time_end)
    }

    pub fn step_duration(&self) -> Duration {
        Duration::minutes(self.step_minutes as i64)
    }
}
