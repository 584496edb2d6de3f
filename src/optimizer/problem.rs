//! Problem Builder
//!
//! Assembles one MPC instance per control cycle from the measured state, the
//! forecast slices and the plant model, and rejects horizons that no pump
//! trajectory can keep within the level bounds.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::bounds::{Relaxation, Violation};
use crate::domain::{PumpId, PumpStatus};
use crate::plant::{Combo, PlantError, PlantModel};

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("invalid problem input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Plant(#[from] PlantError),

    #[error(
        "infeasible horizon: level reaches {projected_level_m:.3} m at step {step}, bound is {bound:.3} m"
    )]
    InfeasibleHorizon {
        step: usize,
        projected_level_m: f64,
        bound: f64,
    },

    #[error("infeasible horizon: outflow cannot follow the smoothness limit at step {step}")]
    SmoothnessInfeasible { step: usize },

    #[error("solver stopped after {elapsed_ms} ms and {nodes} nodes without a feasible schedule")]
    SolverTimeout { elapsed_ms: u64, nodes: u64 },

    #[error("solver worker failed: {0}")]
    Worker(String),
}

impl PlanError {
    pub fn is_infeasible(&self) -> bool {
        matches!(
            self,
            PlanError::InfeasibleHorizon { .. } | PlanError::SmoothnessInfeasible { .. }
        )
    }
}

impl From<Violation> for PlanError {
    fn from(v: Violation) -> Self {
        match v {
            Violation::Level {
                step,
                projected_level_m,
                bound,
            } => PlanError::InfeasibleHorizon {
                step,
                projected_level_m,
                bound,
            },
            Violation::Flow { step } => PlanError::SmoothnessInfeasible { step },
        }
    }
}

/// Per-cycle inputs to the builder
#[derive(Debug, Clone)]
pub struct ProblemInput {
    pub horizon_start: DateTime<Utc>,
    /// Measured tank level (m)
    pub initial_level_m: f64,
    /// currency/kWh per step
    pub prices: Vec<f64>,
    /// m³/h per step
    pub inflow_m3h: Vec<f64>,
    /// Pumps offline or under maintenance
    pub unavailable: BTreeSet<PumpId>,
    /// Total outflow of the previous step; `None` leaves step 0 unconstrained
    pub reference_outflow_m3h: Option<f64>,
    /// Current state of each pump; missing pumps count as long stopped
    pub pump_status: BTreeMap<PumpId, PumpStatus>,
    pub stale_forecast: bool,
}

/// One fully specified MPC instance
#[derive(Debug, Clone)]
pub struct MpcProblem {
    pub plant: Arc<PlantModel>,
    pub horizon_start: DateTime<Utc>,
    pub initial_level_m: f64,
    pub prices: Vec<f64>,
    pub inflow_m3h: Vec<f64>,
    pub available: Combo,
    /// Pumps running when the horizon starts
    pub initial_combo: Combo,
    /// Indexed like `plant.pumps`
    pub initial_status: Vec<PumpStatus>,
    pub reference_outflow_m3h: Option<f64>,
    pub terminal_level_max_m: Option<f64>,
    /// Cost per pump state change
    pub switch_penalty: f64,
    pub stale_forecast: bool,
}

impl MpcProblem {
    pub fn horizon(&self) -> usize {
        self.prices.len()
    }

    pub fn dt_hours(&self) -> f64 {
        self.plant.dt_hours()
    }

    /// Level gain per m³/h over one step
    pub fn k(&self) -> f64 {
        self.plant.level_gain()
    }

    /// Ceiling on the level after step `t`
    pub fn level_ceiling(&self, t: usize) -> f64 {
        let max = self.plant.tank.max_level_m;
        match self.terminal_level_max_m {
            Some(term) if t + 1 == self.horizon() => term.min(max),
            _ => max,
        }
    }
}

pub struct ProblemBuilder {
    plant: Arc<PlantModel>,
    switch_penalty: f64,
    terminal_level_max_m: Option<f64>,
}

impl ProblemBuilder {
    pub fn new(plant: Arc<PlantModel>) -> Self {
        Self {
            plant,
            switch_penalty: 0.0,
            terminal_level_max_m: None,
        }
    }

    pub fn with_switch_penalty(mut self, penalty: f64) -> Self {
        self.switch_penalty = penalty;
        self
    }

    pub fn with_terminal_level_max(mut self, level_m: Option<f64>) -> Self {
        self.terminal_level_max_m = level_m;
        self
    }

    pub fn plant(&self) -> &Arc<PlantModel> {
        &self.plant
    }

    pub fn build(&self, input: ProblemInput) -> Result<MpcProblem, PlanError> {
        self.plant.validate()?;
        self.check_input(&input)?;

        let available = self.plant.availability(&input.unavailable);
        let initial_status: Vec<PumpStatus> = self
            .plant
            .pumps
            .iter()
            .map(|p| input.pump_status.get(&p.id).copied().unwrap_or_default())
            .collect();
        let initial_combo = Combo::from_indices(
            initial_status
                .iter()
                .enumerate()
                .filter(|(_, s)| s.running)
                .map(|(i, _)| i),
        );

        let problem = MpcProblem {
            plant: Arc::clone(&self.plant),
            horizon_start: input.horizon_start,
            initial_level_m: input.initial_level_m,
            prices: input.prices,
            inflow_m3h: input.inflow_m3h,
            available,
            initial_combo,
            initial_status,
            reference_outflow_m3h: input.reference_outflow_m3h,
            terminal_level_max_m: self.terminal_level_max_m,
            switch_penalty: self.switch_penalty,
            stale_forecast: input.stale_forecast,
        };

        // Maximal-drainage propagation: a relaxation, so a violation is a proof
        if let Err(violation) = Relaxation::new(&problem).propagate(&[]) {
            let err = PlanError::from(violation);
            warn!(error = %err, "horizon rejected before search");
            return Err(err);
        }

        debug!(
            steps = problem.horizon(),
            available = %problem.available,
            initial_combo = %problem.initial_combo,
            level_m = problem.initial_level_m,
            "problem built"
        );
        Ok(problem)
    }

    fn check_input(&self, input: &ProblemInput) -> Result<(), PlanError> {
        let n = input.prices.len();
        if n == 0 {
            return Err(PlanError::InvalidInput("empty horizon".into()));
        }
        if input.inflow_m3h.len() != n {
            return Err(PlanError::InvalidInput(format!(
                "price and inflow horizons differ ({n} vs {})",
                input.inflow_m3h.len()
            )));
        }
        if input.prices.iter().any(|p| !p.is_finite()) {
            return Err(PlanError::InvalidInput("non-finite price".into()));
        }
        if input.inflow_m3h.iter().any(|f| !f.is_finite() || *f < 0.0) {
            return Err(PlanError::InvalidInput(
                "inflow must be finite and non-negative".into(),
            ));
        }
        if !input.initial_level_m.is_finite() {
            return Err(PlanError::InvalidInput("non-finite tank level".into()));
        }
        if let Some(q) = input.reference_outflow_m3h {
            if !q.is_finite() || q < 0.0 {
                return Err(PlanError::InvalidInput(format!(
                    "invalid reference outflow {q}"
                )));
            }
        }
        if let Some(term) = self.terminal_level_max_m {
            let tank = &self.plant.tank;
            if !(term >= tank.min_level_m && term <= tank.max_level_m) {
                return Err(PlanError::InvalidInput(format!(
                    "terminal level {term} m outside tank bounds"
                )));
            }
        }
        if !(self.switch_penalty >= 0.0) {
            return Err(PlanError::InvalidInput("switch penalty must be >= 0".into()));
        }
        Ok(())
    }
}
