//! # Plant Model
//!
//! Discrete-time hydraulic and energy model of the pumping station:
//! - tank mass balance `L[t+1] = L[t] + (F1[t] − ΣQ[t]) · Δt / A`
//! - pump power as a function of flow, plus the extra lift when the tunnel
//!   is drawn below the level the curves were measured at
//! - output-flow smoothness `|ΣQ[t] − ΣQ[t−1]| ≤ MaxDelta`
//! - running-pump capacity over the pumps currently available
//!
//! Everything here is a pure function of its arguments.

pub mod dispatch;

pub use dispatch::*;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::domain::{Pump, PumpError, PumpId, Tank};

/// Numerical slack used for all bound checks on levels and flows
pub const TOLERANCE: f64 = 1e-6;

/// ρ·g / 3.6e6: hydraulic kW per m³/h of flow and metre of head
pub const HYDRAULIC_KW_PER_M3H_M: f64 = 1000.0 * 9.81 / 3.6e6;

#[derive(Debug, Error, PartialEq)]
pub enum PlantError {
    #[error(transparent)]
    Pump(#[from] PumpError),
    #[error("tank area must be positive")]
    InvalidArea,
    #[error("tank bounds must satisfy min < max")]
    InvalidLevelBounds,
    #[error("at most 32 pumps are supported, got {0}")]
    TooManyPumps(usize),
    #[error("duplicate pump id {0}")]
    DuplicatePump(PumpId),
    #[error("step length must be positive")]
    InvalidStep,
    #[error("max flow delta must be positive")]
    InvalidFlowDelta,
    #[error("head model needs a finite reference level and efficiency in (0, 1]")]
    InvalidHead,
}

/// Level-dependent part of the pump power.
///
/// Pump curves hold at `reference_level_m`; every metre the tunnel sits below
/// it adds `ρ·g·Q / η` of lift. Never negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadModel {
    pub reference_level_m: f64,
    /// Combined pump and motor efficiency
    pub efficiency: f64,
}

impl HeadModel {
    pub fn extra_kw(&self, flow_m3h: f64, level_m: f64) -> f64 {
        let lift = (self.reference_level_m - level_m).max(0.0);
        HYDRAULIC_KW_PER_M3H_M * flow_m3h.max(0.0) * lift / self.efficiency
    }
}

/// Set of running pumps as a bit mask over plant pump indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Combo(pub u32);

impl Combo {
    pub const EMPTY: Combo = Combo(0);

    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        Combo(indices.into_iter().fold(0u32, |m, i| m | (1 << i)))
    }

    pub fn contains(self, idx: usize) -> bool {
        self.0 & (1 << idx) != 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_subset_of(self, other: Combo) -> bool {
        self.0 & !other.0 == 0
    }

    /// Pumps whose state differs between the two combinations
    pub fn changes_from(self, other: Combo) -> usize {
        (self.0 ^ other.0).count_ones() as usize
    }

    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..32usize).filter(move |i| self.0 & (1 << i) != 0)
    }
}

impl fmt::Display for Combo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05b}", self.0)
    }
}

/// Hydraulic and energy model of the station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantModel {
    pub tank: Tank,
    pub pumps: Vec<Pump>,
    pub step_minutes: u32,
    /// Largest allowed change of total outflow between consecutive steps (m³/h)
    pub max_flow_delta_m3h: f64,
    /// Largest number of pumps allowed to run at once
    pub max_running: usize,
    #[serde(default)]
    pub head: Option<HeadModel>,
}

impl PlantModel {
    pub fn new(tank: Tank, pumps: Vec<Pump>, step_minutes: u32, max_flow_delta_m3h: f64) -> Self {
        let max_running = pumps.len().min(5);
        Self {
            tank,
            pumps,
            step_minutes,
            max_flow_delta_m3h,
            max_running,
            head: None,
        }
    }

    pub fn with_head(mut self, head: HeadModel) -> Self {
        self.head = Some(head);
        self
    }

    pub fn validate(&self) -> Result<(), PlantError> {
        if !(self.tank.area_m2 > 0.0) {
            return Err(PlantError::InvalidArea);
        }
        if !(self.tank.min_level_m < self.tank.max_level_m) {
            return Err(PlantError::InvalidLevelBounds);
        }
        if self.pumps.len() > 32 {
            return Err(PlantError::TooManyPumps(self.pumps.len()));
        }
        if self.step_minutes == 0 {
            return Err(PlantError::InvalidStep);
        }
        if !(self.max_flow_delta_m3h > 0.0) {
            return Err(PlantError::InvalidFlowDelta);
        }
        if let Some(head) = &self.head {
            if !head.reference_level_m.is_finite()
                || !(head.efficiency > 0.0 && head.efficiency <= 1.0)
            {
                return Err(PlantError::InvalidHead);
            }
        }
        let mut seen = BTreeSet::new();
        for pump in &self.pumps {
            pump.validate()?;
            if !seen.insert(pump.id) {
                return Err(PlantError::DuplicatePump(pump.id));
            }
            if pump.min_flow() > self.max_flow_delta_m3h {
                warn!(
                    pump = %pump.id,
                    min_flow_m3h = pump.min_flow(),
                    max_flow_delta_m3h = self.max_flow_delta_m3h,
                    "pump minimum flow exceeds the smoothness limit; it can only start alongside running pumps"
                );
            }
        }
        Ok(())
    }

    pub fn dt_hours(&self) -> f64 {
        self.step_minutes as f64 / 60.0
    }

    /// Level change per m³/h of net inflow over one step
    pub fn level_gain(&self) -> f64 {
        self.dt_hours() / self.tank.area_m2
    }

    /// Tank balance for one step
    pub fn next_level(&self, level_m: f64, inflow_m3h: f64, outflow_m3h: f64) -> f64 {
        level_m + (inflow_m3h - outflow_m3h) * self.level_gain()
    }

    /// Level at every step boundary, starting with `level_m`
    pub fn simulate(&self, level_m: f64, inflow_m3h: &[f64], outflow_m3h: &[f64]) -> Vec<f64> {
        let mut levels = Vec::with_capacity(inflow_m3h.len() + 1);
        levels.push(level_m);
        let mut level = level_m;
        for (f_in, f_out) in inflow_m3h.iter().zip(outflow_m3h) {
            level = self.next_level(level, *f_in, *f_out);
            levels.push(level);
        }
        levels
    }

    pub fn within_bounds(&self, level_m: f64) -> bool {
        self.tank.contains(level_m, TOLERANCE)
    }

    pub fn is_smooth(&self, previous_m3h: f64, next_m3h: f64) -> bool {
        (next_m3h - previous_m3h).abs() <= self.max_flow_delta_m3h + TOLERANCE
    }

    pub fn pump_index(&self, id: PumpId) -> Option<usize> {
        self.pumps.iter().position(|p| p.id == id)
    }

    pub fn pump_ids(&self, combo: Combo) -> Vec<PumpId> {
        combo.indices().map(|i| self.pumps[i].id).collect()
    }

    pub fn all_pumps(&self) -> Combo {
        Combo::from_indices(0..self.pumps.len())
    }

    /// Mask of pumps that are not offline or under maintenance
    pub fn availability(&self, unavailable: &BTreeSet<PumpId>) -> Combo {
        Combo::from_indices(
            self.pumps
                .iter()
                .enumerate()
                .filter(|(_, p)| !unavailable.contains(&p.id))
                .map(|(i, _)| i),
        )
    }

    /// Maximum number of pumps that may run given the available set
    pub fn running_limit(&self, available: Combo) -> usize {
        self.max_running.min(available.count())
    }

    /// Every admissible combination over the available pumps, ordered by
    /// number of running pumps then mask. Only subsets up to the running
    /// limit are generated.
    pub fn combos(&self, available: Combo) -> Vec<Combo> {
        let limit = self.running_limit(available);
        let pool: Vec<usize> = available.indices().collect();
        let mut out = Vec::new();
        extend_subsets(&pool, limit, Combo::EMPTY, &mut out);
        out.sort_by_key(|c| (c.count(), c.0));
        out
    }

    /// Power of pump `idx` delivering `flow_m3h` with the tunnel at `level_m`
    pub fn pump_power_kw(&self, idx: usize, flow_m3h: f64, level_m: f64) -> f64 {
        let pump = &self.pumps[idx];
        let lift = match &self.head {
            Some(head) if flow_m3h > 0.0 => head.extra_kw(flow_m3h, level_m),
            _ => 0.0,
        };
        pump.power_kw(flow_m3h) + lift
    }

    pub fn dispatch(&self, combo: Combo) -> DispatchCurve {
        DispatchCurve::new(combo, &self.pumps)
    }

    /// Largest total outflow the available pumps can deliver together
    pub fn max_drainage_m3h(&self, available: Combo) -> f64 {
        let mut caps: Vec<f64> = available.indices().map(|i| self.pumps[i].max_flow()).collect();
        caps.sort_by(|a, b| b.total_cmp(a));
        caps.iter().take(self.running_limit(available)).sum()
    }

    /// Lowest kW per m³/h any available pump achieves; lower bound on the
    /// power of any flow allocation.
    pub fn best_specific_energy(&self, available: Combo) -> f64 {
        let best = available
            .indices()
            .map(|i| self.pumps[i].curve.best_specific_energy())
            .fold(f64::INFINITY, f64::min);
        if best.is_finite() {
            best
        } else {
            0.0
        }
    }

    /// Combination running in a pump-state map
    pub fn combo_of(&self, states: &BTreeMap<PumpId, bool>) -> Combo {
        Combo::from_indices(
            states
                .iter()
                .filter(|(_, on)| **on)
                .filter_map(|(id, _)| self.pump_index(*id)),
        )
    }
}

fn extend_subsets(pool: &[usize], room: usize, acc: Combo, out: &mut Vec<Combo>) {
    out.push(acc);
    if room == 0 {
        return;
    }
    for (k, &i) in pool.iter().enumerate() {
        extend_subsets(&pool[k + 1..], room - 1, Combo(acc.0 | (1 << i)), out);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::PowerCurve;

    pub(crate) fn station() -> PlantModel {
        let pumps = (1..=5)
            .map(|id| Pump::new(id, PowerCurve::affine(10.0, 40.0, 2.0, 0.25)))
            .collect();
        PlantModel::new(
            Tank {
                area_m2: 20.0,
                min_level_m: 0.5,
                max_level_m: 8.0,
            },
            pumps,
            15,
            60.0,
        )
    }

    #[test]
    fn test_tank_balance() {
        let plant = station();
        // 40 m³/h net over 0.25 h on 20 m² = 0.5 m
        assert!((plant.next_level(4.0, 60.0, 20.0) - 4.5).abs() < 1e-12);
        let levels = plant.simulate(4.0, &[60.0, 0.0], &[20.0, 40.0]);
        assert_eq!(levels.len(), 3);
        assert!((levels[2] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_head_adds_lift_below_reference() {
        let plant = station().with_head(HeadModel {
            reference_level_m: 8.0,
            efficiency: 0.5,
        });
        let curve_kw = plant.pumps[0].power_kw(40.0);
        assert_eq!(plant.pump_power_kw(0, 40.0, 8.0), curve_kw);
        assert_eq!(plant.pump_power_kw(0, 40.0, 9.0), curve_kw);
        assert_eq!(plant.pump_power_kw(0, 0.0, 2.0), 0.0);
        // 6 m of extra lift at 40 m³/h and η = 0.5
        let expected = curve_kw + HYDRAULIC_KW_PER_M3H_M * 40.0 * 6.0 / 0.5;
        assert!((plant.pump_power_kw(0, 40.0, 2.0) - expected).abs() < 1e-12);
        assert!(plant.validate().is_ok());

        let bad = station().with_head(HeadModel {
            reference_level_m: 8.0,
            efficiency: 0.0,
        });
        assert_eq!(bad.validate(), Err(PlantError::InvalidHead));
    }

    #[test]
    fn test_combos_on_a_large_station_stay_within_the_limit() {
        let pumps = (1..=30)
            .map(|id| Pump::new(id, PowerCurve::affine(10.0, 40.0, 2.0, 0.25)))
            .collect();
        let mut plant = PlantModel::new(
            Tank {
                area_m2: 20.0,
                min_level_m: 0.5,
                max_level_m: 8.0,
            },
            pumps,
            15,
            60.0,
        );
        plant.max_running = 2;
        let combos = plant.combos(plant.all_pumps());
        // empty set, 30 singles, C(30, 2) pairs
        assert_eq!(combos.len(), 1 + 30 + 435);
        assert!(combos.iter().all(|c| c.count() <= 2));
        assert_eq!(combos[0], Combo::EMPTY);
    }

    #[test]
    fn test_combos_respect_availability_and_limit() {
        let mut plant = station();
        let unavailable: BTreeSet<PumpId> = [PumpId(2)].into_iter().collect();
        let available = plant.availability(&unavailable);
        assert_eq!(available.count(), 4);
        assert_eq!(plant.combos(available).len(), 16);
        assert!(plant.combos(available).iter().all(|c| !c.contains(1)));

        plant.max_running = 2;
        let combos = plant.combos(available);
        // C(4,0)+C(4,1)+C(4,2)
        assert_eq!(combos.len(), 11);
        assert!(combos.iter().all(|c| c.count() <= 2));
        assert_eq!(combos[0], Combo::EMPTY);
    }

    #[test]
    fn test_max_drainage_uses_largest_pumps() {
        let mut plant = station();
        plant.pumps[0] = Pump::new(1, PowerCurve::affine(10.0, 100.0, 2.0, 0.25));
        plant.max_running = 2;
        assert!((plant.max_drainage_m3h(plant.all_pumps()) - 140.0).abs() < 1e-9);
    }

    #[test]
    fn test_smoothness() {
        let plant = station();
        assert!(plant.is_smooth(0.0, 60.0));
        assert!(!plant.is_smooth(0.0, 61.0));
        assert!(plant.is_smooth(100.0, 40.0));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut plant = station();
        plant.pumps[1].id = PumpId(1);
        assert_eq!(plant.validate(), Err(PlantError::DuplicatePump(PumpId(1))));
    }
}
