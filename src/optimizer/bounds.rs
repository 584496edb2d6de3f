//! Relaxations used to prune the combinatorial search.
//!
//! Both work on a partially fixed trajectory: steps `0..fixed.len()` run a
//! known pump combination, later steps are free.
//!
//! - Bound propagation carries a reachable total-flow interval (ramp
//!   relaxation) and a reachable level interval through the horizon.
//! - The cost bound prices the fixed prefix at its cheapest dispatch and the
//!   drainage still required by the level ceilings at the best specific energy
//!   of any available pump. The covering problem has nested prefix
//!   constraints, so filling each deadline from the cheapest earlier slot is
//!   exact.

use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use super::MpcProblem;
use crate::plant::{Combo, DispatchCurve, TOLERANCE};

const FLOW_TOLERANCE: f64 = 1e-6;

/// Why a (partial) trajectory cannot be completed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Violation {
    Level {
        step: usize,
        projected_level_m: f64,
        bound: f64,
    },
    Flow {
        step: usize,
    },
}

/// Reachable total outflow at one step (m³/h)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowInterval {
    pub lo: f64,
    pub hi: f64,
}

pub struct Relaxation<'a> {
    problem: &'a MpcProblem,
    curves: BTreeMap<Combo, DispatchCurve>,
    drain_max_m3h: f64,
    best_specific_energy: f64,
    peak_power_kw: f64,
    /// Cumulative outflow (sum of m³/h over steps) needed through each step
    requirements: Vec<f64>,
}

impl<'a> Relaxation<'a> {
    pub fn new(problem: &'a MpcProblem) -> Self {
        let plant = &problem.plant;
        let curves = plant
            .combos(problem.available)
            .into_iter()
            .map(|c| (c, plant.dispatch(c)))
            .collect();

        let mut peaks: Vec<f64> = problem
            .available
            .indices()
            .map(|i| plant.pumps[i].curve.power_kw(plant.pumps[i].max_flow()))
            .collect();
        peaks.sort_by(|a, b| b.total_cmp(a));
        let peak_power_kw = peaks
            .iter()
            .take(plant.running_limit(problem.available))
            .sum();

        let k = problem.k();
        let mut inflow_sum = 0.0;
        let requirements = problem
            .inflow_m3h
            .iter()
            .enumerate()
            .map(|(t, f)| {
                inflow_sum += f;
                inflow_sum + (problem.initial_level_m - problem.level_ceiling(t)) / k
            })
            .collect();

        Self {
            problem,
            curves,
            drain_max_m3h: plant.max_drainage_m3h(problem.available),
            best_specific_energy: plant.best_specific_energy(problem.available),
            peak_power_kw,
            requirements,
        }
    }

    pub fn curve(&self, combo: Combo) -> Option<&DispatchCurve> {
        self.curves.get(&combo)
    }

    /// Every admissible combination, ordered by pump count then mask
    pub fn combos(&self) -> impl Iterator<Item = Combo> + '_ {
        let mut combos: Vec<Combo> = self.curves.keys().copied().collect();
        combos.sort_by_key(|c| (c.count(), c.0));
        combos.into_iter()
    }

    /// Reachable flow interval per step, or the first step no completion of
    /// `fixed` can keep within bounds.
    pub fn propagate(&self, fixed: &[Combo]) -> Result<Vec<FlowInterval>, Violation> {
        let p = self.problem;
        let tank = &p.plant.tank;
        let k = p.k();
        let delta = p.plant.max_flow_delta_m3h;

        let (mut a, mut b) = match p.reference_outflow_m3h {
            Some(q) => (q, q),
            None => (0.0, f64::INFINITY),
        };
        let (mut level_lo, mut level_hi) = (p.initial_level_m, p.initial_level_m);
        let mut out = Vec::with_capacity(p.horizon());

        for t in 0..p.horizon() {
            let (cap_lo, cap_hi) = match fixed.get(t) {
                Some(combo) => match self.curve(*combo) {
                    Some(c) => (c.min_flow_m3h, c.max_flow_m3h),
                    None => return Err(Violation::Flow { step: t }),
                },
                None => (0.0, self.drain_max_m3h),
            };
            let lo = (a - delta).max(cap_lo);
            let hi = (b + delta).min(cap_hi);
            if lo > hi + FLOW_TOLERANCE {
                return Err(Violation::Flow { step: t });
            }
            let hi = hi.max(lo);

            let inflow = p.inflow_m3h[t];
            let ceiling = p.level_ceiling(t);
            let lowest = level_lo + k * (inflow - hi);
            let highest = level_hi + k * (inflow - lo);
            if lowest > ceiling + TOLERANCE {
                return Err(Violation::Level {
                    step: t + 1,
                    projected_level_m: lowest,
                    bound: ceiling,
                });
            }
            if highest < tank.min_level_m - TOLERANCE {
                return Err(Violation::Level {
                    step: t + 1,
                    projected_level_m: highest,
                    bound: tank.min_level_m,
                });
            }
            level_lo = lowest.max(tank.min_level_m);
            level_hi = highest.min(ceiling);
            a = lo;
            b = hi;
            out.push(FlowInterval { lo, hi });
        }
        Ok(out)
    }

    /// Lower bound on the energy cost of any completion of `fixed`, or `None`
    /// when the required drainage cannot be covered.
    pub fn lower_bound(&self, fixed: &[Combo], flows: &[FlowInterval]) -> Option<f64> {
        let p = self.problem;
        let dt = p.dt_hours();
        let n = flows.len();

        let mut capacity = vec![0.0; n];
        let mut slots: BinaryHeap<Reverse<(OrderedFloat<f64>, usize)>> = BinaryHeap::new();
        let mut covered = 0.0;
        let mut cost = 0.0;

        for s in 0..n {
            let FlowInterval { lo, hi } = flows[s];
            let price = p.prices[s] * dt;
            let (constant, unit) = match fixed.get(s).and_then(|c| self.curve(*c)) {
                Some(curve) if price >= 0.0 => (price * curve.power_kw(lo), price * curve.min_slope),
                Some(curve) => (price * curve.power_kw(curve.max_flow_m3h), 0.0),
                None if price >= 0.0 => (
                    price * self.best_specific_energy * lo,
                    price * self.best_specific_energy,
                ),
                None => (price * self.peak_power_kw, 0.0),
            };
            cost += constant;
            covered += lo;
            capacity[s] = hi - lo;
            if capacity[s] > FLOW_TOLERANCE {
                slots.push(Reverse((OrderedFloat(unit), s)));
            }

            let required = self.requirements[s];
            let mut need = required - covered;
            let tol = FLOW_TOLERANCE * required.abs().max(1.0);
            while need > tol {
                let Reverse((unit, t)) = *slots.peek()?;
                let take = need.min(capacity[t]);
                cost += take * unit.0;
                capacity[t] -= take;
                covered += take;
                need -= take;
                if capacity[t] <= FLOW_TOLERANCE {
                    slots.pop();
                }
            }
        }
        Some(cost)
    }

    /// Propagation followed by the cost bound
    pub fn evaluate(&self, fixed: &[Combo]) -> Option<f64> {
        let flows = self.propagate(fixed).ok()?;
        self.lower_bound(fixed, &flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::problem::tests::{input, small_plant};
    use crate::optimizer::ProblemBuilder;

    #[test]
    fn test_free_horizon_respects_ramp_from_reference() {
        let mut plant = (*small_plant()).clone();
        plant.max_flow_delta_m3h = 25.0;
        let builder = ProblemBuilder::new(std::sync::Arc::new(plant));
        let mut inp = input(4.0, vec![0.1; 4], vec![0.0; 4]);
        inp.reference_outflow_m3h = Some(0.0);
        let problem = builder.build(inp).unwrap();
        let flows = Relaxation::new(&problem).propagate(&[]).unwrap();
        assert_eq!(flows[0], FlowInterval { lo: 0.0, hi: 25.0 });
        assert_eq!(flows[1], FlowInterval { lo: 0.0, hi: 50.0 });
        // capped by the two pumps' 80 m³/h
        assert_eq!(flows[3], FlowInterval { lo: 0.0, hi: 80.0 });
    }

    #[test]
    fn test_fixed_combo_range_feeds_propagation() {
        let builder = ProblemBuilder::new(small_plant());
        let problem = builder.build(input(4.0, vec![0.1; 2], vec![20.0; 2])).unwrap();
        let relax = Relaxation::new(&problem);
        let both = Combo::from_indices([0, 1]);
        let flows = relax.propagate(&[both]).unwrap();
        assert_eq!(flows[0], FlowInterval { lo: 20.0, hi: 80.0 });
    }

    #[test]
    fn test_empty_prefix_fails_when_level_must_drop() {
        // Level 7.9, 40 m³/h in: idling one step lifts 10 m² by 1 m
        let builder = ProblemBuilder::new(small_plant());
        let problem = builder.build(input(7.9, vec![0.1; 3], vec![40.0; 3])).unwrap();
        let relax = Relaxation::new(&problem);
        assert!(matches!(
            relax.propagate(&[Combo::EMPTY]),
            Err(Violation::Level { step: 1, .. })
        ));
        assert!(relax.propagate(&[Combo::from_indices([0])]).is_ok());
    }

    #[test]
    fn test_bound_prices_required_drainage_in_cheapest_slot() {
        // Level at 8.0 with 40 m³/h inflow: each step needs 40 m³/h out by
        // its deadline; the cheapest earlier slot is step 0.
        let builder = ProblemBuilder::new(small_plant());
        let problem = builder
            .build(input(8.0, vec![0.1, 0.3], vec![40.0, 40.0]))
            .unwrap();
        let relax = Relaxation::new(&problem);
        let lb = relax.evaluate(&[]).unwrap();
        // e_min = 12/40 = 0.3 kW per m³/h; 80 m³/h·step needed, step 0
        // offers at most 80, priced 0.1 · 0.25 h
        let expected = 80.0 * 0.3 * 0.1 * 0.25;
        assert!((lb - expected).abs() < 1e-9, "lb = {lb}");
    }

    #[test]
    fn test_bound_never_exceeds_fixed_trajectory_cost() {
        let builder = ProblemBuilder::new(small_plant());
        let problem = builder
            .build(input(6.0, vec![0.2, 0.1], vec![30.0, 30.0]))
            .unwrap();
        let relax = Relaxation::new(&problem);
        let one = Combo::from_indices([0]);
        let lb = relax.evaluate(&[one, one]).unwrap();
        // Running pump 1 at 30 m³/h in both steps holds the level
        let actual = (0.2 + 0.1) * 0.25 * (2.0 + 0.25 * 30.0);
        assert!(lb <= actual + 1e-9);
    }
}
