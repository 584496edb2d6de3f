//! Continuous flow sub-problem for a fixed pump-combination trajectory.
//!
//! With the combination of every step fixed, the remaining problem is an LP:
//! each running pump starts at its minimum flow and extra flow is drawn from
//! linear curve segments with convex (nondecreasing) marginal power. Storage is
//! modelled as volume above the minimum level so all coefficients stay close
//! to one.

use good_lp::solvers::microlp::microlp;
use good_lp::{
    constraint, variable, variables, Constraint, Expression, ResolutionError, Solution,
    SolverModel, Variable,
};
use thiserror::Error;

use super::bounds::Relaxation;
use super::MpcProblem;
use crate::plant::{Combo, TOLERANCE};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("no dispatch curve for combination {0}")]
    UnknownCombo(Combo),
    #[error("flow sub-problem failed: {0}")]
    Solver(String),
}

/// Optimal flows for one combination trajectory
#[derive(Debug, Clone, PartialEq)]
pub struct FlowPlan {
    pub totals_m3h: Vec<f64>,
    /// `(pump index, m³/h)` for every running pump, per step
    pub pump_flows: Vec<Vec<(usize, f64)>>,
}

struct StepFlow {
    /// Sum of the running pumps' minimum flows
    floor_m3h: f64,
    segments: Vec<(usize, Variable)>,
}

impl StepFlow {
    fn total(&self) -> Expression {
        self.segments
            .iter()
            .fold(Expression::from(self.floor_m3h), |e, (_, y)| e + *y)
    }

    fn is_constant(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Solve the flow LP for `steps` (one combination per horizon step).
///
/// Returns `Ok(None)` when the trajectory cannot satisfy the level bounds or
/// the smoothness limit.
pub fn solve_flows(
    problem: &MpcProblem,
    relax: &Relaxation<'_>,
    steps: &[Combo],
) -> Result<Option<FlowPlan>, FlowError> {
    let plant = &problem.plant;
    let dt = problem.dt_hours();
    let area = plant.tank.area_m2;
    let min_level = plant.tank.min_level_m;
    let delta = plant.max_flow_delta_m3h;

    let mut vars = variables!();
    let mut objective = Expression::from(0.0);
    let mut constraints: Vec<Constraint> = Vec::new();
    let mut flows: Vec<StepFlow> = Vec::with_capacity(steps.len());

    for (t, combo) in steps.iter().enumerate() {
        let curve = relax.curve(*combo).ok_or(FlowError::UnknownCombo(*combo))?;
        let price = problem.prices[t] * dt;
        objective += price * curve.base_power_kw;
        let mut segments = Vec::with_capacity(curve.segments.len());
        for seg in &curve.segments {
            let y = vars.add(variable().min(0.0).max(seg.length_m3h));
            objective += (price * seg.slope) * y;
            segments.push((seg.pump, y));
        }
        flows.push(StepFlow {
            floor_m3h: curve.min_flow_m3h,
            segments,
        });
    }

    // Smoothness between consecutive totals, seeded by the reference outflow
    let reference = problem.reference_outflow_m3h;
    for t in 0..flows.len() {
        let (prev_expr, prev_constant) = match (t, reference) {
            (0, Some(r)) => (Expression::from(r), true),
            (0, None) => continue,
            _ => (flows[t - 1].total(), flows[t - 1].is_constant()),
        };
        let current = flows[t].total();
        if prev_constant && flows[t].is_constant() {
            let prev = if t == 0 {
                reference.unwrap_or(0.0)
            } else {
                flows[t - 1].floor_m3h
            };
            if (flows[t].floor_m3h - prev).abs() > delta + TOLERANCE {
                return Ok(None);
            }
            continue;
        }
        let step_change = current - prev_expr;
        constraints.push(constraint!(step_change.clone() <= delta));
        constraints.push(constraint!(step_change >= -delta));
    }

    // Stored volume above the minimum level after each step
    let mut stored = Expression::from((problem.initial_level_m - min_level) * area);
    for (t, flow) in flows.iter().enumerate() {
        let ceiling = (problem.level_ceiling(t) - min_level) * area;
        let w = vars.add(variable().min(0.0).max(ceiling.max(0.0)));
        let balance = stored + dt * problem.inflow_m3h[t] - flow.total() * dt;
        constraints.push(constraint!(w == balance));
        stored = Expression::from(w);
    }

    let mut model = vars.minimise(objective).using(microlp);
    for c in constraints {
        model = model.with(c);
    }

    let solution = match model.solve() {
        Ok(solution) => solution,
        Err(ResolutionError::Infeasible) => return Ok(None),
        Err(e) => return Err(FlowError::Solver(e.to_string())),
    };

    let mut totals_m3h = Vec::with_capacity(flows.len());
    let mut pump_flows = Vec::with_capacity(flows.len());
    for (t, flow) in flows.iter().enumerate() {
        let mut per_pump: Vec<(usize, f64)> = steps[t]
            .indices()
            .map(|i| (i, plant.pumps[i].min_flow()))
            .collect();
        for (pump, y) in &flow.segments {
            let extra = solution.value(*y).max(0.0);
            if let Some(entry) = per_pump.iter_mut().find(|(i, _)| i == pump) {
                entry.1 += extra;
            }
        }
        totals_m3h.push(per_pump.iter().map(|(_, f)| f).sum());
        pump_flows.push(per_pump);
    }

    Ok(Some(FlowPlan {
        totals_m3h,
        pump_flows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::problem::tests::{input, small_plant};
    use crate::optimizer::ProblemBuilder;

    #[test]
    fn test_single_pump_holds_level_at_cheapest_flow() {
        let builder = ProblemBuilder::new(small_plant());
        let problem = builder
            .build(input(8.0, vec![0.1, 0.1], vec![30.0, 30.0]))
            .unwrap();
        let relax = Relaxation::new(&problem);
        let one = Combo::from_indices([0]);
        let plan = solve_flows(&problem, &relax, &[one, one]).unwrap().unwrap();
        // At the ceiling every m³ in must be pumped out, nothing more
        for q in &plan.totals_m3h {
            assert!((q - 30.0).abs() < 1e-6, "q = {q}");
        }
        assert_eq!(plan.pump_flows[0].len(), 1);
    }

    #[test]
    fn test_infeasible_combination_returns_none() {
        let builder = ProblemBuilder::new(small_plant());
        let problem = builder
            .build(input(7.9, vec![0.1, 0.1], vec![40.0, 40.0]))
            .unwrap();
        let relax = Relaxation::new(&problem);
        let plan = solve_flows(&problem, &relax, &[Combo::EMPTY, Combo::EMPTY]).unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_reference_limits_first_step() {
        let mut plant = (*small_plant()).clone();
        plant.max_flow_delta_m3h = 5.0;
        let builder = ProblemBuilder::new(std::sync::Arc::new(plant));
        let mut inp = input(4.0, vec![0.1, 0.1], vec![0.0, 0.0]);
        inp.reference_outflow_m3h = Some(30.0);
        let problem = builder.build(inp).unwrap();
        let relax = Relaxation::new(&problem);
        let one = Combo::from_indices([0]);
        let plan = solve_flows(&problem, &relax, &[one, one]).unwrap().unwrap();
        assert!((plan.totals_m3h[0] - 25.0).abs() < 1e-6);
        assert!((plan.totals_m3h[1] - 20.0).abs() < 1e-6);
    }
}
