//! Branch-and-bound over pump-combination trajectories.
//!
//! The search branches on the combination of the next decision block in
//! horizon order (depth first). Every child is checked by bound propagation
//! and priced by the relaxed cost bound; complete trajectories are handed to
//! the flow LP. Children are visited by ascending bound, then fewer switches,
//! then combination mask, so two runs over the same inputs walk the same tree.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::collections::BTreeMap;
use std::iter;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bounds::{Relaxation, Violation};
use super::flows::{solve_flows, FlowPlan};
use super::{MpcProblem, PlanError, ScheduleOptimizer, SolverOptions};
use crate::domain::{PumpStatus, Schedule, ScheduleStep, SolverStats};
use crate::plant::{Combo, PlantModel};

pub const OPTIMIZER_VERSION: &str = "bnb-v1";

/// Relative cost tolerance under which two schedules count as equally cheap
const COST_TOLERANCE: f64 = 1e-9;

struct Node {
    /// Combination per horizon step for the fixed prefix
    steps: Vec<Combo>,
    /// Pump status after the prefix, indexed like the plant's pumps
    status: Vec<PumpStatus>,
    switches: u32,
    bound: f64,
}

/// Outcome of one depth-first pass
struct Search {
    incumbent: Option<Incumbent>,
    deepest: Option<Violation>,
    exhausted: bool,
    block: usize,
}

struct Incumbent {
    cost: f64,
    switches: u32,
    steps: Vec<Combo>,
    plan: FlowPlan,
}

impl Incumbent {
    fn tolerance(&self) -> f64 {
        COST_TOLERANCE * self.cost.abs().max(1.0)
    }

    /// A subtree with this bound and prefix switches cannot beat the
    /// incumbent: either strictly more expensive, or tied and already
    /// switching more.
    fn dominates(&self, bound: f64, switches: u32) -> bool {
        let tol = self.tolerance();
        bound > self.cost + tol || (bound >= self.cost - tol && switches > self.switches)
    }

    fn is_beaten_by(&self, cost: f64, switches: u32, steps: &[Combo]) -> bool {
        let tol = self.tolerance();
        if cost < self.cost - tol {
            return true;
        }
        if cost > self.cost + tol {
            return false;
        }
        (switches, steps) < (self.switches, self.steps.as_slice())
    }
}

/// Exact (given enough budget) solver for one MPC instance
#[derive(Debug, Clone, Default)]
pub struct CombinatorialSolver {
    options: SolverOptions,
}

impl CombinatorialSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Search with the configured block length first. Blocks only restrict
    /// the trajectory space, so an exhausted blocked tree proves nothing:
    /// without an incumbent the search restarts at step granularity on the
    /// remaining budget.
    pub fn solve(&self, problem: &MpcProblem) -> Result<Schedule, PlanError> {
        let started = Instant::now();
        let relax = Relaxation::new(problem);
        let n = problem.horizon();
        let block = self.options.block_steps.max(1);
        let root_bound = relax.evaluate(&[]).unwrap_or(f64::NEG_INFINITY);

        let mut stats = SolverStats::default();
        let mut search = self.search(problem, &relax, block, started, &mut stats);
        if search.incumbent.is_none() && search.exhausted && block > 1 {
            info!(
                block_steps = block,
                nodes = stats.nodes_expanded,
                "no schedule with blocked switching, searching step by step"
            );
            search = self.search(problem, &relax, 1, started, &mut stats);
        }
        let Search {
            incumbent,
            deepest,
            exhausted,
            block,
        } = search;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        match incumbent {
            Some(inc) => {
                // a blocked tree is only a proof when nothing can undercut it
                let optimal = exhausted
                    && (block == 1 || inc.cost <= root_bound + inc.tolerance());
                let schedule = build_schedule(problem, inc, optimal, stats);
                info!(
                    energy_cost = schedule.energy_cost,
                    switches = schedule.switches,
                    optimal = schedule.optimal,
                    block_steps = block,
                    nodes = schedule.stats.nodes_expanded,
                    leaves = schedule.stats.leaves_evaluated,
                    elapsed_ms = schedule.stats.elapsed_ms,
                    "schedule optimized"
                );
                Ok(schedule)
            }
            None if exhausted => {
                let err = match deepest {
                    Some(v) => PlanError::from(v),
                    None => PlanError::InfeasibleHorizon {
                        step: n,
                        projected_level_m: problem.initial_level_m,
                        bound: problem.plant.tank.max_level_m,
                    },
                };
                warn!(error = %err, nodes = stats.nodes_expanded, "search exhausted without a feasible schedule");
                Err(err)
            }
            None => Err(PlanError::SolverTimeout {
                elapsed_ms: stats.elapsed_ms,
                nodes: stats.nodes_expanded + stats.leaves_evaluated,
            }),
        }
    }

    /// Depth-first search where every child fixes `block` steps; budget and
    /// deadline are shared through `stats` and `started`.
    fn search(
        &self,
        problem: &MpcProblem,
        relax: &Relaxation<'_>,
        block: usize,
        started: Instant,
        stats: &mut SolverStats,
    ) -> Search {
        let n = problem.horizon();
        let combos: Vec<Combo> = relax.combos().collect();
        let mut incumbent: Option<Incumbent> = None;
        let mut deepest: Option<Violation> = None;
        let mut exhausted = true;

        let mut stack = vec![Node {
            steps: Vec::with_capacity(n),
            status: problem.initial_status.clone(),
            switches: 0,
            bound: f64::NEG_INFINITY,
        }];

        while let Some(node) = stack.pop() {
            if stats.nodes_expanded + stats.leaves_evaluated >= self.options.max_nodes
                || started.elapsed() >= self.options.deadline
            {
                exhausted = false;
                break;
            }
            if let Some(inc) = &incumbent {
                if inc.dominates(node.bound, node.switches) {
                    stats.pruned_by_bound += 1;
                    continue;
                }
            }

            if node.steps.len() == n {
                stats.leaves_evaluated += 1;
                let plan = match solve_flows(problem, relax, &node.steps) {
                    Ok(Some(plan)) => plan,
                    Ok(None) => {
                        stats.pruned_infeasible += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "flow sub-problem failed, candidate skipped");
                        stats.pruned_infeasible += 1;
                        continue;
                    }
                };
                let cost = energy_cost(problem, &plan)
                    + problem.switch_penalty * node.switches as f64;
                let better = incumbent
                    .as_ref()
                    .map_or(true, |inc| inc.is_beaten_by(cost, node.switches, &node.steps));
                if better {
                    debug!(cost, switches = node.switches, "new incumbent");
                    incumbent = Some(Incumbent {
                        cost,
                        switches: node.switches,
                        steps: node.steps,
                        plan,
                    });
                }
                continue;
            }

            let start = node.steps.len();
            let len = block.min(n - start);
            let prev = node.steps.last().copied().unwrap_or(problem.initial_combo);

            let mut children = Vec::new();
            for &combo in &combos {
                if !respects_min_times(problem, &node.status, combo) {
                    continue;
                }
                stats.nodes_expanded += 1;

                let mut steps = node.steps.clone();
                steps.extend(iter::repeat(combo).take(len));
                let flows = match relax.propagate(&steps) {
                    Ok(flows) => flows,
                    Err(v) => {
                        stats.pruned_infeasible += 1;
                        if deepest.map_or(true, |d| violation_step(&v) > violation_step(&d)) {
                            deepest = Some(v);
                        }
                        continue;
                    }
                };
                let Some(energy) = relax.lower_bound(&steps, &flows) else {
                    stats.pruned_infeasible += 1;
                    continue;
                };
                let switches = node.switches + combo.changes_from(prev) as u32;
                let bound = energy + problem.switch_penalty * switches as f64;
                if incumbent
                    .as_ref()
                    .is_some_and(|inc| inc.dominates(bound, switches))
                {
                    stats.pruned_by_bound += 1;
                    continue;
                }

                let status = node
                    .status
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        let on = combo.contains(i);
                        (0..len).fold(*s, |s, _| s.advance(on))
                    })
                    .collect();
                children.push(Node {
                    steps,
                    status,
                    switches,
                    bound,
                });
            }

            children.sort_by(|a, b| {
                a.bound
                    .total_cmp(&b.bound)
                    .then(a.switches.cmp(&b.switches))
                    .then(a.steps[start].cmp(&b.steps[start]))
            });
            stack.extend(children.into_iter().rev());
        }

        Search {
            incumbent,
            deepest,
            exhausted,
            block,
        }
    }
}

#[async_trait]
impl ScheduleOptimizer for CombinatorialSolver {
    async fn optimize(&self, problem: MpcProblem) -> Result<Schedule, PlanError> {
        let solver = self.clone();
        tokio::task::spawn_blocking(move || solver.solve(&problem))
            .await
            .map_err(|e| PlanError::Worker(e.to_string()))?
    }
}

fn violation_step(v: &Violation) -> usize {
    match v {
        Violation::Level { step, .. } | Violation::Flow { step } => *step,
    }
}

/// Minimum up/down times for pumps whose state would change. Pumps outside
/// the available set are always allowed to stop.
fn respects_min_times(problem: &MpcProblem, status: &[PumpStatus], combo: Combo) -> bool {
    problem
        .plant
        .pumps
        .iter()
        .zip(status)
        .enumerate()
        .filter(|(i, _)| problem.available.contains(*i))
        .all(|(i, (pump, s))| match (s.running, combo.contains(i)) {
            (true, false) => s.steps_in_state >= pump.min_up_steps,
            (false, true) => s.steps_in_state >= pump.min_down_steps,
            _ => true,
        })
}

/// Power of one step, with head evaluated at the level the step starts from
fn step_power_kw(plant: &PlantModel, flows: &[(usize, f64)], level_m: f64) -> f64 {
    flows.iter().map(|(i, f)| plant.pump_power_kw(*i, *f, level_m)).sum()
}

fn energy_cost(problem: &MpcProblem, plan: &FlowPlan) -> f64 {
    let plant = &problem.plant;
    let dt = problem.dt_hours();
    let mut level = problem.initial_level_m;
    let mut cost = 0.0;
    for (t, flows) in plan.pump_flows.iter().enumerate() {
        cost += problem.prices[t] * step_power_kw(plant, flows, level) * dt;
        level = plant.next_level(level, problem.inflow_m3h[t], plan.totals_m3h[t]);
    }
    cost
}

fn build_schedule(
    problem: &MpcProblem,
    inc: Incumbent,
    optimal: bool,
    stats: SolverStats,
) -> Schedule {
    let plant = &problem.plant;
    let dt = problem.dt_hours();
    let step = ChronoDuration::minutes(plant.step_minutes as i64);

    let mut level = problem.initial_level_m;
    let mut steps = Vec::with_capacity(inc.steps.len());
    let mut prev = problem.initial_combo;
    let mut switches = 0u32;
    for (t, flows) in inc.plan.pump_flows.iter().enumerate() {
        let mut pump_flows_m3h: BTreeMap<_, f64> = plant.pumps.iter().map(|p| (p.id, 0.0)).collect();
        for (i, f) in flows {
            pump_flows_m3h.insert(plant.pumps[*i].id, *f);
        }
        let power_kw = step_power_kw(plant, flows, level);
        let total = inc.plan.totals_m3h[t];
        let inflow = problem.inflow_m3h[t];
        level = plant.next_level(level, inflow, total);
        switches += inc.steps[t].changes_from(prev) as u32;
        prev = inc.steps[t];

        let time_start = problem.horizon_start + step * t as i32;
        steps.push(ScheduleStep {
            time_start,
            time_end: time_start + step,
            pump_flows_m3h,
            total_flow_m3h: total,
            inflow_m3h: inflow,
            price: problem.prices[t],
            power_kw,
            cost: problem.prices[t] * power_kw * dt,
            level_end_m: level,
        });
    }

    Schedule {
        id: Uuid::new_v4(),
        created_at: chrono::Utc::now(),
        horizon_start: problem.horizon_start,
        step_minutes: plant.step_minutes,
        initial_level_m: problem.initial_level_m,
        energy_cost: steps.iter().map(|s| s.cost).sum(),
        steps,
        switches,
        optimal,
        stale_forecast: problem.stale_forecast,
        stats,
        optimizer_version: OPTIMIZER_VERSION.to_string(),
    }
}
