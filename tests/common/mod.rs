#![allow(dead_code)]
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use intelligent_flow_controller::controller::{ControllerSettings, FallbackPolicy, MpcController};
use intelligent_flow_controller::domain::{
    ForecastKind, ForecastSeries, PowerCurve, Pump, PumpId, Schedule, Tank,
};
use intelligent_flow_controller::forecast::{DiurnalProfile, ForecastAdapter};
use intelligent_flow_controller::hardware::SimulatedPlant;
use intelligent_flow_controller::optimizer::{
    CombinatorialSolver, MpcProblem, PlanError, ProblemBuilder, ProblemInput, ScheduleOptimizer,
    SolverOptions,
};
use intelligent_flow_controller::plant::{PlantModel, TOLERANCE};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, 15, 0, 0, 0).unwrap()
}

pub fn at_step(i: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::minutes(15 * i)
}

/// Five identical pumps on a 20 m² tank; one step at 1 m³/h moves 0.0125 m
pub fn station() -> PlantModel {
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

pub fn solver(max_nodes: u64) -> CombinatorialSolver {
    CombinatorialSolver::new(SolverOptions {
        deadline: Duration::from_secs(20),
        max_nodes,
        block_steps: 4,
    })
}

pub fn input(level: f64, prices: Vec<f64>, inflow: Vec<f64>) -> ProblemInput {
    ProblemInput {
        horizon_start: t0(),
        initial_level_m: level,
        prices,
        inflow_m3h: inflow,
        unavailable: BTreeSet::new(),
        reference_outflow_m3h: Some(0.0),
        pump_status: BTreeMap::new(),
        stale_forecast: false,
    }
}

pub fn publish_flat(adapter: &ForecastAdapter, prices: &[f64], inflow_m3h: f64, issued_at: DateTime<Utc>) {
    adapter.publish(ForecastSeries::new(
        ForecastKind::Price,
        t0(),
        15,
        prices.to_vec(),
        issued_at,
    ));
    adapter.publish(ForecastSeries::new(
        ForecastKind::Inflow,
        t0(),
        15,
        vec![inflow_m3h; prices.len()],
        issued_at,
    ));
}

pub fn settings(horizon_steps: usize) -> ControllerSettings {
    ControllerSettings {
        horizon_steps,
        solve_timeout: Duration::from_secs(30),
        grace: Duration::from_secs(120),
        forecast_cache_max_age: ChronoDuration::hours(24),
        fallback: FallbackPolicy::default(),
    }
}

pub struct Harness {
    pub plant: Arc<PlantModel>,
    pub sim: Arc<SimulatedPlant>,
    pub adapter: Arc<ForecastAdapter>,
    pub controller: Arc<MpcController>,
}

/// Controller over the simulated station with constant inflow and a
/// forecast published at `t0()`
pub fn harness(
    optimizer: Option<Arc<dyn ScheduleOptimizer>>,
    settings: ControllerSettings,
    level_m: f64,
    inflow_m3h: f64,
    prices: &[f64],
    forecast_max_age: ChronoDuration,
) -> Harness {
    let plant = Arc::new(station());
    let sim = Arc::new(SimulatedPlant::new(
        Arc::clone(&plant),
        DiurnalProfile {
            base: inflow_m3h,
            peaks: vec![],
            resolution_minutes: 15,
        },
        level_m,
        t0(),
    ));
    let adapter = Arc::new(ForecastAdapter::new(forecast_max_age));
    publish_flat(&adapter, prices, inflow_m3h, t0());
    let optimizer: Arc<dyn ScheduleOptimizer> = match optimizer {
        Some(o) => o,
        None => Arc::new(solver(5_000)),
    };
    let controller = Arc::new(MpcController::new(
        ProblemBuilder::new(Arc::clone(&plant)),
        optimizer,
        Arc::clone(&adapter),
        sim.clone(),
        sim.clone(),
        settings,
    ));
    Harness {
        plant,
        sim,
        adapter,
        controller,
    }
}

/// Every invariant a committed plan must satisfy
pub fn assert_schedule_sound(plant: &PlantModel, schedule: &Schedule, reference: Option<f64>) {
    let mut previous = reference;
    for (t, step) in schedule.steps.iter().enumerate() {
        assert!(
            plant.within_bounds(step.level_end_m),
            "level {} out of bounds at step {t}",
            step.level_end_m
        );
        let running: Vec<PumpId> = step.running().collect();
        assert!(running.len() <= plant.max_running, "too many pumps at step {t}");
        for id in running {
            let pump = &plant.pumps[plant.pump_index(id).unwrap()];
            let f = step.pump_flows_m3h[&id];
            assert!(f >= pump.min_flow() - TOLERANCE && f <= pump.max_flow() + TOLERANCE);
        }
        if let Some(prev) = previous {
            assert!(
                plant.is_smooth(prev, step.total_flow_m3h),
                "outflow jumps {prev} -> {} at step {t}",
                step.total_flow_m3h
            );
        }
        previous = Some(step.total_flow_m3h);
    }
}

pub fn solve(problem: &MpcProblem) -> Result<Schedule, PlanError> {
    solver(20_000).solve(problem)
}
