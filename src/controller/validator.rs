//! Schedule Validator
//!
//! Last check between the solver and the pumps: the step-0 decision is
//! re-checked against a measurement taken after the solve.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{PumpCommands, PumpId, PumpStatus, Schedule};
use crate::hardware::Measurement;
use crate::plant::{PlantModel, TOLERANCE};

/// One violated check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectionReason {
    EmptySchedule,
    UnknownPump(PumpId),
    UnavailablePump(PumpId),
    TooManyPumps {
        running: usize,
        limit: usize,
    },
    FlowOutOfRange {
        pump: PumpId,
        flow_m3h: f64,
        min_m3h: f64,
        max_m3h: f64,
    },
    LevelOutOfBounds {
        projected_level_m: f64,
        min_m: f64,
        max_m: f64,
    },
    NotSmooth {
        previous_m3h: f64,
        next_m3h: f64,
        max_delta_m3h: f64,
    },
    MinUpTime {
        pump: PumpId,
        steps_in_state: u32,
        required: u32,
    },
    MinDownTime {
        pump: PumpId,
        steps_in_state: u32,
        required: u32,
    },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::EmptySchedule => write!(f, "schedule has no steps"),
            RejectionReason::UnknownPump(id) => write!(f, "unknown pump {id}"),
            RejectionReason::UnavailablePump(id) => write!(f, "pump {id} is out of service"),
            RejectionReason::TooManyPumps { running, limit } => {
                write!(f, "{running} pumps running, limit {limit}")
            }
            RejectionReason::FlowOutOfRange {
                pump,
                flow_m3h,
                min_m3h,
                max_m3h,
            } => write!(
                f,
                "pump {pump} flow {flow_m3h:.1} m³/h outside [{min_m3h:.1}, {max_m3h:.1}]"
            ),
            RejectionReason::LevelOutOfBounds {
                projected_level_m,
                min_m,
                max_m,
            } => write!(
                f,
                "projected level {projected_level_m:.3} m outside [{min_m}, {max_m}]"
            ),
            RejectionReason::NotSmooth {
                previous_m3h,
                next_m3h,
                max_delta_m3h,
            } => write!(
                f,
                "outflow step {previous_m3h:.1} -> {next_m3h:.1} m³/h exceeds {max_delta_m3h:.1}"
            ),
            RejectionReason::MinUpTime {
                pump,
                steps_in_state,
                required,
            } => write!(
                f,
                "pump {pump} stopped after {steps_in_state} of {required} minimum up steps"
            ),
            RejectionReason::MinDownTime {
                pump,
                steps_in_state,
                required,
            } => write!(
                f,
                "pump {pump} started after {steps_in_state} of {required} minimum down steps"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorRejection {
    pub schedule_id: Uuid,
    pub reasons: Vec<RejectionReason>,
}

impl fmt::Display for ValidatorRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "schedule {} rejected: {}",
            self.schedule_id,
            self.reasons.iter().join("; ")
        )
    }
}

impl std::error::Error for ValidatorRejection {}

/// What the step-0 decision is checked against
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    /// Measurement re-read after the solve
    pub measurement: &'a Measurement,
    /// Step-0 inflow of the forecast the plan was built on
    pub inflow_m3h: f64,
    pub reference_outflow_m3h: Option<f64>,
    /// Pump status at the start of the cycle
    pub pump_status: &'a BTreeMap<PumpId, PumpStatus>,
}

pub struct ScheduleValidator {
    plant: Arc<PlantModel>,
}

impl ScheduleValidator {
    pub fn new(plant: Arc<PlantModel>) -> Self {
        Self { plant }
    }

    /// Commands for step 0 if every check passes, otherwise all violations
    pub fn validate(
        &self,
        schedule: &Schedule,
        ctx: &ValidationContext<'_>,
    ) -> Result<PumpCommands, ValidatorRejection> {
        let reject = |reasons: Vec<RejectionReason>| ValidatorRejection {
            schedule_id: schedule.id,
            reasons,
        };
        let Some(step) = schedule.first_step() else {
            return Err(reject(vec![RejectionReason::EmptySchedule]));
        };
        let commands = step.commands();
        let mut reasons = Vec::new();

        for (id, flow) in &step.pump_flows_m3h {
            let Some(idx) = self.plant.pump_index(*id) else {
                reasons.push(RejectionReason::UnknownPump(*id));
                continue;
            };
            if *flow <= 0.0 {
                continue;
            }
            if ctx.measurement.unavailable.contains(id) {
                reasons.push(RejectionReason::UnavailablePump(*id));
            }
            let pump = &self.plant.pumps[idx];
            if *flow < pump.min_flow() - TOLERANCE || *flow > pump.max_flow() + TOLERANCE {
                reasons.push(RejectionReason::FlowOutOfRange {
                    pump: *id,
                    flow_m3h: *flow,
                    min_m3h: pump.min_flow(),
                    max_m3h: pump.max_flow(),
                });
            }
        }

        let available = self.plant.availability(&ctx.measurement.unavailable);
        let limit = self.plant.running_limit(available);
        let running = commands.running_count();
        if running > limit {
            reasons.push(RejectionReason::TooManyPumps { running, limit });
        }

        let total = commands.total_flow_m3h();
        let projected_level_m =
            self.plant
                .next_level(ctx.measurement.level_m, ctx.inflow_m3h, total);
        if !self.plant.within_bounds(projected_level_m) {
            reasons.push(RejectionReason::LevelOutOfBounds {
                projected_level_m,
                min_m: self.plant.tank.min_level_m,
                max_m: self.plant.tank.max_level_m,
            });
        }

        if let Some(previous) = ctx.reference_outflow_m3h {
            if !self.plant.is_smooth(previous, total) {
                reasons.push(RejectionReason::NotSmooth {
                    previous_m3h: previous,
                    next_m3h: total,
                    max_delta_m3h: self.plant.max_flow_delta_m3h,
                });
            }
        }

        for pump in &self.plant.pumps {
            let Some(status) = ctx.pump_status.get(&pump.id) else {
                continue;
            };
            let on = commands.is_running(pump.id);
            if status.running && !on {
                // stopping a pump that went out of service is always allowed
                if !ctx.measurement.unavailable.contains(&pump.id)
                    && status.steps_in_state < pump.min_up_steps
                {
                    reasons.push(RejectionReason::MinUpTime {
                        pump: pump.id,
                        steps_in_state: status.steps_in_state,
                        required: pump.min_up_steps,
                    });
                }
            } else if !status.running && on && status.steps_in_state < pump.min_down_steps {
                reasons.push(RejectionReason::MinDownTime {
                    pump: pump.id,
                    steps_in_state: status.steps_in_state,
                    required: pump.min_down_steps,
                });
            }
        }

        if reasons.is_empty() {
            Ok(commands)
        } else {
            let rejection = reject(reasons);
            warn!(
                event = "control_degradation",
                schedule_id = %schedule.id,
                reasons = %rejection.reasons.iter().join("; "),
                "schedule rejected by validator"
            );
            Err(rejection)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PowerCurve, Pump, ScheduleStep, SolverStats, Tank};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::BTreeSet;

    fn plant() -> Arc<PlantModel> {
        Arc::new(PlantModel::new(
            Tank {
                area_m2: 10.0,
                min_level_m: 0.5,
                max_level_m: 8.0,
            },
            vec![
                Pump::new(1, PowerCurve::affine(10.0, 40.0, 2.0, 0.25)).with_min_times(2, 2),
                Pump::new(2, PowerCurve::affine(10.0, 40.0, 3.0, 0.30)),
            ],
            15,
            60.0,
        ))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 15, 0, 0, 0).unwrap()
    }

    fn schedule(flows: &[(u8, f64)]) -> Schedule {
        let pump_flows_m3h: BTreeMap<PumpId, f64> =
            flows.iter().map(|(id, f)| (PumpId(*id), *f)).collect();
        let total: f64 = flows.iter().map(|(_, f)| f).sum();
        Schedule {
            id: Uuid::new_v4(),
            created_at: t0(),
            horizon_start: t0(),
            step_minutes: 15,
            initial_level_m: 4.0,
            steps: vec![ScheduleStep {
                time_start: t0(),
                time_end: t0() + Duration::minutes(15),
                pump_flows_m3h,
                total_flow_m3h: total,
                inflow_m3h: 20.0,
                price: 0.1,
                power_kw: 0.0,
                cost: 0.0,
                level_end_m: 4.0,
            }],
            energy_cost: 0.0,
            switches: 0,
            optimal: true,
            stale_forecast: false,
            stats: SolverStats::default(),
            optimizer_version: "test".into(),
        }
    }

    fn measurement(level_m: f64, unavailable: &[u8]) -> Measurement {
        Measurement {
            taken_at: t0(),
            level_m,
            pump_states: BTreeMap::new(),
            outflow_m3h: None,
            unavailable: unavailable.iter().map(|i| PumpId(*i)).collect::<BTreeSet<_>>(),
        }
    }

    fn long_stopped() -> BTreeMap<PumpId, PumpStatus> {
        [(PumpId(1), PumpStatus::stopped()), (PumpId(2), PumpStatus::stopped())]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_accepts_feasible_step() {
        let v = ScheduleValidator::new(plant());
        let m = measurement(4.0, &[]);
        let status = long_stopped();
        let ctx = ValidationContext {
            measurement: &m,
            inflow_m3h: 20.0,
            reference_outflow_m3h: Some(0.0),
            pump_status: &status,
        };
        let cmd = v.validate(&schedule(&[(1, 20.0), (2, 0.0)]), &ctx).unwrap();
        assert!(cmd.is_running(PumpId(1)));
        assert!(!cmd.is_running(PumpId(2)));
    }

    #[test]
    fn test_rejects_level_drift_since_solve() {
        let v = ScheduleValidator::new(plant());
        // plan assumed 4.0 m; the tank is now near the top and the step
        // leaves it rising
        let m = measurement(7.9, &[]);
        let status = long_stopped();
        let ctx = ValidationContext {
            measurement: &m,
            inflow_m3h: 60.0,
            reference_outflow_m3h: None,
            pump_status: &status,
        };
        let err = v.validate(&schedule(&[(1, 10.0)]), &ctx).unwrap_err();
        assert!(matches!(
            err.reasons[0],
            RejectionReason::LevelOutOfBounds { .. }
        ));
    }

    #[test]
    fn test_collects_every_violation() {
        let v = ScheduleValidator::new(plant());
        let m = measurement(4.0, &[2]);
        let status = long_stopped();
        let ctx = ValidationContext {
            measurement: &m,
            inflow_m3h: 20.0,
            reference_outflow_m3h: Some(0.0),
            pump_status: &status,
        };
        let err = v
            .validate(&schedule(&[(1, 45.0), (2, 40.0)]), &ctx)
            .unwrap_err();
        assert!(err.reasons.contains(&RejectionReason::UnavailablePump(PumpId(2))));
        assert!(err
            .reasons
            .iter()
            .any(|r| matches!(r, RejectionReason::FlowOutOfRange { pump, .. } if *pump == PumpId(1))));
        assert!(err.reasons.iter().any(|r| matches!(r, RejectionReason::TooManyPumps { .. })));
        assert!(err.reasons.iter().any(|r| matches!(r, RejectionReason::NotSmooth { .. })));
        assert!(err.to_string().contains("out of service"));
    }

    #[test]
    fn test_min_up_time_blocks_early_stop() {
        let v = ScheduleValidator::new(plant());
        let m = measurement(4.0, &[]);
        let status: BTreeMap<PumpId, PumpStatus> = [(
            PumpId(1),
            PumpStatus {
                running: true,
                steps_in_state: 1,
            },
        )]
        .into_iter()
        .collect();
        let ctx = ValidationContext {
            measurement: &m,
            inflow_m3h: 20.0,
            reference_outflow_m3h: None,
            pump_status: &status,
        };
        let err = v.validate(&schedule(&[(1, 0.0)]), &ctx).unwrap_err();
        assert_eq!(
            err.reasons,
            vec![RejectionReason::MinUpTime {
                pump: PumpId(1),
                steps_in_state: 1,
                required: 2
            }]
        );

        // the same stop is fine once the pump is out of service
        let m = measurement(4.0, &[1]);
        let ctx = ValidationContext {
            measurement: &m,
            ..ctx
        };
        assert!(v.validate(&schedule(&[(1, 0.0)]), &ctx).is_ok());
    }
}
