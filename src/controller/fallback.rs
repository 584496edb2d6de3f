//! Deterministic safety fallback used whenever a cycle cannot commit an
//! optimized decision.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::Display;
use tracing::{error, warn};

use crate::domain::{PumpCommands, PumpId};
use crate::plant::PlantModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Keep the previous commands
    Hold,
    /// Every available pump at capacity
    EmergencyDrain,
    /// All pumps off
    Halt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackDecision {
    pub action: FallbackAction,
    pub commands: PumpCommands,
    /// Level after one step under `commands` and the inflow estimate
    pub projected_level_m: f64,
    /// Projection leaves the hard tank bounds
    pub escalated: bool,
}

/// Hold band for the fallback; outside it the policy drains or halts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    pub low_m: f64,
    pub high_m: f64,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            low_m: 1.0,
            high_m: 7.5,
        }
    }
}

impl FallbackPolicy {
    /// Pick the fallback for measured `level_m`, step-0 inflow estimate
    /// (`None` counts as zero) and the commands currently in force.
    pub fn decide(
        &self,
        plant: &PlantModel,
        level_m: f64,
        inflow_estimate_m3h: Option<f64>,
        previous: &PumpCommands,
        unavailable: &BTreeSet<PumpId>,
    ) -> FallbackDecision {
        let inflow = inflow_estimate_m3h.unwrap_or(0.0).max(0.0);
        let held = hold_commands(previous, unavailable);
        let q_hold = held.total_flow_m3h();
        let hold_projection = plant.next_level(level_m, inflow, q_hold);

        let action = if hold_projection >= self.low_m && hold_projection <= self.high_m {
            FallbackAction::Hold
        } else if hold_projection > self.high_m || level_m >= self.high_m {
            FallbackAction::EmergencyDrain
        } else if plant.next_level(level_m, inflow, 0.0) <= self.high_m {
            FallbackAction::Halt
        } else {
            FallbackAction::EmergencyDrain
        };

        let commands = match action {
            FallbackAction::Hold => held,
            FallbackAction::EmergencyDrain => drain_commands(plant, unavailable),
            FallbackAction::Halt => halt_commands(plant),
        };
        let projected_level_m = plant.next_level(level_m, inflow, commands.total_flow_m3h());
        let escalated = !plant.within_bounds(projected_level_m);
        if escalated {
            error!(
                event = "level_escalation",
                action = %action,
                level_m,
                projected_level_m,
                inflow_m3h = inflow,
                "fallback cannot keep the tank within its hard bounds"
            );
        } else {
            warn!(
                event = "fallback",
                action = %action,
                level_m,
                projected_level_m,
                "safety fallback applied"
            );
        }
        FallbackDecision {
            action,
            commands,
            projected_level_m,
            escalated,
        }
    }
}

/// Previous commands minus pumps that went out of service
fn hold_commands(previous: &PumpCommands, unavailable: &BTreeSet<PumpId>) -> PumpCommands {
    let mut held = previous.clone();
    for id in unavailable {
        if held.states.get(id).copied().unwrap_or(false) {
            held.states.insert(*id, false);
        }
        held.flow_setpoints_m3h.remove(id);
    }
    held
}

/// Largest available pumps at capacity, up to the running limit
pub fn drain_commands(plant: &PlantModel, unavailable: &BTreeSet<PumpId>) -> PumpCommands {
    let available = plant.availability(unavailable);
    let mut candidates: Vec<usize> = available.indices().collect();
    candidates.sort_by(|a, b| {
        plant.pumps[*b]
            .max_flow()
            .total_cmp(&plant.pumps[*a].max_flow())
            .then(a.cmp(b))
    });
    candidates.truncate(plant.running_limit(available));

    let mut commands = halt_commands(plant);
    for i in candidates {
        let pump = &plant.pumps[i];
        commands.states.insert(pump.id, true);
        commands.flow_setpoints_m3h.insert(pump.id, pump.max_flow());
    }
    commands
}

pub fn halt_commands(plant: &PlantModel) -> PumpCommands {
    PumpCommands {
        states: plant.pumps.iter().map(|p| (p.id, false)).collect(),
        flow_setpoints_m3h: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::tests::station;
    use rstest::rstest;

    fn running(plant: &PlantModel, ids: &[u8], flow: f64) -> PumpCommands {
        let mut c = halt_commands(plant);
        for id in ids {
            c.states.insert(PumpId(*id), true);
            c.flow_setpoints_m3h.insert(PumpId(*id), flow);
        }
        c
    }

    // station(): area 20 m², 15 min steps, so k = 0.0125 m per m³/h
    #[rstest]
    #[case::inside_band(4.0, Some(100.0), &[1, 2], FallbackAction::Hold)]
    #[case::rising_past_high(7.4, Some(200.0), &[1], FallbackAction::EmergencyDrain)]
    #[case::high_and_idle(7.6, Some(0.0), &[], FallbackAction::EmergencyDrain)]
    #[case::high_but_draining(7.6, Some(0.0), &[1, 2, 3], FallbackAction::Hold)]
    #[case::draining_too_low(1.1, Some(0.0), &[1, 2], FallbackAction::Halt)]
    #[case::unknown_inflow_counts_as_zero(4.0, None, &[], FallbackAction::Hold)]
    fn test_policy_branches(
        #[case] level: f64,
        #[case] inflow: Option<f64>,
        #[case] on: &[u8],
        #[case] expected: FallbackAction,
    ) {
        let plant = station();
        let previous = running(&plant, on, 40.0);
        let d = FallbackPolicy::default().decide(&plant, level, inflow, &previous, &BTreeSet::new());
        assert_eq!(d.action, expected);
    }

    #[test]
    fn test_low_level_with_heavy_inflow_drains() {
        let plant = station();
        // hold projects below low, but inflow alone would lift above high
        let policy = FallbackPolicy {
            low_m: 1.0,
            high_m: 1.5,
        };
        let previous = running(&plant, &[1, 2, 3, 4, 5], 40.0);
        let d = policy.decide(&plant, 1.2, Some(60.0), &previous, &BTreeSet::new());
        assert_eq!(d.action, FallbackAction::EmergencyDrain);
    }

    #[test]
    fn test_emergency_drain_skips_unavailable_pumps() {
        let plant = station();
        let unavailable: BTreeSet<PumpId> = [PumpId(2)].into_iter().collect();
        let d = FallbackPolicy::default().decide(
            &plant,
            7.9,
            Some(50.0),
            &PumpCommands::default(),
            &unavailable,
        );
        assert_eq!(d.action, FallbackAction::EmergencyDrain);
        assert!(!d.commands.is_running(PumpId(2)));
        assert_eq!(d.commands.running_count(), 4);
        assert!((d.commands.total_flow_m3h() - 160.0).abs() < 1e-9);
    }

    #[test]
    fn test_hold_drops_out_of_service_pump() {
        let plant = station();
        let previous = running(&plant, &[1, 2], 40.0);
        let unavailable: BTreeSet<PumpId> = [PumpId(1)].into_iter().collect();
        let d = FallbackPolicy::default().decide(&plant, 4.0, Some(40.0), &previous, &unavailable);
        assert_eq!(d.action, FallbackAction::Hold);
        assert!(!d.commands.is_running(PumpId(1)));
        assert!(d.commands.is_running(PumpId(2)));
    }

    #[test]
    fn test_escalation_flagged_when_drain_is_not_enough() {
        let plant = station();
        // 5 × 40 = 200 m³/h against 1000 m³/h inflow
        let d = FallbackPolicy::default().decide(
            &plant,
            7.95,
            Some(1000.0),
            &PumpCommands::default(),
            &BTreeSet::new(),
        );
        assert_eq!(d.action, FallbackAction::EmergencyDrain);
        assert!(d.escalated);
    }
}
