//! In-memory pumping station for demo runs and integration tests

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ActuationError, Actuator, SensorError, Sensors};
use crate::domain::{PumpCommands, PumpId};
use crate::forecast::DiurnalProfile;
use crate::plant::PlantModel;

#[derive(Debug, Clone)]
struct SimState {
    clock: DateTime<Utc>,
    level_m: f64,
    commands: PumpCommands,
    unavailable: BTreeSet<PumpId>,
    /// Scripted level readings served before the true level
    scripted_levels: VecDeque<f64>,
    sensors_failed: bool,
    actuator_failed: bool,
    commands_received: u64,
}

/// Tank driven by an inflow profile and the last applied pump commands
#[derive(Clone)]
pub struct SimulatedPlant {
    plant: Arc<PlantModel>,
    inflow: DiurnalProfile,
    state: Arc<RwLock<SimState>>,
    /// Report total outflow like a station flow meter
    pub has_flow_meter: bool,
    /// Uniform error of the level transmitter (± m)
    pub level_noise_m: f64,
}

impl SimulatedPlant {
    pub fn new(
        plant: Arc<PlantModel>,
        inflow: DiurnalProfile,
        initial_level_m: f64,
        clock: DateTime<Utc>,
    ) -> Self {
        Self {
            plant,
            inflow,
            state: Arc::new(RwLock::new(SimState {
                clock,
                level_m: initial_level_m,
                commands: PumpCommands::default(),
                unavailable: BTreeSet::new(),
                scripted_levels: VecDeque::new(),
                sensors_failed: false,
                actuator_failed: false,
                commands_received: 0,
            })),
            has_flow_meter: true,
            level_noise_m: 0.0,
        }
    }

    /// Flow actually delivered for the current commands, each running pump
    /// clamped to its operating range
    fn delivered_m3h(&self, commands: &PumpCommands) -> f64 {
        self.plant
            .pumps
            .iter()
            .filter(|p| commands.is_running(p.id))
            .map(|p| {
                let setpoint = commands
                    .flow_setpoints_m3h
                    .get(&p.id)
                    .copied()
                    .unwrap_or(p.max_flow());
                setpoint.clamp(p.min_flow(), p.max_flow())
            })
            .sum()
    }

    /// Integrate the tank over one control step
    pub async fn advance(&self) {
        let mut st = self.state.write().await;
        let inflow = self.inflow.value_at(st.clock);
        let outflow = self.delivered_m3h(&st.commands);
        st.level_m = self.plant.next_level(st.level_m, inflow, outflow);
        st.clock += Duration::minutes(self.plant.step_minutes as i64);
        debug!(
            clock = %st.clock,
            level_m = st.level_m,
            inflow_m3h = inflow,
            outflow_m3h = outflow,
            "simulated step"
        );
    }

    pub async fn clock(&self) -> DateTime<Utc> {
        self.state.read().await.clock
    }

    pub async fn level(&self) -> f64 {
        self.state.read().await.level_m
    }

    pub async fn set_level(&self, level_m: f64) {
        self.state.write().await.level_m = level_m;
    }

    pub async fn commands(&self) -> PumpCommands {
        self.state.read().await.commands.clone()
    }

    pub async fn commands_received(&self) -> u64 {
        self.state.read().await.commands_received
    }

    /// Serve these level readings (one per read) before the true level again
    pub async fn script_levels(&self, levels: impl IntoIterator<Item = f64>) {
        self.state.write().await.scripted_levels.extend(levels);
    }

    pub async fn set_sensor_failure(&self, failed: bool) {
        self.state.write().await.sensors_failed = failed;
    }

    pub async fn set_actuator_failure(&self, failed: bool) {
        self.state.write().await.actuator_failed = failed;
    }

    pub async fn set_unavailable(&self, pumps: impl IntoIterator<Item = PumpId>) {
        self.state.write().await.unavailable = pumps.into_iter().collect();
    }

    pub fn inflow_at(&self, t: DateTime<Utc>) -> f64 {
        self.inflow.value_at(t)
    }
}

#[async_trait]
impl Sensors for SimulatedPlant {
    async fn read_tank_level(&self) -> Result<f64, SensorError> {
        let mut st = self.state.write().await;
        if st.sensors_failed {
            return Err(SensorError::Unavailable("level transmitter offline".into()));
        }
        let level = st.scripted_levels.pop_front().unwrap_or(st.level_m);
        if self.level_noise_m > 0.0 {
            let noise = rand::thread_rng().gen_range(-self.level_noise_m..=self.level_noise_m);
            return Ok(level + noise);
        }
        Ok(level)
    }

    async fn read_pump_states(&self) -> Result<BTreeMap<PumpId, bool>, SensorError> {
        let st = self.state.read().await;
        if st.sensors_failed {
            return Err(SensorError::Unavailable("pump status bus offline".into()));
        }
        Ok(self
            .plant
            .pumps
            .iter()
            .map(|p| (p.id, st.commands.is_running(p.id)))
            .collect())
    }

    async fn read_outflow(&self) -> Result<Option<f64>, SensorError> {
        if !self.has_flow_meter {
            return Ok(None);
        }
        let st = self.state.read().await;
        Ok(Some(self.delivered_m3h(&st.commands)))
    }

    async fn read_unavailable(&self) -> Result<BTreeSet<PumpId>, SensorError> {
        Ok(self.state.read().await.unavailable.clone())
    }
}

#[async_trait]
impl Actuator for SimulatedPlant {
    async fn set_pump_commands(&self, commands: &PumpCommands) -> Result<(), ActuationError> {
        let mut st = self.state.write().await;
        if st.actuator_failed {
            return Err(ActuationError::Link("PLC not responding".into()));
        }
        if let Some(id) = commands
            .states
            .iter()
            .find(|(id, on)| **on && st.unavailable.contains(id))
            .map(|(id, _)| *id)
        {
            return Err(ActuationError::Rejected(id, "pump is out of service".into()));
        }
        st.commands = commands.clone();
        st.commands_received += 1;
        Ok(())
    }
}
