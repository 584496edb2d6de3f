//! Sensor and actuator seams of the pumping station.
//!
//! Drivers live outside this crate; the controller only sees these traits.

#[cfg(feature = "sim")]
pub mod simulated;

#[cfg(feature = "sim")]
pub use simulated::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::domain::{PumpCommands, PumpId};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("sensor unavailable: {0}")]
    Unavailable(String),
    #[error("implausible {sensor} reading: {value}")]
    Implausible { sensor: &'static str, value: f64 },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActuationError {
    #[error("actuator link down: {0}")]
    Link(String),
    #[error("pump {0} rejected command: {1}")]
    Rejected(PumpId, String),
}

#[async_trait]
pub trait Sensors: Send + Sync {
    /// Tunnel level (m)
    async fn read_tank_level(&self) -> Result<f64, SensorError>;

    async fn read_pump_states(&self) -> Result<BTreeMap<PumpId, bool>, SensorError>;

    /// Total measured outflow (m³/h), if the station has a flow meter
    async fn read_outflow(&self) -> Result<Option<f64>, SensorError> {
        Ok(None)
    }

    /// Pumps offline or under maintenance
    async fn read_unavailable(&self) -> Result<BTreeSet<PumpId>, SensorError> {
        Ok(BTreeSet::new())
    }
}

#[async_trait]
pub trait Actuator: Send + Sync {
    /// Send complete desired pump states; repeating a command is harmless
    async fn set_pump_commands(&self, commands: &PumpCommands) -> Result<(), ActuationError>;
}

/// One consistent read of all sensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub taken_at: DateTime<Utc>,
    pub level_m: f64,
    pub pump_states: BTreeMap<PumpId, bool>,
    pub outflow_m3h: Option<f64>,
    pub unavailable: BTreeSet<PumpId>,
}

impl Measurement {
    pub fn running(&self) -> impl Iterator<Item = PumpId> + '_ {
        self.pump_states
            .iter()
            .filter(|(_, on)| **on)
            .map(|(id, _)| *id)
    }
}

/// Read every sensor; the level must be a finite number
pub async fn read_measurement(
    sensors: &dyn Sensors,
    taken_at: DateTime<Utc>,
) -> Result<Measurement, SensorError> {
    let level_m = sensors.read_tank_level().await?;
    if !level_m.is_finite() {
        return Err(SensorError::Implausible {
            sensor: "tank level",
            value: level_m,
        });
    }
    let pump_states = sensors.read_pump_states().await?;
    let outflow_m3h = match sensors.read_outflow().await? {
        Some(q) if !q.is_finite() || q < 0.0 => {
            return Err(SensorError::Implausible {
                sensor: "outflow",
                value: q,
            })
        }
        other => other,
    };
    let unavailable = sensors.read_unavailable().await?;
    Ok(Measurement {
        taken_at,
        level_m,
        pump_states,
        outflow_m3h,
        unavailable,
    })
}
