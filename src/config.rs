use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::controller::{ControllerSettings, FallbackPolicy};
use crate::domain::{PowerCurve, Pump, Tank};
use crate::forecast::RefreshConfig;
use crate::optimizer::SolverOptions;
use crate::plant::{HeadModel, PlantError, PlantModel};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration could not be loaded: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
    #[error("invalid plant: {0}")]
    Plant(#[from] PlantError),
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub tank: TankConfig,
    #[validate(length(min = 1, max = 16))]
    #[validate(nested)]
    pub pumps: Vec<PumpConfig>,
    /// Lift correction below the level the pump curves were measured at
    #[serde(default)]
    #[validate(nested)]
    pub hydraulics: Option<HydraulicsConfig>,
    #[validate(nested)]
    pub solver: SolverConfig,
    #[validate(nested)]
    pub safety: SafetyConfig,
    #[validate(nested)]
    pub forecast: ForecastConfig,
    pub persistence: PersistenceConfig,
    #[serde(default)]
    #[validate(nested)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ControllerConfig {
    #[validate(range(min = 1, max = 60))]
    pub step_minutes: u32,
    #[validate(range(min = 1, max = 672))]
    pub horizon_steps: usize,
    /// Decisions ready later than this after their tick are discarded
    #[validate(range(min = 1))]
    pub grace_seconds: u64,
    #[validate(range(min = 1))]
    pub solve_timeout_seconds: u64,
    #[validate(range(min = 1))]
    pub forecast_cache_max_age_hours: i64,
    #[validate(range(exclusive_min = 0.0))]
    pub max_flow_delta_m3h: f64,
    /// Ceiling on the level at the end of the horizon
    #[serde(default)]
    pub terminal_level_max_m: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TankConfig {
    #[validate(range(exclusive_min = 0.0))]
    pub area_m2: f64,
    pub min_level_m: f64,
    pub max_level_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PumpConfig {
    #[validate(range(min = 1, max = 32))]
    pub id: u8,
    /// `[flow m³/h, power kW]` operating points, minimum flow first
    #[validate(length(min = 1))]
    pub curve: Vec<[f64; 2]>,
    #[serde(default)]
    pub min_up_steps: u32,
    #[serde(default)]
    pub min_down_steps: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SolverConfig {
    #[validate(range(min = 1))]
    pub deadline_seconds: u64,
    #[validate(range(min = 1))]
    pub max_nodes: u64,
    #[validate(range(min = 1, max = 96))]
    pub block_steps: usize,
    /// Currency per pump state change
    #[validate(range(min = 0.0))]
    pub switch_penalty: f64,
    #[validate(range(min = 1, max = 16))]
    pub max_running: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct HydraulicsConfig {
    pub reference_level_m: f64,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub efficiency: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SafetyConfig {
    /// Fallback holds the previous commands while the projected level stays
    /// within [hold_low_m, hold_high_m]
    pub hold_low_m: f64,
    pub hold_high_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PriceSource {
    Nordpool,
    Profile,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ForecastConfig {
    /// Series issued longer ago than this before the horizon start are unavailable
    #[validate(range(min = 1))]
    pub max_age_hours: i64,
    #[validate(range(min = 1))]
    pub price_refresh_minutes: u64,
    #[validate(range(min = 1))]
    pub inflow_refresh_minutes: u64,
    #[validate(range(min = 1))]
    pub inflow_steps: usize,
    pub price_source: PriceSource,
    #[validate(url)]
    pub nordpool_base_url: String,
    #[validate(length(min = 2))]
    pub nordpool_area: String,
    pub nordpool_cache_ttl_seconds: u64,
    /// Base price of the built-in profile (currency/kWh)
    #[validate(range(min = 0.0))]
    pub profile_base_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Controller state file; unset disables persistence
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SimulationConfig {
    pub initial_level_m: f64,
    #[validate(range(min = 0.0))]
    pub base_inflow_m3h: f64,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub level_noise_m: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_level_m: 4.0,
            base_inflow_m3h: 1500.0,
            level_noise_m: 0.0,
        }
    }
}

impl Config {
    /// `config/default.toml`, then `IFC__*` environment overrides (and `.env`)
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("IFC__").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: Config = figment.extract().map_err(Box::new)?;
        cfg.validate()?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Cross-field checks the derive cannot express
    fn check(&self) -> Result<(), ConfigError> {
        let tank = &self.tank;
        if !(tank.min_level_m < tank.max_level_m) {
            return Err(ConfigError::Inconsistent(format!(
                "tank.min_level_m {} must be below tank.max_level_m {}",
                tank.min_level_m, tank.max_level_m
            )));
        }
        let s = &self.safety;
        if !(tank.min_level_m <= s.hold_low_m
            && s.hold_low_m < s.hold_high_m
            && s.hold_high_m <= tank.max_level_m)
        {
            return Err(ConfigError::Inconsistent(format!(
                "safety hold band [{}, {}] must lie inside the tank bounds",
                s.hold_low_m, s.hold_high_m
            )));
        }
        if let Some(term) = self.controller.terminal_level_max_m {
            if !(term >= tank.min_level_m && term <= tank.max_level_m) {
                return Err(ConfigError::Inconsistent(format!(
                    "controller.terminal_level_max_m {term} outside the tank bounds"
                )));
            }
        }
        if self.solver.block_steps > self.controller.horizon_steps {
            return Err(ConfigError::Inconsistent(
                "solver.block_steps exceeds controller.horizon_steps".into(),
            ));
        }
        if self.solver.deadline_seconds > self.controller.solve_timeout_seconds {
            return Err(ConfigError::Inconsistent(
                "solver.deadline_seconds exceeds controller.solve_timeout_seconds".into(),
            ));
        }
        self.plant_model()?.validate()?;
        Ok(())
    }

    pub fn plant_model(&self) -> Result<PlantModel, ConfigError> {
        let pumps = self
            .pumps
            .iter()
            .map(|p| {
                let points: Vec<(f64, f64)> = p.curve.iter().map(|[f, kw]| (*f, *kw)).collect();
                Pump::new(p.id, PowerCurve::piecewise(&points))
                    .with_min_times(p.min_up_steps, p.min_down_steps)
            })
            .collect();
        let mut plant = PlantModel::new(
            Tank {
                area_m2: self.tank.area_m2,
                min_level_m: self.tank.min_level_m,
                max_level_m: self.tank.max_level_m,
            },
            pumps,
            self.controller.step_minutes,
            self.controller.max_flow_delta_m3h,
        );
        plant.max_running = self.solver.max_running.min(plant.pumps.len());
        if let Some(h) = &self.hydraulics {
            plant = plant.with_head(HeadModel {
                reference_level_m: h.reference_level_m,
                efficiency: h.efficiency,
            });
        }
        Ok(plant)
    }

    pub fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            deadline: Duration::from_secs(self.solver.deadline_seconds),
            max_nodes: self.solver.max_nodes,
            block_steps: self.solver.block_steps,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            horizon_steps: self.controller.horizon_steps,
            solve_timeout: Duration::from_secs(self.controller.solve_timeout_seconds),
            grace: Duration::from_secs(self.controller.grace_seconds),
            forecast_cache_max_age: chrono::Duration::hours(
                self.controller.forecast_cache_max_age_hours,
            ),
            fallback: FallbackPolicy {
                low_m: self.safety.hold_low_m,
                high_m: self.safety.hold_high_m,
            },
        }
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            price_interval: Duration::from_secs(self.forecast.price_refresh_minutes * 60),
            inflow_interval: Duration::from_secs(self.forecast.inflow_refresh_minutes * 60),
            inflow_steps: self.forecast.inflow_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_TOML: &str = include_str!("../config/default.toml");

    fn figment() -> Figment {
        Figment::new().merge(Toml::string(DEFAULT_TOML))
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::from_figment(figment()).unwrap();
        assert_eq!(cfg.controller.step_minutes, 15);
        assert_eq!(cfg.controller.horizon_steps, 96);
        assert_eq!(cfg.pumps.len(), 5);
        assert_eq!(cfg.solver.switch_penalty, 0.0);
        assert_eq!(cfg.forecast.price_source, PriceSource::Nordpool);

        let plant = cfg.plant_model().unwrap();
        assert_eq!(plant.max_running, 5);
        let head = plant.head.unwrap();
        assert_eq!(head.reference_level_m, 8.0);
        assert_eq!(head.efficiency, 0.72);
        assert!((plant.dt_hours() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let cfg = Config::from_figment(
            figment()
                .merge(("solver.switch_penalty", 0.5))
                .merge(("forecast.price_source", "profile")),
        )
        .unwrap();
        assert_eq!(cfg.solver.switch_penalty, 0.5);
        assert_eq!(cfg.forecast.price_source, PriceSource::Profile);
    }

    #[test]
    fn test_rejects_out_of_range_field() {
        let err = Config::from_figment(figment().merge(("controller.step_minutes", 0))).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_hold_band_outside_tank() {
        let err = Config::from_figment(figment().merge(("safety.hold_high_m", 9.0))).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn test_rejects_non_convex_pump_curve() {
        let err = Config::from_figment(figment().merge((
            "pumps",
            vec![PumpToml {
                id: 1,
                curve: vec![[100.0, 10.0], [500.0, 60.0], [800.0, 62.0]],
            }],
        )))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Plant(_)));
    }

    #[test]
    fn test_rejects_more_pumps_than_the_search_handles() {
        let pumps: Vec<PumpToml> = (1..=17)
            .map(|id| PumpToml {
                id,
                curve: vec![[100.0, 10.0], [400.0, 40.0]],
            })
            .collect();
        let err = Config::from_figment(figment().merge(("pumps", pumps))).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_figment(figment().merge(("solver.max_running", 17))).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_hydraulics_section_is_optional() {
        let cfg = Config::from_figment(figment()).unwrap();
        let mut bare = cfg.clone();
        bare.hydraulics = None;
        assert!(bare.plant_model().unwrap().head.is_none());

        let err = Config::from_figment(figment().merge(("hydraulics.efficiency", 1.5))).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[derive(serde::Serialize)]
    struct PumpToml {
        id: u8,
        curve: Vec<[f64; 2]>,
    }
}
