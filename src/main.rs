use anyhow::{Context, Result};
use chrono::Utc;
use intelligent_flow_controller::{config, controller, forecast, hardware, optimizer, telemetry};
use std::sync::Arc;
use tracing::{info, warn};

use config::{Config, PriceSource};
use controller::{ControlLoop, ControllerState, MpcController, StateStore};
use forecast::{
    DiurnalProfile, ForecastAdapter, ForecastRefresher, InflowForecaster, NordpoolPriceForecaster,
    PriceForecaster,
};
use hardware::{Actuator, Sensors};
use optimizer::{CombinatorialSolver, ProblemBuilder, ScheduleOptimizer};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let cfg = Config::load().context("loading configuration")?;
    let plant = Arc::new(cfg.plant_model()?);
    info!(
        pumps = plant.pumps.len(),
        area_m2 = plant.tank.area_m2,
        step_minutes = plant.step_minutes,
        horizon_steps = cfg.controller.horizon_steps,
        price_source = %cfg.forecast.price_source,
        "starting Intelligent Flow Controller"
    );

    let shutdown = telemetry::shutdown_channel();

    let adapter = Arc::new(ForecastAdapter::new(chrono::Duration::hours(
        cfg.forecast.max_age_hours,
    )));
    let prices: Arc<dyn PriceForecaster> = match cfg.forecast.price_source {
        PriceSource::Nordpool => Arc::new(NordpoolPriceForecaster::new(
            cfg.forecast.nordpool_base_url.clone(),
            cfg.forecast.nordpool_area.clone(),
            std::time::Duration::from_secs(cfg.forecast.nordpool_cache_ttl_seconds),
        )?),
        PriceSource::Profile => Arc::new(DiurnalProfile::day_ahead_prices(
            cfg.forecast.profile_base_price,
        )),
    };
    let inflow_profile = DiurnalProfile::dry_weather_inflow(cfg.simulation.base_inflow_m3h);
    let inflow: Arc<dyn InflowForecaster> = Arc::new(inflow_profile.clone());
    let refresher = Arc::new(ForecastRefresher::new(
        cfg.refresh_config(),
        Arc::clone(&adapter),
        prices,
        inflow,
    ));
    refresher.start(shutdown.clone());

    #[cfg(feature = "sim")]
    let (sensors, actuator): (Arc<dyn Sensors>, Arc<dyn Actuator>) = {
        let mut sim = hardware::SimulatedPlant::new(
            Arc::clone(&plant),
            inflow_profile,
            cfg.simulation.initial_level_m,
            controller::quarter_hour_floor(Utc::now()),
        );
        sim.level_noise_m = cfg.simulation.level_noise_m;
        let sim = Arc::new(sim);
        spawn_simulation(Arc::clone(&sim), plant.step_minutes, shutdown.clone());
        info!(level_m = cfg.simulation.initial_level_m, "running against the simulated plant");
        let sensors: Arc<dyn Sensors> = sim.clone();
        let actuator: Arc<dyn Actuator> = sim;
        (sensors, actuator)
    };
    #[cfg(not(feature = "sim"))]
    let (sensors, actuator): (Arc<dyn Sensors>, Arc<dyn Actuator>) =
        anyhow::bail!("no station drivers in this build; enable the `sim` feature");

    let store = cfg
        .persistence
        .state_file
        .clone()
        .map(|path| Arc::new(StateStore::new(path)));
    let initial = match &store {
        Some(store) => match store.load().await {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "starting from a fresh controller state");
                ControllerState::default()
            }
        },
        None => ControllerState::default(),
    };

    let builder = ProblemBuilder::new(Arc::clone(&plant))
        .with_switch_penalty(cfg.solver.switch_penalty)
        .with_terminal_level_max(cfg.controller.terminal_level_max_m);
    let optimizer: Arc<dyn ScheduleOptimizer> =
        Arc::new(CombinatorialSolver::new(cfg.solver_options()));
    let controller = Arc::new(MpcController::new(
        builder,
        optimizer,
        adapter,
        sensors,
        actuator,
        cfg.controller_settings(),
    ));

    let control = ControlLoop::new(controller, store.clone());
    let final_state = control.run(initial, shutdown).await?;
    if let Some(store) = store {
        store.save(&final_state).await?;
    }

    info!("shutdown complete");
    Ok(())
}

/// Advance the simulated tank once per control step
#[cfg(feature = "sim")]
fn spawn_simulation(
    sim: Arc<hardware::SimulatedPlant>,
    step_minutes: u32,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

    tokio::spawn(async move {
        let now = Utc::now();
        let first = controller::next_boundary(now, step_minutes);
        let delay = (first - now).to_std().unwrap_or_default();
        let period = Duration::from_secs(step_minutes as u64 * 60);
        let mut ticker = interval_at(Instant::now() + delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => sim.advance().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
