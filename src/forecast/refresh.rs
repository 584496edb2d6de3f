//! Periodic forecast refresh tasks.
//!
//! Each source gets its own loop writing into the adapter's latest-series
//! store; the control loop never waits on a forecast fetch.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use super::{ForecastAdapter, InflowForecaster, PriceForecaster};
use crate::controller::quarter_hour_floor;

/// Task status tracking
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskStatus {
    pub(crate) fn started(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.run_count += 1;
    }

    pub(crate) fn succeeded(&mut self, now: DateTime<Utc>) {
        self.last_success = Some(now);
        self.success_count += 1;
        self.last_error = None;
    }

    pub(crate) fn failed(&mut self, error: String) {
        self.error_count += 1;
        self.last_error = Some(error);
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub price_interval: Duration,
    pub inflow_interval: Duration,
    /// Inflow steps requested per refresh
    pub inflow_steps: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            price_interval: Duration::from_secs(24 * 3600),
            inflow_interval: Duration::from_secs(3600),
            inflow_steps: 192,
        }
    }
}

pub struct ForecastRefresher {
    config: RefreshConfig,
    adapter: Arc<ForecastAdapter>,
    prices: Arc<dyn PriceForecaster>,
    inflow: Arc<dyn InflowForecaster>,
    price_status: Arc<RwLock<TaskStatus>>,
    inflow_status: Arc<RwLock<TaskStatus>>,
}

impl ForecastRefresher {
    pub fn new(
        config: RefreshConfig,
        adapter: Arc<ForecastAdapter>,
        prices: Arc<dyn PriceForecaster>,
        inflow: Arc<dyn InflowForecaster>,
    ) -> Self {
        Self {
            config,
            adapter,
            prices,
            inflow,
            price_status: Arc::new(RwLock::new(TaskStatus::default())),
            inflow_status: Arc::new(RwLock::new(TaskStatus::default())),
        }
    }

    /// Spawn both refresh loops; they stop when `shutdown` flips to true
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let refresher = self.clone();
        let rx = shutdown.clone();
        tokio::spawn(async move {
            refresher.run_price_task(rx).await;
        });

        let refresher = self.clone();
        tokio::spawn(async move {
            refresher.run_inflow_task(shutdown).await;
        });

        info!(
            price_interval_s = self.config.price_interval.as_secs(),
            inflow_interval_s = self.config.inflow_interval.as_secs(),
            "forecast refresh tasks started"
        );
    }

    /// Fetch prices once and publish them
    pub async fn refresh_prices(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        self.price_status.write().await.started(now);
        let from = quarter_hour_floor(now);
        match self.prices.fetch_prices(from).await {
            Ok(series) => {
                self.adapter.publish(series);
                self.price_status.write().await.succeeded(now);
                Ok(())
            }
            Err(e) => {
                self.price_status.write().await.failed(e.to_string());
                warn!(error = %e, "price refresh failed");
                Err(e)
            }
        }
    }

    /// Fetch an inflow forecast once and publish it
    pub async fn refresh_inflow(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        self.inflow_status.write().await.started(now);
        let from = quarter_hour_floor(now);
        match self
            .inflow
            .forecast_inflow(from, self.config.inflow_steps)
            .await
        {
            Ok(series) => {
                self.adapter.publish(series);
                self.inflow_status.write().await.succeeded(now);
                Ok(())
            }
            Err(e) => {
                self.inflow_status.write().await.failed(e.to_string());
                warn!(error = %e, "inflow refresh failed");
                Err(e)
            }
        }
    }

    async fn run_price_task(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.price_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.refresh_prices().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_inflow_task(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.inflow_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.refresh_inflow().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn price_status(&self) -> TaskStatus {
        self.price_status.read().await.clone()
    }

    pub async fn inflow_status(&self) -> TaskStatus {
        self.inflow_status.read().await.clone()
    }
}
