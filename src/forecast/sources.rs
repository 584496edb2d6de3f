use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::ForecastSeries;

/// Producer of day-ahead electricity prices (currency/kWh)
#[async_trait]
pub trait PriceForecaster: Send + Sync {
    /// Prices covering at least the day containing `from`
    async fn fetch_prices(&self, from: DateTime<Utc>) -> Result<ForecastSeries>;
}

/// Producer of tunnel inflow forecasts (m³/h)
#[async_trait]
pub trait InflowForecaster: Send + Sync {
    async fn forecast_inflow(&self, from: DateTime<Utc>, n_steps: usize) -> Result<ForecastSeries>;
}
