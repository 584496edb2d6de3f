//! Forecast Adapter
//!
//! Latest-series store for externally produced price and inflow forecasts.
//! Refresh tasks publish whole series; the controller asks for slices aligned
//! to its horizon grid and gets a value it owns.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{ForecastKind, ForecastSeries, ForecastSnapshot};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForecastError {
    #[error("{kind} forecast unavailable: {reason}")]
    Unavailable { kind: ForecastKind, reason: String },
}

impl ForecastError {
    fn unavailable(kind: ForecastKind, reason: impl Into<String>) -> Self {
        ForecastError::Unavailable {
            kind,
            reason: reason.into(),
        }
    }
}

/// One series re-sliced onto the horizon grid
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSeries {
    pub values: Vec<f64>,
    /// Trailing steps filled by holding the last published value
    pub extrapolated_steps: usize,
    pub issued_at: DateTime<Utc>,
}

pub struct ForecastAdapter {
    prices: RwLock<Option<Arc<ForecastSeries>>>,
    inflow: RwLock<Option<Arc<ForecastSeries>>>,
    /// Series issued longer ago than this count as unavailable
    max_age: Duration,
}

impl ForecastAdapter {
    pub fn new(max_age: Duration) -> Self {
        Self {
            prices: RwLock::new(None),
            inflow: RwLock::new(None),
            max_age,
        }
    }

    fn slot(&self, kind: ForecastKind) -> &RwLock<Option<Arc<ForecastSeries>>> {
        match kind {
            ForecastKind::Price => &self.prices,
            ForecastKind::Inflow => &self.inflow,
        }
    }

    /// Replace the latest series of its kind
    pub fn publish(&self, series: ForecastSeries) {
        debug!(
            kind = %series.kind,
            start = %series.start,
            points = series.values.len(),
            resolution_minutes = series.resolution_minutes,
            "forecast published"
        );
        let kind = series.kind;
        *self.slot(kind).write() = Some(Arc::new(series));
    }

    pub fn latest(&self, kind: ForecastKind) -> Option<Arc<ForecastSeries>> {
        self.slot(kind).read().clone()
    }

    pub fn get_price_forecast(
        &self,
        horizon_start: DateTime<Utc>,
        n_steps: usize,
        resolution_minutes: u32,
    ) -> Result<AlignedSeries, ForecastError> {
        self.aligned(ForecastKind::Price, horizon_start, n_steps, resolution_minutes)
    }

    pub fn get_inflow_forecast(
        &self,
        horizon_start: DateTime<Utc>,
        n_steps: usize,
        resolution_minutes: u32,
    ) -> Result<AlignedSeries, ForecastError> {
        self.aligned(ForecastKind::Inflow, horizon_start, n_steps, resolution_minutes)
    }

    /// Both series on one grid, as consumed by a control cycle
    pub fn snapshot(
        &self,
        horizon_start: DateTime<Utc>,
        n_steps: usize,
        step_minutes: u32,
    ) -> Result<ForecastSnapshot, ForecastError> {
        let prices = self.get_price_forecast(horizon_start, n_steps, step_minutes)?;
        let inflow = self.get_inflow_forecast(horizon_start, n_steps, step_minutes)?;
        Ok(ForecastSnapshot {
            horizon_start,
            step_minutes,
            prices: prices.values,
            inflow_m3h: inflow.values,
            stale: false,
            extrapolated_steps: prices.extrapolated_steps.max(inflow.extrapolated_steps),
            issued_at: prices.issued_at.min(inflow.issued_at),
        })
    }

    fn aligned(
        &self,
        kind: ForecastKind,
        horizon_start: DateTime<Utc>,
        n_steps: usize,
        resolution_minutes: u32,
    ) -> Result<AlignedSeries, ForecastError> {
        let series = self
            .latest(kind)
            .ok_or_else(|| ForecastError::unavailable(kind, "nothing published"))?;
        if resolution_minutes == 0 || series.resolution_minutes == 0 {
            return Err(ForecastError::unavailable(kind, "zero resolution"));
        }
        let age = horizon_start - series.issued_at;
        if age > self.max_age {
            return Err(ForecastError::unavailable(
                kind,
                format!("issued {} min before horizon start", age.num_minutes()),
            ));
        }
        if series.value_at(horizon_start).is_none() {
            return Err(ForecastError::unavailable(
                kind,
                format!("series does not cover {horizon_start}"),
            ));
        }

        let aligned = resample(&series, horizon_start, n_steps, resolution_minutes);
        if aligned.extrapolated_steps > 0 {
            warn!(
                kind = %kind,
                extrapolated_steps = aligned.extrapolated_steps,
                series_end = %series.end(),
                "forecast shorter than horizon, holding last value"
            );
        }
        Ok(aligned)
    }
}

/// Re-slice `series` onto `n_steps` steps of `resolution_minutes`.
///
/// A step takes the mean of the source values starting inside it (finer
/// source) or else the value in force at its start (coarser source). Steps
/// past the end of the series hold the last value produced.
fn resample(
    series: &ForecastSeries,
    horizon_start: DateTime<Utc>,
    n_steps: usize,
    resolution_minutes: u32,
) -> AlignedSeries {
    let step = Duration::minutes(resolution_minutes as i64);
    let src_step = series.resolution();
    let mut values = Vec::with_capacity(n_steps);
    let mut extrapolated_steps = 0;
    let mut last = series.values.first().copied().unwrap_or(0.0);

    for i in 0..n_steps {
        let t0 = horizon_start + step * i as i32;
        let t1 = t0 + step;
        let inside: Vec<f64> = series
            .values
            .iter()
            .enumerate()
            .filter(|(j, _)| {
                let s = series.start + src_step * *j as i32;
                s >= t0 && s < t1
            })
            .map(|(_, v)| *v)
            .collect();
        let value = if src_step < step && !inside.is_empty() {
            Some(inside.iter().sum::<f64>() / inside.len() as f64)
        } else {
            series.value_at(t0)
        };
        match value {
            Some(v) => {
                last = v;
                values.push(v);
            }
            None => {
                extrapolated_steps += 1;
                values.push(last);
            }
        }
    }

    AlignedSeries {
        values,
        extrapolated_steps,
        issued_at: series.issued_at,
    }
}
