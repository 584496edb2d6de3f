//! Deterministic diurnal profiles for simulation and demo runs

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::{InflowForecaster, PriceForecaster};
use crate::domain::{ForecastKind, ForecastSeries};

/// Gaussian bump centred on `hour` (UTC) with the given width in hours
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub hour: f64,
    pub width_h: f64,
    pub amplitude: f64,
}

impl Peak {
    fn at(&self, hour: f64) -> f64 {
        // shortest distance on the 24 h circle
        let d = (hour - self.hour).rem_euclid(24.0);
        let d = d.min(24.0 - d);
        self.amplitude * (-0.5 * (d / self.width_h).powi(2)).exp()
    }
}

/// Base level plus daily peaks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiurnalProfile {
    pub base: f64,
    pub peaks: Vec<Peak>,
    pub resolution_minutes: u32,
}

impl DiurnalProfile {
    /// Dry-weather sewage inflow: morning and evening peaks (m³/h)
    pub fn dry_weather_inflow(base_m3h: f64) -> Self {
        Self {
            base: base_m3h,
            peaks: vec![
                Peak {
                    hour: 7.5,
                    width_h: 1.5,
                    amplitude: 0.6 * base_m3h,
                },
                Peak {
                    hour: 19.0,
                    width_h: 2.0,
                    amplitude: 0.4 * base_m3h,
                },
            ],
            resolution_minutes: 15,
        }
    }

    /// Day-ahead price shape: cheap nights, expensive day (currency/kWh)
    pub fn day_ahead_prices(base: f64) -> Self {
        Self {
            base,
            peaks: vec![
                Peak {
                    hour: 8.0,
                    width_h: 2.0,
                    amplitude: 1.5 * base,
                },
                Peak {
                    hour: 18.0,
                    width_h: 2.5,
                    amplitude: 2.0 * base,
                },
            ],
            resolution_minutes: 15,
        }
    }

    pub fn value_at(&self, t: DateTime<Utc>) -> f64 {
        let hour = t.hour() as f64 + t.minute() as f64 / 60.0;
        self.base + self.peaks.iter().map(|p| p.at(hour)).sum::<f64>()
    }

    pub fn series(
        &self,
        kind: ForecastKind,
        from: DateTime<Utc>,
        n_steps: usize,
    ) -> ForecastSeries {
        let step = Duration::minutes(self.resolution_minutes as i64);
        let values = (0..n_steps)
            .map(|i| self.value_at(from + step * i as i32))
            .collect();
        ForecastSeries::new(kind, from, self.resolution_minutes, values, Utc::now())
    }
}

#[async_trait]
impl InflowForecaster for DiurnalProfile {
    async fn forecast_inflow(&self, from: DateTime<Utc>, n_steps: usize) -> Result<ForecastSeries> {
        Ok(self.series(ForecastKind::Inflow, from, n_steps))
    }
}

#[async_trait]
impl PriceForecaster for DiurnalProfile {
    async fn fetch_prices(&self, from: DateTime<Utc>) -> Result<ForecastSeries> {
        // two days so the series always reaches past the horizon
        let steps = (48 * 60 / self.resolution_minutes.max(1)) as usize;
        Ok(self.series(ForecastKind::Price, from, steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_inflow_peaks_in_the_morning() {
        let p = DiurnalProfile::dry_weather_inflow(100.0);
        let night = p.value_at(Utc.with_ymd_and_hms(2024, 11, 15, 3, 0, 0).unwrap());
        let morning = p.value_at(Utc.with_ymd_and_hms(2024, 11, 15, 7, 30, 0).unwrap());
        assert!(morning > 150.0);
        assert!(night < 105.0);
    }

    #[test]
    fn test_peak_wraps_around_midnight() {
        let peak = Peak {
            hour: 23.5,
            width_h: 1.0,
            amplitude: 1.0,
        };
        assert!((peak.at(0.5) - peak.at(22.5)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_price_profile_covers_two_days() {
        let p = DiurnalProfile::day_ahead_prices(0.05);
        let from = Utc.with_ymd_and_hms(2024, 11, 15, 0, 0, 0).unwrap();
        let s = p.fetch_prices(from).await.unwrap();
        assert_eq!(s.values.len(), 192);
        assert!(s.values.iter().all(|v| *v >= 0.05));
    }
}
