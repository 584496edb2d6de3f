use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which external curve a series carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ForecastKind {
    /// currency/kWh
    Price,
    /// m³/h
    Inflow,
}

/// Externally produced forecast at a fixed resolution.
///
/// Value `i` holds over `[start + i·resolution, start + (i+1)·resolution)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSeries {
    pub kind: ForecastKind,
    pub start: DateTime<Utc>,
    pub resolution_minutes: u32,
    pub values: Vec<f64>,
    /// When the producer published this series
    pub issued_at: DateTime<Utc>,
}

impl ForecastSeries {
    pub fn new(
        kind: ForecastKind,
        start: DateTime<Utc>,
        resolution_minutes: u32,
        values: Vec<f64>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            start,
            resolution_minutes,
            values,
            issued_at,
        }
    }

    /// Inflow given as volume per interval (e.g. m³ per 15 min, as the plant
    /// historian reports it), converted to m³/h.
    pub fn inflow_from_volumes(
        start: DateTime<Utc>,
        resolution_minutes: u32,
        volumes_m3: &[f64],
        issued_at: DateTime<Utc>,
    ) -> Self {
        let per_hour = 60.0 / resolution_minutes.max(1) as f64;
        Self::new(
            ForecastKind::Inflow,
            start,
            resolution_minutes,
            volumes_m3.iter().map(|v| v * per_hour).collect(),
            issued_at,
        )
    }

    pub fn resolution(&self) -> Duration {
        Duration::minutes(self.resolution_minutes as i64)
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.resolution() * self.values.len() as i32
    }

    /// Value in force at `t`, if the series covers it
    pub fn value_at(&self, t: DateTime<Utc>) -> Option<f64> {
        if t < self.start || self.resolution_minutes == 0 {
            return None;
        }
        let idx = (t - self.start).num_seconds() / (self.resolution_minutes as i64 * 60);
        self.values.get(idx as usize).copied()
    }
}

/// Price and inflow aligned to the controller's horizon grid.
///
/// Handed out by value to one control cycle; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    pub horizon_start: DateTime<Utc>,
    pub step_minutes: u32,
    pub prices: Vec<f64>,
    pub inflow_m3h: Vec<f64>,
    /// Reused from an earlier cycle because the adapter had nothing recent
    pub stale: bool,
    /// Trailing steps filled by holding the last published value
    pub extrapolated_steps: usize,
    /// Oldest `issued_at` of the two underlying series
    pub issued_at: DateTime<Utc>,
}

impl ForecastSnapshot {
    pub fn len(&self) -> usize {
        self.prices.len().min(self.inflow_m3h.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-slice onto a later horizon start, holding the last values to keep
    /// `n_steps` entries. Returns `None` if `new_start` precedes the snapshot
    /// or the snapshot no longer reaches it.
    pub fn shifted(&self, new_start: DateTime<Utc>, n_steps: usize) -> Option<Self> {
        if new_start < self.horizon_start || self.step_minutes == 0 {
            return None;
        }
        let offset = ((new_start - self.horizon_start).num_seconds()
            / (self.step_minutes as i64 * 60)) as usize;
        if offset >= self.len() {
            return None;
        }
        let slice = |v: &[f64]| -> (Vec<f64>, usize) {
            let mut out: Vec<f64> = v.iter().skip(offset).take(n_steps).copied().collect();
            let padded = n_steps.saturating_sub(out.len());
            let last = out.last().copied().unwrap_or(0.0);
            out.resize(n_steps, last);
            (out, padded)
        };
        let (prices, padded_p) = slice(&self.prices);
        let (inflow_m3h, padded_i) = slice(&self.inflow_m3h);
        Some(Self {
            horizon_start: self.horizon_start
                + Duration::minutes(self.step_minutes as i64 * offset as i64),
            step_minutes: self.step_minutes,
            prices,
            inflow_m3h,
            stale: self.stale,
            extrapolated_steps: padded_p.max(padded_i),
            issued_at: self.issued_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 15, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_value_at_holds_over_interval() {
        let s = ForecastSeries::new(ForecastKind::Price, t0(), 60, vec![1.0, 2.0], t0());
        assert_eq!(s.value_at(t0()), Some(1.0));
        assert_eq!(s.value_at(t0() + Duration::minutes(45)), Some(1.0));
        assert_eq!(s.value_at(t0() + Duration::minutes(60)), Some(2.0));
        assert_eq!(s.value_at(t0() + Duration::minutes(120)), None);
        assert_eq!(s.value_at(t0() - Duration::minutes(1)), None);
    }

    #[test]
    fn test_inflow_from_volumes_scales_to_hourly() {
        let s = ForecastSeries::inflow_from_volumes(t0(), 15, &[2.0, 3.0], t0());
        assert_eq!(s.values, vec![8.0, 12.0]);
        assert_eq!(s.kind, ForecastKind::Inflow);
    }

    #[test]
    fn test_shifted_pads_with_last_value() {
        let snap = ForecastSnapshot {
            horizon_start: t0(),
            step_minutes: 15,
            prices: vec![1.0, 2.0, 3.0, 4.0],
            inflow_m3h: vec![10.0, 20.0, 30.0, 40.0],
            stale: false,
            extrapolated_steps: 0,
            issued_at: t0(),
        };
        let shifted = snap.shifted(t0() + Duration::minutes(30), 4).unwrap();
        assert_eq!(shifted.prices, vec![3.0, 4.0, 4.0, 4.0]);
        assert_eq!(shifted.inflow_m3h, vec![30.0, 40.0, 40.0, 40.0]);
        assert_eq!(shifted.extrapolated_steps, 2);
        assert_eq!(shifted.horizon_start, t0() + Duration::minutes(30));
        assert!(snap.shifted(t0() + Duration::minutes(60), 4).is_none());
    }
}
