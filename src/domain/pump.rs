use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Pump configuration errors
#[derive(Debug, Error, PartialEq)]
pub enum PumpError {
    #[error("pump {0}: power curve needs at least one point")]
    EmptyCurve(PumpId),
    #[error("pump {0}: minimum flow must be positive, got {1} m³/h")]
    NonPositiveMinFlow(PumpId, f64),
    #[error("pump {0}: curve flows must be strictly increasing")]
    FlowsNotIncreasing(PumpId),
    #[error("pump {0}: power must be non-negative and nondecreasing in flow")]
    PowerNotMonotonic(PumpId),
    #[error("pump {0}: power curve must be convex (segment slopes nondecreasing)")]
    NotConvex(PumpId),
    #[error("pump {0}: non-finite value in power curve")]
    NonFinite(PumpId),
}

/// Pump identity (1-based, as labelled at the pumping station)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PumpId(pub u8);

impl fmt::Display for PumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// One operating point of a pump power curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub flow_m3h: f64,
    pub power_kw: f64,
}

/// Power draw as a function of delivered flow while the pump runs.
///
/// The first point is the minimum flow of a running pump, the last one its
/// capacity. Between points power is interpolated linearly. A stopped pump
/// (f = 0) draws nothing, so the curve as a whole is monotonic and zero at
/// zero flow, with a jump at the minimum flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerCurve {
    pub points: Vec<CurvePoint>,
}

/// Linear piece of a power curve above the minimum flow
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveSegment {
    pub length_m3h: f64,
    /// kW per m³/h
    pub slope: f64,
}

impl PowerCurve {
    /// Affine curve `standby + k·f` over `[min_flow, max_flow]`
    pub fn affine(min_flow_m3h: f64, max_flow_m3h: f64, standby_kw: f64, kw_per_m3h: f64) -> Self {
        let mut points = vec![CurvePoint {
            flow_m3h: min_flow_m3h,
            power_kw: standby_kw + kw_per_m3h * min_flow_m3h,
        }];
        if max_flow_m3h > min_flow_m3h {
            points.push(CurvePoint {
                flow_m3h: max_flow_m3h,
                power_kw: standby_kw + kw_per_m3h * max_flow_m3h,
            });
        }
        Self { points }
    }

    /// Piecewise-linear curve from `(flow m³/h, power kW)` pairs
    pub fn piecewise(points: &[(f64, f64)]) -> Self {
        Self {
            points: points
                .iter()
                .map(|&(flow_m3h, power_kw)| CurvePoint { flow_m3h, power_kw })
                .collect(),
        }
    }

    pub fn min_flow(&self) -> f64 {
        self.points.first().map(|p| p.flow_m3h).unwrap_or(0.0)
    }

    pub fn max_flow(&self) -> f64 {
        self.points.last().map(|p| p.flow_m3h).unwrap_or(0.0)
    }

    /// Power at the minimum flow, i.e. the cheapest way to keep the pump running
    pub fn min_power_kw(&self) -> f64 {
        self.points.first().map(|p| p.power_kw).unwrap_or(0.0)
    }

    /// Power draw in kW at `flow_m3h`; zero for a stopped pump.
    ///
    /// Flows between zero and the minimum flow are charged at the minimum
    /// flow's power and flows above capacity at capacity power.
    pub fn power_kw(&self, flow_m3h: f64) -> f64 {
        if flow_m3h <= f64::EPSILON || self.points.is_empty() {
            return 0.0;
        }
        let first = self.points[0];
        if flow_m3h <= first.flow_m3h {
            return first.power_kw;
        }
        for w in self.points.windows(2) {
            let (a, b) = (w[0], w[1]);
            if flow_m3h <= b.flow_m3h {
                let frac = (flow_m3h - a.flow_m3h) / (b.flow_m3h - a.flow_m3h);
                return a.power_kw + frac * (b.power_kw - a.power_kw);
            }
        }
        self.points[self.points.len() - 1].power_kw
    }

    pub fn segments(&self) -> impl Iterator<Item = CurveSegment> + '_ {
        self.points.windows(2).map(|w| {
            let length_m3h = w[1].flow_m3h - w[0].flow_m3h;
            CurveSegment {
                length_m3h,
                slope: (w[1].power_kw - w[0].power_kw) / length_m3h,
            }
        })
    }

    /// Lowest energy per unit of flow (kW per m³/h) over the running range.
    ///
    /// On each linear piece `p(f)/f` is monotonic, so the minimum sits on a
    /// breakpoint.
    pub fn best_specific_energy(&self) -> f64 {
        self.points
            .iter()
            .filter(|p| p.flow_m3h > 0.0)
            .map(|p| p.power_kw / p.flow_m3h)
            .fold(f64::INFINITY, f64::min)
    }

    fn validate(&self, id: PumpId) -> Result<(), PumpError> {
        if self.points.is_empty() {
            return Err(PumpError::EmptyCurve(id));
        }
        if self
            .points
            .iter()
            .any(|p| !p.flow_m3h.is_finite() || !p.power_kw.is_finite())
        {
            return Err(PumpError::NonFinite(id));
        }
        if self.min_flow() <= 0.0 {
            return Err(PumpError::NonPositiveMinFlow(id, self.min_flow()));
        }
        if self.points[0].power_kw < 0.0 {
            return Err(PumpError::PowerNotMonotonic(id));
        }
        let mut last_slope = f64::NEG_INFINITY;
        for w in self.points.windows(2) {
            if w[1].flow_m3h <= w[0].flow_m3h {
                return Err(PumpError::FlowsNotIncreasing(id));
            }
            if w[1].power_kw < w[0].power_kw {
                return Err(PumpError::PowerNotMonotonic(id));
            }
            let slope = (w[1].power_kw - w[0].power_kw) / (w[1].flow_m3h - w[0].flow_m3h);
            if slope + 1e-9 < last_slope {
                return Err(PumpError::NotConvex(id));
            }
            last_slope = slope;
        }
        Ok(())
    }
}

/// Static pump configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pump {
    pub id: PumpId,
    pub curve: PowerCurve,
    /// Steps a pump must keep running after being started (0 = unconstrained)
    #[serde(default)]
    pub min_up_steps: u32,
    /// Steps a pump must stay stopped after being stopped (0 = unconstrained)
    #[serde(default)]
    pub min_down_steps: u32,
}

impl Pump {
    pub fn new(id: u8, curve: PowerCurve) -> Self {
        Self {
            id: PumpId(id),
            curve,
            min_up_steps: 0,
            min_down_steps: 0,
        }
    }

    pub fn with_min_times(mut self, min_up_steps: u32, min_down_steps: u32) -> Self {
        self.min_up_steps = min_up_steps;
        self.min_down_steps = min_down_steps;
        self
    }

    pub fn min_flow(&self) -> f64 {
        self.curve.min_flow()
    }

    pub fn max_flow(&self) -> f64 {
        self.curve.max_flow()
    }

    pub fn power_kw(&self, flow_m3h: f64) -> f64 {
        self.curve.power_kw(flow_m3h)
    }

    pub fn validate(&self) -> Result<(), PumpError> {
        self.curve.validate(self.id)
    }
}

/// Runtime status of one pump as known to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpStatus {
    pub running: bool,
    /// Control steps the pump has spent in its current state
    pub steps_in_state: u32,
}

impl PumpStatus {
    pub fn stopped() -> Self {
        Self {
            running: false,
            steps_in_state: u32::MAX,
        }
    }

    /// Status after one more step with the given command
    pub fn advance(self, running: bool) -> Self {
        if running == self.running {
            Self {
                running,
                steps_in_state: self.steps_in_state.saturating_add(1),
            }
        } else {
            Self {
                running,
                steps_in_state: 1,
            }
        }
    }
}

impl Default for PumpStatus {
    fn default() -> Self {
        Self::stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_power_is_zero_when_stopped() {
        let curve = PowerCurve::affine(20.0, 100.0, 5.0, 0.2);
        assert_eq!(curve.power_kw(0.0), 0.0);
        assert!((curve.power_kw(20.0) - 9.0).abs() < 1e-9);
        assert!((curve.power_kw(100.0) - 25.0).abs() < 1e-9);
        assert!((curve.power_kw(60.0) - 17.0).abs() < 1e-9);
    }

    #[test]
    fn test_power_is_monotonic() {
        let curve = PowerCurve::piecewise(&[(10.0, 4.0), (50.0, 10.0), (80.0, 20.0)]);
        let mut last = 0.0;
        for i in 0..=100 {
            let p = curve.power_kw(i as f64);
            assert!(p >= last);
            last = p;
        }
    }

    #[test]
    fn test_best_specific_energy_on_breakpoint() {
        let curve = PowerCurve::affine(20.0, 100.0, 5.0, 0.2);
        // 25 kW / 100 m³/h beats 9 kW / 20 m³/h
        assert!((curve.best_specific_energy() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_non_convex_curve() {
        let pump = Pump::new(1, PowerCurve::piecewise(&[(10.0, 4.0), (50.0, 20.0), (80.0, 22.0)]));
        assert_eq!(pump.validate(), Err(PumpError::NotConvex(PumpId(1))));
    }

    #[test]
    fn test_rejects_zero_min_flow() {
        let pump = Pump::new(2, PowerCurve::affine(0.0, 100.0, 5.0, 0.2));
        assert!(matches!(pump.validate(), Err(PumpError::NonPositiveMinFlow(_, _))));
    }

    #[test]
    fn test_status_advance_counts_steps() {
        let s = PumpStatus { running: true, steps_in_state: 3 };
        assert_eq!(s.advance(true).steps_in_state, 4);
        let switched = s.advance(false);
        assert!(!switched.running);
        assert_eq!(switched.steps_in_state, 1);
    }
}
