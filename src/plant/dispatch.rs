use ordered_float::OrderedFloat;

use super::Combo;
use crate::domain::Pump;

/// Linear piece of a combination's dispatch curve, owned by one pump
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSegment {
    /// Index of the pump in the plant's pump list
    pub pump: usize,
    pub length_m3h: f64,
    /// kW per m³/h
    pub slope: f64,
}

/// Cheapest total power for delivering a total flow with a fixed set of
/// running pumps (merit-order dispatch).
///
/// Every running pump delivers at least its minimum flow; extra flow is taken
/// from the cheapest remaining curve segments first. With convex pump curves
/// this is the exact minimum and the resulting curve is convex in the total
/// flow.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCurve {
    pub combo: Combo,
    pub min_flow_m3h: f64,
    pub max_flow_m3h: f64,
    /// Power with every running pump at its minimum flow
    pub base_power_kw: f64,
    /// Sorted by ascending slope, ties by pump index
    pub segments: Vec<DispatchSegment>,
    /// Smallest marginal power of any segment; 0.0 without segments
    pub min_slope: f64,
}

impl DispatchCurve {
    pub fn new(combo: Combo, pumps: &[Pump]) -> Self {
        let mut min_flow_m3h = 0.0;
        let mut max_flow_m3h = 0.0;
        let mut base_power_kw = 0.0;
        let mut segments = Vec::new();
        for idx in combo.indices() {
            let pump = &pumps[idx];
            min_flow_m3h += pump.min_flow();
            max_flow_m3h += pump.max_flow();
            base_power_kw += pump.curve.min_power_kw();
            segments.extend(pump.curve.segments().map(|s| DispatchSegment {
                pump: idx,
                length_m3h: s.length_m3h,
                slope: s.slope,
            }));
        }
        segments.sort_by_key(|s| (OrderedFloat(s.slope), s.pump));
        let min_slope = segments.first().map(|s| s.slope).unwrap_or(0.0);
        Self {
            combo,
            min_flow_m3h,
            max_flow_m3h,
            base_power_kw,
            segments,
            min_slope,
        }
    }

    pub fn contains(&self, flow_m3h: f64, tolerance: f64) -> bool {
        flow_m3h >= self.min_flow_m3h - tolerance && flow_m3h <= self.max_flow_m3h + tolerance
    }

    /// Minimum total power for `flow_m3h`, clamped to the combination's range
    pub fn power_kw(&self, flow_m3h: f64) -> f64 {
        let mut remaining = (flow_m3h - self.min_flow_m3h).max(0.0);
        let mut power = self.base_power_kw;
        for seg in &self.segments {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(seg.length_m3h);
            power += take * seg.slope;
            remaining -= take;
        }
        power
    }

    /// Per-pump flows `(pump index, m³/h)` realizing [`Self::power_kw`]
    pub fn allocate(&self, flow_m3h: f64, pumps: &[Pump]) -> Vec<(usize, f64)> {
        let mut flows: Vec<(usize, f64)> = self
            .combo
            .indices()
            .map(|idx| (idx, pumps[idx].min_flow()))
            .collect();
        let mut remaining = (flow_m3h - self.min_flow_m3h).max(0.0);
        for seg in &self.segments {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(seg.length_m3h);
            if let Some(entry) = flows.iter_mut().find(|(idx, _)| *idx == seg.pump) {
                entry.1 += take;
            }
            remaining -= take;
        }
        flows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PowerCurve;

    fn pumps() -> Vec<Pump> {
        vec![
            Pump::new(1, PowerCurve::affine(20.0, 100.0, 5.0, 0.30)),
            Pump::new(2, PowerCurve::affine(10.0, 60.0, 2.0, 0.20)),
        ]
    }

    #[test]
    fn test_empty_combo_is_all_zero() {
        let curve = DispatchCurve::new(Combo::EMPTY, &pumps());
        assert_eq!(curve.min_flow_m3h, 0.0);
        assert_eq!(curve.max_flow_m3h, 0.0);
        assert_eq!(curve.power_kw(0.0), 0.0);
        assert!(curve.allocate(0.0, &pumps()).is_empty());
    }

    #[test]
    fn test_merit_order_fills_cheapest_segment_first() {
        let pumps = pumps();
        let curve = DispatchCurve::new(Combo::from_indices([0, 1]), &pumps);
        assert_eq!(curve.min_flow_m3h, 30.0);
        assert_eq!(curve.max_flow_m3h, 160.0);
        // base: 5 + 6 + 2 + 2 = 15 kW
        assert!((curve.base_power_kw - 15.0).abs() < 1e-9);
        // 40 extra m³/h all on pump 2 (slope 0.2)
        assert!((curve.power_kw(70.0) - 23.0).abs() < 1e-9);
        let flows = curve.allocate(70.0, &pumps);
        assert_eq!(flows.len(), 2);
        assert!((flows[0].1 - 20.0).abs() < 1e-9);
        assert!((flows[1].1 - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_power_matches_sum_of_pump_powers() {
        let pumps = pumps();
        let curve = DispatchCurve::new(Combo::from_indices([0, 1]), &pumps);
        for q in [30.0, 55.0, 90.0, 160.0] {
            let direct: f64 = curve
                .allocate(q, &pumps)
                .iter()
                .map(|(i, f)| pumps[*i].power_kw(*f))
                .sum();
            assert!((curve.power_kw(q) - direct).abs() < 1e-9);
        }
    }
}
