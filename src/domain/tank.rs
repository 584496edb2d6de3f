use serde::{Deserialize, Serialize};

/// Tunnel storage seen by the pumping station as a prismatic tank
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tank {
    /// Cross-sectional area (m²)
    pub area_m2: f64,
    /// Hard lower level bound (m)
    pub min_level_m: f64,
    /// Hard upper level bound (m)
    pub max_level_m: f64,
}

impl Default for Tank {
    fn default() -> Self {
        Self {
            area_m2: 10_000.0,
            min_level_m: 0.5,
            max_level_m: 8.0,
        }
    }
}

impl Tank {
    pub fn contains(&self, level_m: f64, tolerance: f64) -> bool {
        level_m >= self.min_level_m - tolerance && level_m <= self.max_level_m + tolerance
    }

    /// Stored volume between the lower bound and `level_m`
    pub fn usable_volume_m3(&self, level_m: f64) -> f64 {
        (level_m - self.min_level_m).max(0.0) * self.area_m2
    }
}
