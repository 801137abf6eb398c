use serde::{Deserialize, Serialize};

/// A WGS84 coordinate pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: f64,
}

impl Position {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// `true` when both axes differ from `other` by less than `epsilon`.
    pub fn within(&self, other: &Self, epsilon: f64) -> bool {
        (self.latitude - other.latitude).abs() < epsilon
            && (self.longitude - other.longitude).abs() < epsilon
    }

    /// Move `factor` of the way toward `target` on both axes.
    pub fn step_toward(&self, target: &Self, factor: f64) -> Self {
        Self {
            latitude: self.latitude + (target.latitude - self.latitude) * factor,
            longitude: self.longitude + (target.longitude - self.longitude) * factor,
        }
    }
}
