//! Engine configuration.

use crate::actions::{AreaOfEffect, AreaShape};
use crate::dice::DiceLimits;
use crate::geometry::{AreaTemplate, Grid};
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tunables for grid geometry, ranges and dice limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of one grid square in map pixels.
    pub cell_size: f64,

    /// Feet represented by one grid square.
    pub feet_per_cell: u32,

    /// Total cone angle used when an action does not give one.
    pub cone_angle_degrees: f64,

    /// Line width used when an action does not give one.
    pub line_width_feet: u32,

    /// Slack, in cells, allowed on range checks between token centres.
    pub range_tolerance_cells: f64,

    pub dice_limits: DiceLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cell_size: 50.0,
            feet_per_cell: 5,
            cone_angle_degrees: 60.0,
            line_width_feet: 5,
            range_tolerance_cells: 0.5,
            dice_limits: DiceLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from JSON; missing fields take their defaults. A cell size that
    /// is not a positive number is rejected.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Self = serde_json::from_str(json)?;
        if !valid_cell_size(config.cell_size) {
            return Err(serde_json::Error::custom(format!(
                "cell_size must be positive, got {}",
                config.cell_size
            )));
        }
        Ok(config)
    }

    /// Non-positive sizes are ignored and the current size kept.
    pub fn with_cell_size(mut self, cell_size: f64) -> Self {
        if valid_cell_size(cell_size) {
            self.cell_size = cell_size;
        } else {
            warn!(cell_size, "ignoring non-positive cell size");
        }
        self
    }

    pub fn with_feet_per_cell(mut self, feet: u32) -> Self {
        self.feet_per_cell = feet.max(1);
        self
    }

    pub fn with_cone_angle(mut self, degrees: f64) -> Self {
        self.cone_angle_degrees = degrees;
        self
    }

    pub fn with_range_tolerance(mut self, cells: f64) -> Self {
        self.range_tolerance_cells = cells;
        self
    }

    pub fn with_dice_limits(mut self, limits: DiceLimits) -> Self {
        self.dice_limits = limits;
        self
    }

    pub fn grid(&self) -> Grid {
        Grid::new(self.cell_size)
    }

    pub fn feet_to_pixels(&self, feet: u32) -> f64 {
        feet as f64 / self.feet_per_cell.max(1) as f64 * self.cell_size
    }

    pub fn pixels_to_feet(&self, pixels: f64) -> f64 {
        pixels / self.cell_size * self.feet_per_cell.max(1) as f64
    }

    /// Convert an action's area into pixel geometry.
    pub fn area_template(&self, area: &AreaOfEffect) -> AreaTemplate {
        let size = self.feet_to_pixels(area.size);
        match area.shape {
            AreaShape::Sphere | AreaShape::Cube | AreaShape::Cylinder => {
                AreaTemplate::Radius { radius: size }
            }
            AreaShape::Cone => AreaTemplate::Cone {
                length: size,
                angle_degrees: area.angle.unwrap_or(self.cone_angle_degrees),
            },
            AreaShape::Line => AreaTemplate::Line {
                length: size,
                width: self.feet_to_pixels(area.size_y.unwrap_or(self.line_width_feet)),
            },
        }
    }
}

fn valid_cell_size(cell_size: f64) -> bool {
    cell_size.is_finite() && cell_size > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.feet_to_pixels(30), 300.0);
        assert_eq!(config.pixels_to_feet(100.0), 10.0);
        assert_eq!(config.dice_limits.max_terms, 20);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = EngineConfig::from_json(r#"{"cell_size": 70.0}"#).unwrap();
        assert_eq!(config.cell_size, 70.0);
        assert_eq!(config.feet_per_cell, 5);
        assert_eq!(config.cone_angle_degrees, 60.0);
    }

    #[test]
    fn test_non_positive_cell_size_rejected() {
        assert!(EngineConfig::from_json(r#"{"cell_size": 0.0}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"cell_size": -50.0}"#).is_err());

        let config = EngineConfig::new().with_cell_size(0.0).with_cell_size(-10.0);
        assert_eq!(config.cell_size, 50.0);
        assert_eq!(config.with_cell_size(70.0).cell_size, 70.0);
    }

    #[test]
    fn test_area_template() {
        let config = EngineConfig::default();
        let cone = AreaOfEffect::new(AreaShape::Cone, 15);
        assert_eq!(
            config.area_template(&cone),
            AreaTemplate::Cone {
                length: 150.0,
                angle_degrees: 60.0
            }
        );
        let mut line = AreaOfEffect::new(AreaShape::Line, 100);
        line.size_y = Some(10);
        assert_eq!(
            config.area_template(&line),
            AreaTemplate::Line {
                length: 1000.0,
                width: 100.0
            }
        );
        let cube = AreaOfEffect::new(AreaShape::Cube, 15);
        assert_eq!(
            config.area_template(&cube),
            AreaTemplate::Radius { radius: 150.0 }
        );
    }
}
