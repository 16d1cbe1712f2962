//! Area-of-effect geometry on a square grid.
//!
//! Positions are in map pixels. Cell `(col, row)` covers
//! `[col * size, (col + 1) * size) x [row * size, (row + 1) * size)`.

use crate::world::{CombatantId, Token};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

const EPSILON: f64 = 1e-9;

/// A point on the map, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    fn offset_from(&self, origin: Point) -> (f64, f64) {
        (self.x - origin.x, self.y - origin.y)
    }
}

/// A grid square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub col: i32,
    pub row: i32,
}

impl Cell {
    pub fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }
}

/// Resolved area shape, sizes already converted to pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AreaTemplate {
    /// Sphere, cube and cylinder: every cell centre within `radius` of the origin.
    Radius { radius: f64 },
    Cone { length: f64, angle_degrees: f64 },
    Line { length: f64, width: f64 },
}

/// A uniform square grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub cell_size: f64,
}

impl Grid {
    pub fn new(cell_size: f64) -> Self {
        Self { cell_size }
    }

    pub fn cell_at(&self, point: Point) -> Cell {
        Cell::new(
            (point.x / self.cell_size).floor() as i32,
            (point.y / self.cell_size).floor() as i32,
        )
    }

    pub fn center(&self, cell: Cell) -> Point {
        Point::new(
            (cell.col as f64 + 0.5) * self.cell_size,
            (cell.row as f64 + 0.5) * self.cell_size,
        )
    }

    /// Centre followed by the four corners.
    pub fn sample_points(&self, cell: Cell) -> [Point; 5] {
        let left = cell.col as f64 * self.cell_size;
        let top = cell.row as f64 * self.cell_size;
        let right = left + self.cell_size;
        let bottom = top + self.cell_size;
        [
            self.center(cell),
            Point::new(left, top),
            Point::new(right, top),
            Point::new(left, bottom),
            Point::new(right, bottom),
        ]
    }

    /// Every cell that could hold a point within `reach` of `origin`.
    fn cells_around(&self, origin: Point, reach: f64) -> impl Iterator<Item = Cell> {
        let min = self.cell_at(Point::new(origin.x - reach, origin.y - reach));
        let max = self.cell_at(Point::new(origin.x + reach, origin.y + reach));
        (min.row..=max.row)
            .flat_map(move |row| (min.col..=max.col).map(move |col| Cell::new(col, row)))
    }

    /// Every cell whose centre lies within `radius` of `origin` (inclusive).
    pub fn reachable_cells(&self, origin: Point, radius: f64) -> BTreeSet<Cell> {
        if radius < 0.0 {
            return BTreeSet::new();
        }
        self.cells_around(origin, radius)
            .filter(|cell| self.center(*cell).distance_to(origin) <= radius + EPSILON)
            .collect()
    }

    /// Every cell with at least one sample point (centre or corner) inside the
    /// cone with apex `origin`, axis towards `aim`, total angle
    /// `angle_degrees` and radial `length`. Boundary cells are over-included.
    pub fn cells_in_cone(
        &self,
        origin: Point,
        aim: Point,
        length: f64,
        angle_degrees: f64,
    ) -> BTreeSet<Cell> {
        let (dx, dy) = aim.offset_from(origin);
        let axis_len = dx.hypot(dy);
        if axis_len <= EPSILON {
            return BTreeSet::new();
        }
        let axis = (dx / axis_len, dy / axis_len);
        let half_angle = (angle_degrees / 2.0).to_radians();

        let inside = |point: Point| {
            let (px, py) = point.offset_from(origin);
            let dist = px.hypot(py);
            if dist <= EPSILON || dist > length + EPSILON {
                return false;
            }
            let cos = ((px * axis.0 + py * axis.1) / dist).clamp(-1.0, 1.0);
            cos.acos() <= half_angle + EPSILON
        };

        self.cells_around(origin, length + self.cell_size)
            .filter(|cell| self.sample_points(*cell).into_iter().any(|p| inside(p)))
            .collect()
    }

    /// Every cell whose centre lies within `width / 2` of the segment that
    /// starts at `origin` and runs `length` towards `aim`.
    pub fn cells_in_line(
        &self,
        origin: Point,
        aim: Point,
        length: f64,
        width: f64,
    ) -> BTreeSet<Cell> {
        let (dx, dy) = aim.offset_from(origin);
        let axis_len = dx.hypot(dy);
        if axis_len <= EPSILON {
            return BTreeSet::new();
        }
        let axis = (dx / axis_len, dy / axis_len);

        self.cells_around(origin, length + width)
            .filter(|cell| {
                let (px, py) = self.center(*cell).offset_from(origin);
                let along = px * axis.0 + py * axis.1;
                if along < -EPSILON || along > length + EPSILON {
                    return false;
                }
                let across = (px * axis.1 - py * axis.0).abs();
                across <= width / 2.0 + EPSILON
            })
            .collect()
    }

    pub fn affected_cells(
        &self,
        template: &AreaTemplate,
        origin: Point,
        aim: Point,
    ) -> BTreeSet<Cell> {
        match *template {
            AreaTemplate::Radius { radius } => self.reachable_cells(origin, radius),
            AreaTemplate::Cone {
                length,
                angle_degrees,
            } => self.cells_in_cone(origin, aim, length, angle_degrees),
            AreaTemplate::Line { length, width } => self.cells_in_line(origin, aim, length, width),
        }
    }

    /// Combatants whose token sits in one of `cells`, in token order, each at most once.
    pub fn characters_in_cells(
        &self,
        tokens: &[Token],
        cells: &BTreeSet<Cell>,
    ) -> Vec<CombatantId> {
        let mut seen = HashSet::new();
        tokens
            .iter()
            .filter(|token| cells.contains(&self.cell_at(token.position)))
            .filter(|token| seen.insert(token.combatant_id))
            .map(|token| token.combatant_id)
            .collect()
    }
}
