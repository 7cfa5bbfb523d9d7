//! World-space geometry: points, viewports, and hit tests.
//!
//! SYSTEM CONTEXT
//! ==============
//! The world is a fixed square of `WORLD_SIZE` × `WORLD_SIZE` units. All
//! positions here are world coordinates, independent of any client camera.
//! Collision detection and read-side viewport culling both live on top of
//! these primitives.

use serde::{Deserialize, Serialize};

/// Side length of the shared square world, in world units.
pub const WORLD_SIZE: f64 = 10_000.0;

/// A point in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Clamp into the world square. Out-of-range client input is folded
    /// back to the nearest edge rather than rejected.
    #[must_use]
    pub fn clamp_to_world(self) -> Self {
        Self {
            x: self.x.clamp(0.0, WORLD_SIZE),
            y: self.y.clamp(0.0, WORLD_SIZE),
        }
    }

    /// Squared distance to another point. Avoids the sqrt in hot paths.
    #[must_use]
    pub fn dist_sq(self, other: Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// Point-in-circle test: is `p` within `radius` of `center`?
#[must_use]
pub fn hits_circle(p: Point, center: Point, radius: f64) -> bool {
    p.dist_sq(center) <= radius * radius
}

/// Visual radius of a brush stroke. A single-point stroke renders as a
/// dot of this radius, not a zero-length line.
#[must_use]
pub fn stroke_radius(size: f64) -> f64 {
    size / 2.0
}

// =============================================================================
// VIEWPORT
// =============================================================================

/// A client camera's visible rectangle, in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    #[must_use]
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Grow the rectangle by `margin` on every side.
    #[must_use]
    pub fn expand(self, margin: f64) -> Self {
        Self {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + margin * 2.0,
            height: self.height + margin * 2.0,
        }
    }

    #[must_use]
    pub fn contains(self, p: Point) -> bool {
        p.x >= self.x && p.x <= self.x + self.width && p.y >= self.y && p.y <= self.y + self.height
    }
}

/// Read-side culling filter: a stroke is visible iff any of its points
/// falls inside the viewport expanded by the stroke's radius.
#[must_use]
pub fn stroke_visible(points: &[Point], size: f64, viewport: Viewport) -> bool {
    let expanded = viewport.expand(stroke_radius(size));
    points.iter().any(|p| expanded.contains(*p))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_folds_into_world() {
        let p = Point::new(-50.0, WORLD_SIZE + 1.0).clamp_to_world();
        assert!((p.x - 0.0).abs() < f64::EPSILON);
        assert!((p.y - WORLD_SIZE).abs() < f64::EPSILON);
    }

    #[test]
    fn clamp_leaves_interior_alone() {
        let p = Point::new(123.5, 4567.0).clamp_to_world();
        assert!((p.x - 123.5).abs() < f64::EPSILON);
        assert!((p.y - 4567.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hits_circle_inside_and_boundary() {
        let center = Point::new(100.0, 100.0);
        assert!(hits_circle(Point::new(100.0, 110.0), center, 10.0));
        assert!(hits_circle(Point::new(100.0, 109.9), center, 10.0));
        assert!(!hits_circle(Point::new(100.0, 110.1), center, 10.0));
    }

    #[test]
    fn single_point_stroke_is_a_dot_of_half_size() {
        assert!((stroke_radius(16.0) - 8.0).abs() < f64::EPSILON);

        // A dot just off-screen is still visible once the viewport is
        // expanded by its radius.
        let vp = Viewport::new(0.0, 0.0, 100.0, 100.0);
        let dot = [Point::new(104.0, 50.0)];
        assert!(stroke_visible(&dot, 16.0, vp));
        assert!(!stroke_visible(&dot, 4.0, vp));
    }

    #[test]
    fn stroke_visible_any_point_suffices() {
        let vp = Viewport::new(0.0, 0.0, 100.0, 100.0);
        let crossing = [Point::new(-500.0, -500.0), Point::new(50.0, 50.0)];
        assert!(stroke_visible(&crossing, 2.0, vp));

        let far = [Point::new(5000.0, 5000.0), Point::new(6000.0, 6000.0)];
        assert!(!stroke_visible(&far, 2.0, vp));
    }

    #[test]
    fn viewport_expand_is_symmetric() {
        let vp = Viewport::new(10.0, 10.0, 20.0, 20.0).expand(5.0);
        assert!((vp.x - 5.0).abs() < f64::EPSILON);
        assert!((vp.y - 5.0).abs() < f64::EPSILON);
        assert!((vp.width - 30.0).abs() < f64::EPSILON);
        assert!((vp.height - 30.0).abs() < f64::EPSILON);
    }
}
