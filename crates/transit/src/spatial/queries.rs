//! Spatial query utilities for distance calculations.
//!
//! Uses Haversine formula for accurate distances on Earth's surface.

use geo::{Centroid, HaversineDistance, MultiPoint, Point};

/// Calculate Haversine distance between two points in meters
pub fn haversine_distance(p1: Point, p2: Point) -> f64 {
    p1.haversine_distance(&p2)
}

/// Whether two points lie within `radius_m` meters of each other
pub fn within_radius(p1: Point, p2: Point, radius_m: f64) -> bool {
    radius_m.is_finite() && radius_m >= 0.0 && haversine_distance(p1, p2) <= radius_m
}

/// Arithmetic mean of the given points (lon/lat averaged independently)
pub fn average_point(points: &[Point]) -> Option<Point> {
    MultiPoint::from(points.to_vec()).centroid()
}
