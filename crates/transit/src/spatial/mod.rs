//! Spatial query utilities.

pub mod queries;

pub use queries::{average_point, haversine_distance, within_radius};
