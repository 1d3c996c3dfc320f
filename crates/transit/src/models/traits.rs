//! Core traits for consolidated timetable data.
//!
//! These traits define the read-only interface realtime consumers use.
//! The in-memory [`TripIndex`](crate::realtime::TripIndex) is the shipped
//! implementation; others can be database-backed or remote.

use std::sync::Arc;

use crate::identifiers::*;
use crate::models::types::*;

// ============================================================================
// Lookup Trait
// ============================================================================

/// Provider of assembled trips with the lookups realtime matching needs
pub trait TripLookup: Send + Sync {
    // ---- Lookups ----
    fn get_trip(&self, id: &TripIdentifier) -> Option<Arc<Trip>>;

    /// Trips containing a fragment run by this operator under this train
    /// number on this service date, in trip id order
    fn trips_for_train(&self, train: &TrainIdentity) -> Vec<Arc<Trip>>;

    /// Canonical id for a raw or canonical station id as seen by `operator`
    fn canonical_station(
        &self,
        station: &StationIdentifier,
        operator: &OperatorIdentifier,
    ) -> Option<StationIdentifier>;

    // ---- Collections ----
    fn all_trips(&self) -> Vec<Arc<Trip>>;

    fn trip_count(&self) -> usize {
        self.all_trips().len()
    }
}
