//! In-memory trip index backed by a finished build.
//!
//! Immutable once built. Realtime consumers hold it behind an `Arc` and
//! replace it wholesale when a new build lands.

use std::collections::HashMap;
use std::sync::Arc;

use crate::identifiers::*;
use crate::models::{traits::*, types::*};
use crate::stations::StationResolver;

// ============================================================================
// Trip Index
// ============================================================================

/// Assembled trips with lookup maps for realtime matching
///
/// This type is cheap to clone since all data is stored in `Arc`s.
#[derive(Clone, Debug, Default)]
pub struct TripIndex {
    // Core data, sorted by trip id
    trips: Vec<Arc<Trip>>,

    // Lookup maps
    trip_map: HashMap<TripIdentifier, Arc<Trip>>,
    train_map: HashMap<TrainIdentity, Vec<Arc<Trip>>>,

    stations: Option<Arc<StationResolver>>,
}

impl TripIndex {
    /// Create a new empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index over `trips`. Every fragment a trip was stitched from
    /// makes the trip reachable under that fragment's train identity.
    pub fn from_data(trips: Vec<Trip>, stations: Arc<StationResolver>) -> Self {
        let mut trips: Vec<Arc<Trip>> = trips.into_iter().map(Arc::new).collect();
        trips.sort_by(|a, b| a.id.cmp(&b.id));

        let trip_map: HashMap<_, _> = trips.iter().map(|t| (t.id.clone(), t.clone())).collect();

        let mut train_map: HashMap<TrainIdentity, Vec<Arc<Trip>>> = HashMap::new();
        for trip in &trips {
            for key in &trip.provenance {
                let entry = train_map.entry(key.train_identity()).or_default();
                if !entry.iter().any(|t| t.id == trip.id) {
                    entry.push(trip.clone());
                }
            }
        }

        tracing::info!(
            trips = trips.len(),
            trains = train_map.len(),
            "trip index built"
        );

        Self {
            trips,
            trip_map,
            train_map,
            stations: Some(stations),
        }
    }
}

impl TripLookup for TripIndex {
    fn get_trip(&self, id: &TripIdentifier) -> Option<Arc<Trip>> {
        self.trip_map.get(id).cloned()
    }

    fn trips_for_train(&self, train: &TrainIdentity) -> Vec<Arc<Trip>> {
        self.train_map.get(train).cloned().unwrap_or_default()
    }

    fn canonical_station(
        &self,
        station: &StationIdentifier,
        operator: &OperatorIdentifier,
    ) -> Option<StationIdentifier> {
        let stations = self.stations.as_ref()?;
        match stations.resolve(station, operator) {
            Ok(canonical) => Some(canonical.id.clone()),
            Err(e) => {
                tracing::debug!("{}", e);
                None
            }
        }
    }

    fn all_trips(&self) -> Vec<Arc<Trip>> {
        self.trips.clone()
    }

    fn trip_count(&self) -> usize {
        self.trips.len()
    }
}
