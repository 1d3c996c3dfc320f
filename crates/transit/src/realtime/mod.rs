//! Realtime delay matching.
//!
//! A [`RealtimeUpdate`] names a train the way an operator's feed does:
//! operator, train number, service date and the station it was last seen
//! at. The matcher finds the consolidated trip containing that train and
//! projects the delay over the remaining stops.

pub mod index;

use std::sync::{Arc, RwLock};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

use crate::identifiers::*;
use crate::models::{Result, TransitError, Trip, TripLookup};

pub use index::TripIndex;

/// One observation from a live feed.
///
/// Feeds list every train they know about, including ones with no position
/// or delay yet. Those entries still parse; matching rejects them one by one.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RealtimeUpdate {
    #[cfg_attr(feature = "serde", serde(alias = "odpt:operator"))]
    pub operator: OperatorIdentifier,
    #[cfg_attr(feature = "serde", serde(alias = "odpt:trainNumber"))]
    pub train_number: TrainNumber,
    pub service_date: NaiveDate,
    /// Raw or canonical station id
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:fromStation"))]
    pub station: Option<StationIdentifier>,
    /// Seconds, negative when running early
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:delay"))]
    pub delay_secs: Option<i32>,
    /// Unix seconds
    #[cfg_attr(feature = "serde", serde(default))]
    pub timestamp: i64,
    /// The feed's own expiry for this entry
    #[cfg_attr(feature = "serde", serde(default, alias = "dct:valid"))]
    pub valid_until: Option<DateTime<FixedOffset>>,
}

impl RealtimeUpdate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until
            .is_some_and(|valid| valid.with_timezone(&Utc) < now)
    }

    fn train_identity(&self) -> TrainIdentity {
        TrainIdentity {
            operator: OperatorIdentifier::new(strip_namespace(self.operator.as_str())),
            train_number: TrainNumber::new(strip_namespace(self.train_number.as_str())),
            service_date: self.service_date,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProjectedStopTime {
    pub station: StationIdentifier,
    pub stop_sequence: u32,
    pub arrival: u32,
    pub departure: u32,
}

/// Delay applied to a trip from the matched stop onwards.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DelayProjection {
    pub trip_id: TripIdentifier,
    pub service_date: NaiveDate,
    /// Index into the trip's stop times
    pub stop_index: usize,
    pub delay: i32,
    pub timestamp: i64,
    pub stops: Vec<ProjectedStopTime>,
}

/// Project `delay` over `trip` from `stop_index` on.
///
/// Projected times never go below the scheduled departure of the stop
/// before the matched one, and never decrease from one stop to the next.
pub fn project(trip: &Trip, stop_index: usize, delay: i32, timestamp: i64) -> Result<DelayProjection> {
    let remaining = trip.stop_times.get(stop_index..).ok_or_else(|| {
        TransitError::InvalidData(format!("{} has no stop {}", trip.id, stop_index))
    })?;

    let mut floor = stop_index
        .checked_sub(1)
        .map(|i| trip.stop_times[i].departure)
        .unwrap_or(0);

    let mut stops = Vec::with_capacity(remaining.len());
    for stop_time in remaining {
        let delayed = stop_time.with_delay(delay);
        let arrival = delayed.arrival.max(floor);
        let departure = delayed.departure.max(arrival);
        floor = departure;

        stops.push(ProjectedStopTime {
            station: stop_time.station_id.clone(),
            stop_sequence: stop_time.stop_sequence,
            arrival,
            departure,
        });
    }

    Ok(DelayProjection {
        trip_id: trip.id.clone(),
        service_date: trip.service_date,
        stop_index,
        delay,
        timestamp,
        stops,
    })
}

/// Match an update against any trip lookup.
///
/// The station is searched for only among the stops the named train itself
/// serves, so a trip calling at one station twice projects from the right
/// call.
pub fn match_with(
    lookup: &dyn TripLookup,
    update: &RealtimeUpdate,
    now: DateTime<Utc>,
) -> Result<DelayProjection> {
    let identity = update.train_identity();
    let unusable = |reason: &str| {
        TransitError::NoStaticMatch(format!(
            "train {} of {}: {}",
            identity.train_number, identity.operator, reason
        ))
    };

    if update.is_expired(now) {
        return Err(unusable("update expired"));
    }
    let delay = update.delay_secs.ok_or_else(|| unusable("no delay reported"))?;
    let reported = update.station.as_ref().ok_or_else(|| unusable("no station reported"))?;

    let trips = lookup.trips_for_train(&identity);
    if trips.is_empty() {
        return Err(TransitError::NoStaticMatch(format!(
            "no trip for train {} of {} on {}",
            identity.train_number, identity.operator, identity.service_date
        )));
    }

    let station = lookup
        .canonical_station(reported, &identity.operator)
        .ok_or_else(|| TransitError::NoStaticMatch(format!("unknown station {}", reported)))?;

    for trip in &trips {
        if let Some(stop_index) = trip.position_for_train(&identity, &station) {
            return project(trip, stop_index, delay, update.timestamp);
        }
    }

    Err(TransitError::NoStaticMatch(format!(
        "train {} of {} does not call at {}",
        identity.train_number, identity.operator, station
    )))
}

/// Matches updates against the current trip index.
///
/// Lookups take a snapshot of the index, so a concurrent [`swap`](Self::swap)
/// never mixes two builds within one match.
#[derive(Debug, Default)]
pub struct RealtimeMatcher {
    index: RwLock<Arc<TripIndex>>,
}

impl RealtimeMatcher {
    pub fn new(index: TripIndex) -> Self {
        Self {
            index: RwLock::new(Arc::new(index)),
        }
    }

    /// Replace the index, returning the previous one.
    pub fn swap(&self, index: TripIndex) -> Arc<TripIndex> {
        let mut guard = self.index.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(index))
    }

    pub fn snapshot(&self) -> Arc<TripIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn try_match(&self, update: &RealtimeUpdate) -> Result<DelayProjection> {
        self.try_match_at(update, Utc::now())
    }

    /// Match with an explicit clock for expiry checks.
    pub fn try_match_at(&self, update: &RealtimeUpdate, now: DateTime<Utc>) -> Result<DelayProjection> {
        let index = self.snapshot();
        match_with(index.as_ref(), update, now)
    }

    pub fn match_update(&self, update: &RealtimeUpdate) -> Option<DelayProjection> {
        match self.try_match(update) {
            Ok(projection) => Some(projection),
            Err(e) => {
                tracing::debug!(
                    operator = update.operator.as_str(),
                    train = update.train_number.as_str(),
                    "{}",
                    e
                );
                None
            }
        }
    }
}
