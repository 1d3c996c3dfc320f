//! Core data types and enums for timetable consolidation.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::identifiers::*;

/// Seconds in one service day. Offsets past this value belong to the next
/// calendar day but the same service day.
pub const SECONDS_PER_DAY: u32 = 86_400;

// ============================================================================
// Enums
// ============================================================================

/// Trip direction (0 = outbound, 1 = inbound per GTFS)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum DirectionId {
    Outbound = 0,
    Inbound = 1,
}

impl DirectionId {
    pub fn as_gtfs(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Fragments
// ============================================================================

/// One stop of a normalized fragment.
///
/// `station` holds the namespace-stripped raw id straight out of
/// normalization and the canonical id once the pipeline has run the fragment
/// through the station resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawStop {
    pub station: StationIdentifier,
    pub arrival: u32,
    pub departure: u32,
    pub platform: Option<Arc<str>>,
}

/// One operator's view of one train run for one service day.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawFragment {
    pub key: FragmentKey,
    /// Raw direction label as published (`Outbound`, `InnerLoop`, ...)
    pub direction: Option<Arc<str>>,
    /// Calendar this run was published under, namespace stripped
    pub calendar: Arc<str>,
    pub train_type: Option<Arc<str>>,
    pub train_name: Option<Arc<str>>,
    pub stops: Vec<RawStop>,
    /// Published timetable id, namespace stripped
    pub timetable: Option<Arc<str>>,
    /// Timetables the same vehicle runs as before and after this one
    pub previous: Vec<Arc<str>>,
    pub next: Vec<Arc<str>>,
}

impl RawFragment {
    pub fn first_stop(&self) -> Option<&RawStop> {
        self.stops.first()
    }

    pub fn last_stop(&self) -> Option<&RawStop> {
        self.stops.last()
    }

    /// Departure offset of the first stop
    pub fn start_offset(&self) -> u32 {
        self.stops.first().map(|s| s.departure).unwrap_or(0)
    }

    /// Arrival offset of the last stop
    pub fn end_offset(&self) -> u32 {
        self.stops.last().map(|s| s.arrival).unwrap_or(0)
    }

    /// Check the ordering invariant every fragment must hold.
    pub fn validate(&self) -> Result<()> {
        if self.stops.len() < 2 {
            return Err(TransitError::MalformedRecord(format!(
                "{}: fewer than two timed stops",
                self.key
            )));
        }

        let mut previous: Option<&RawStop> = None;
        for stop in &self.stops {
            if stop.departure < stop.arrival {
                return Err(TransitError::MalformedRecord(format!(
                    "{}: departure {} before arrival {} at {}",
                    self.key, stop.departure, stop.arrival, stop.station
                )));
            }
            if let Some(prev) = previous {
                if stop.arrival < prev.departure || stop.departure <= prev.departure {
                    return Err(TransitError::MalformedRecord(format!(
                        "{}: times go backwards at {} ({} after {})",
                        self.key, stop.station, stop.arrival, prev.departure
                    )));
                }
            }
            previous = Some(stop);
        }

        Ok(())
    }
}

/// Arena of every fragment in a build, iterated in key order.
pub type FragmentPool = BTreeMap<FragmentKey, RawFragment>;

// ============================================================================
// Trips
// ============================================================================

/// A single stop event in a trip (arrival/departure at a station)
///
/// Times are stored as seconds since midnight of the service day.
/// Per GTFS spec, times can exceed 24 hours for trips past midnight
/// (e.g., 25:30:00 = 91800 seconds for 1:30am the next day).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StopTime {
    pub station_id: StationIdentifier,
    pub arrival: u32,      // Seconds since midnight (service day start)
    pub departure: u32,    // Seconds since midnight (service day start)
    pub stop_sequence: u32,
    pub platform: Option<Arc<str>>,
}

impl StopTime {
    pub fn new(
        station_id: StationIdentifier,
        arrival: u32,
        departure: u32,
        stop_sequence: u32,
    ) -> Self {
        Self {
            station_id,
            arrival,
            departure,
            stop_sequence,
            platform: None,
        }
    }

    /// Apply a delay in seconds (for realtime updates). Times saturate at
    /// the start of the service day, so departure stays at or after arrival.
    pub fn with_delay(&self, delay_seconds: i32) -> Self {
        let shift = |time: u32| {
            u32::try_from((i64::from(time) + i64::from(delay_seconds)).max(0)).unwrap_or(u32::MAX)
        };

        Self {
            arrival: shift(self.arrival),
            departure: shift(self.departure),
            ..self.clone()
        }
    }
}

/// A consolidated trip, possibly spanning several operators.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Trip {
    pub id: TripIdentifier,
    pub route: RouteIdentifier,
    pub operator: OperatorIdentifier,
    pub train_number: TrainNumber,
    pub direction: DirectionId,
    pub headsign: Arc<str>,
    pub train_name: Option<Arc<str>>,
    pub service: ServiceIdentifier,
    pub service_date: NaiveDate,
    pub stop_times: Vec<StopTime>,
    /// Fragments this trip was stitched from, head first
    pub provenance: Vec<FragmentKey>,
    /// Index into `stop_times` of each provenance fragment's first stop. A
    /// hand-over stop is shared by the fragments on both sides of it.
    #[cfg_attr(feature = "serde", serde(default))]
    pub fragment_starts: Vec<usize>,
    /// Shared by trips the same vehicle runs back to back
    #[cfg_attr(feature = "serde", serde(default))]
    pub block_id: Option<Arc<str>>,
}

impl Trip {
    /// Deterministic id: `{route}.{train}.{YYYYMMDD}` of the head fragment.
    pub fn make_id(head: &FragmentKey) -> TripIdentifier {
        TripIdentifier::new(format!(
            "{}.{}.{}",
            head.route,
            head.train_number,
            head.service_date.format("%Y%m%d")
        ))
    }

    pub fn make_service(route: &RouteIdentifier, calendar: &str) -> ServiceIdentifier {
        ServiceIdentifier::new(format!("{}.{}", route, calendar))
    }

    pub fn position_of(&self, station: &StationIdentifier) -> Option<usize> {
        self.stop_times.iter().position(|st| &st.station_id == station)
    }

    /// Stop times contributed by the `n`th provenance fragment.
    pub fn fragment_stops(&self, n: usize) -> Option<Range<usize>> {
        let start = *self.fragment_starts.get(n)?;
        let end = match self.fragment_starts.get(n + 1) {
            Some(next) => next + 1,
            None => self.stop_times.len(),
        };
        (start < end && end <= self.stop_times.len()).then_some(start..end)
    }

    /// First call at `station` made while this trip runs as `train`.
    ///
    /// Trips without recorded fragment boundaries fall back to the first
    /// call anywhere in the trip.
    pub fn position_for_train(
        &self,
        train: &TrainIdentity,
        station: &StationIdentifier,
    ) -> Option<usize> {
        if self.fragment_starts.len() != self.provenance.len() {
            return self.position_of(station);
        }
        self.provenance
            .iter()
            .enumerate()
            .filter(|(_, key)| key.train_identity() == *train)
            .filter_map(|(n, _)| self.fragment_stops(n))
            .find_map(|range| {
                let offset = range.start;
                self.stop_times[range]
                    .iter()
                    .position(|st| &st.station_id == station)
                    .map(|i| offset + i)
            })
    }

    pub fn is_through_service(&self) -> bool {
        self.provenance.len() > 1
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransitError {
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Unknown station {station} (operator {operator})")]
    UnknownStation {
        station: StationIdentifier,
        operator: OperatorIdentifier,
    },

    #[error("Cyclic chain: {0} revisited")]
    CyclicChain(FragmentKey),

    #[error("Non-monotonic chain headed by {head}: offsets decrease entering {at}")]
    NonMonotonicChain { head: FragmentKey, at: FragmentKey },

    #[error("No static match: {0}")]
    NoStaticMatch(String),

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Missing table: {0}")]
    MissingTable(&'static str),

    #[error("Invalid train number pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, TransitError>;
