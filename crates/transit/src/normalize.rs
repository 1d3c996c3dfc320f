//! Raw timetable records and their normalization into [`RawFragment`]s.
//!
//! A record is one operator's published timetable for one train: either an
//! ODPT `TrainTimetable` object (the field aliases accept its JSON keys as-is)
//! or one column of a scraped station-by-train table.
//!
//! Normalization turns clock strings into offsets from the start of the
//! service day, so the times of a train running past midnight keep growing
//! past 86400 instead of wrapping.

use std::sync::{Arc, LazyLock};

use chrono::NaiveDate;
use regex::Regex;

use crate::identifiers::*;
use crate::models::{RawFragment, RawStop, Result, TransitError, SECONDS_PER_DAY};

/// Backward steps longer than this are read as a midnight rollover.
const ROLLOVER_THRESHOLD: u32 = 12 * 3600;

/// `isMidnight` stops before this clock time belong to the next calendar day.
const MIDNIGHT_FLAG_CUTOFF: u32 = 6 * 3600;

/// Calendar assumed for records that do not name one.
pub const DEFAULT_CALENDAR: &str = "Everyday";

static CELL_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,2}:\d{2}").unwrap());

// ============================================================================
// Records
// ============================================================================

/// One published timetable for one train.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawRecord {
    #[cfg_attr(feature = "serde", serde(default, alias = "owl:sameAs"))]
    pub id: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:operator"))]
    pub operator: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:railway"))]
    pub route: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:trainNumber"))]
    pub train_number: String,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:railDirection"))]
    pub direction: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:calendar"))]
    pub calendar: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:trainType"))]
    pub train_type: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub train_name: Option<String>,
    /// Explicit service day; when absent the record is expanded over the
    /// build window by its calendar
    #[cfg_attr(feature = "serde", serde(default))]
    pub service_date: Option<NaiveDate>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:trainTimetableObject"))]
    pub stops: Vec<RawRecordStop>,
    /// Timetable ids the same vehicle ran as before this one
    #[cfg_attr(
        feature = "serde",
        serde(default, alias = "odpt:previousTrainTimetable", deserialize_with = "one_or_many")
    )]
    pub previous_timetables: Vec<String>,
    /// Timetable ids the same vehicle runs as next
    #[cfg_attr(
        feature = "serde",
        serde(default, alias = "odpt:nextTrainTimetable", deserialize_with = "one_or_many")
    )]
    pub next_timetables: Vec<String>,
}

/// Some feeds give a lone string where a list is expected.
#[cfg(feature = "serde")]
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(
        match <Option<OneOrMany> as serde::Deserialize>::deserialize(deserializer)? {
            None => Vec::new(),
            Some(OneOrMany::One(id)) => vec![id],
            Some(OneOrMany::Many(ids)) => ids,
        },
    )
}

/// One entry of a record's stop list.
///
/// Intermediate stops name a departure station; the terminal names an
/// arrival station. Either time may be missing.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawRecordStop {
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:departureStation"))]
    pub departure_station: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:departureTime"))]
    pub departure_time: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:arrivalStation"))]
    pub arrival_station: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:arrivalTime"))]
    pub arrival_time: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:platformNumber"))]
    pub platform: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, alias = "odpt:isMidnight"))]
    pub is_midnight: bool,
}

impl RawRecordStop {
    pub fn station(&self) -> Option<&str> {
        self.departure_station
            .as_deref()
            .or(self.arrival_station.as_deref())
    }
}

/// One train column of a scraped station-by-train table.
///
/// `cells` holds `(station id, cell text)` pairs top to bottom. A station
/// listed twice in a row has an arrival row followed by a departure row.
/// Cells without a clock time (pass marks, blank cells) are skipped.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TableColumn {
    pub route: String,
    pub direction: Option<String>,
    pub calendar: String,
    pub train_number: String,
    pub train_type: Option<String>,
    pub train_name: Option<String>,
    pub cells: Vec<(String, String)>,
}

impl RawRecord {
    pub fn from_table_column(column: &TableColumn) -> Self {
        let mut stops: Vec<RawRecordStop> = Vec::new();

        for (station, cell) in &column.cells {
            let Some(time) = CELL_TIME.find(cell).map(|m| m.as_str().to_owned()) else {
                continue;
            };

            match stops.last_mut() {
                Some(last)
                    if last.departure_station.as_deref() == Some(station.as_str())
                        && last.departure_time.is_none() =>
                {
                    last.departure_time = Some(time);
                }
                _ => stops.push(RawRecordStop {
                    departure_station: Some(station.clone()),
                    arrival_time: Some(time),
                    ..Default::default()
                }),
            }
        }

        Self {
            route: Some(column.route.clone()),
            train_number: column.train_number.clone(),
            direction: column.direction.clone(),
            calendar: Some(column.calendar.clone()),
            train_type: column.train_type.clone(),
            train_name: column.train_name.clone(),
            stops,
            ..Default::default()
        }
    }

    /// Route id with the namespace stripped.
    pub fn route_id(&self) -> Option<RouteIdentifier> {
        self.route
            .as_deref()
            .map(strip_namespace)
            .filter(|r| !r.is_empty())
            .map(RouteIdentifier::new)
    }

    /// Operator named by the record, else the first segment of its route id
    /// (`Toei.Asakusa` -> `Toei`).
    pub fn operator_id(&self) -> Option<OperatorIdentifier> {
        if let Some(op) = self.operator.as_deref().map(strip_namespace) {
            if !op.is_empty() {
                return Some(OperatorIdentifier::new(op));
            }
        }
        let route = self.route.as_deref().map(strip_namespace)?;
        route
            .split('.')
            .next()
            .filter(|op| !op.is_empty())
            .map(OperatorIdentifier::new)
    }

    pub fn calendar_name(&self) -> &str {
        self.calendar
            .as_deref()
            .map(strip_namespace)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CALENDAR)
    }
}

// ============================================================================
// Times
// ============================================================================

/// Parse `HH:MM` or `HH:MM:SS` into seconds. Hours may exceed 23.
pub fn parse_time(text: &str) -> Result<u32> {
    let bad = || TransitError::MalformedRecord(format!("unparsable time {:?}", text));

    let mut parts = text.trim().split(':');
    let mut field = |max: u32| -> Result<u32> {
        let value: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if value > max {
            return Err(bad());
        }
        Ok(value)
    };

    let hours = field(47)?;
    let minutes = field(59)?;
    let seconds = match parts.next() {
        Some(s) => {
            let value: u32 = s.parse().map_err(|_| bad())?;
            if value > 59 {
                return Err(bad());
            }
            value
        }
        None => 0,
    };
    if parts.next().is_some() {
        return Err(bad());
    }

    Ok(hours * 3600 + minutes * 60 + seconds)
}

/// Format seconds as GTFS `HH:MM:SS` (hours may exceed 23).
pub fn format_time(secs: u32) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Move `time` past midnight until it is no earlier than `floor`.
fn roll_forward(time: u32, floor: u32, context: &str) -> Result<u32> {
    let mut time = time;
    while time < floor {
        if floor - time <= ROLLOVER_THRESHOLD {
            return Err(TransitError::MalformedRecord(format!(
                "{}: time {} goes backwards from {}",
                context,
                format_time(time),
                format_time(floor)
            )));
        }
        time += SECONDS_PER_DAY;
    }
    Ok(time)
}

// ============================================================================
// Normalization
// ============================================================================

/// Normalize one record into a fragment of `operator`'s pool for `service_date`.
///
/// Station ids are namespace-stripped raw ids; canonicalization happens later.
pub fn normalize(
    record: &RawRecord,
    operator: &OperatorIdentifier,
    service_date: NaiveDate,
) -> Result<RawFragment> {
    let train_number = record.train_number.trim();
    if train_number.is_empty() {
        return Err(TransitError::MalformedRecord(format!(
            "{}: empty train number",
            record.id.as_deref().unwrap_or("record")
        )));
    }
    let route = record.route_id().ok_or_else(|| {
        TransitError::MalformedRecord(format!("train {}: missing route", train_number))
    })?;

    let key = FragmentKey::new(operator.clone(), route, train_number, service_date);
    let context = key.to_string();

    let mut stops: Vec<RawStop> = Vec::with_capacity(record.stops.len());
    let mut floor: u32 = 0;

    for entry in &record.stops {
        let arrival = entry.arrival_time.as_deref().map(parse_time).transpose()?;
        let departure = entry.departure_time.as_deref().map(parse_time).transpose()?;

        // Passing stop
        let (mut arrival, mut departure) = match (arrival, departure) {
            (None, None) => continue,
            (Some(a), None) => (a, a),
            (None, Some(d)) => (d, d),
            (Some(a), Some(d)) => (a, d),
        };

        let station = entry.station().map(strip_namespace).ok_or_else(|| {
            TransitError::MalformedRecord(format!("{}: timed stop without a station", context))
        })?;

        if entry.is_midnight {
            if arrival < MIDNIGHT_FLAG_CUTOFF {
                arrival += SECONDS_PER_DAY;
            }
            if departure < MIDNIGHT_FLAG_CUTOFF {
                departure += SECONDS_PER_DAY;
            }
        }

        let arrival = roll_forward(arrival, floor, &context)?;
        let departure = roll_forward(departure, arrival, &context)?;

        if let Some(prev) = stops.last() {
            if departure <= prev.departure {
                return Err(TransitError::MalformedRecord(format!(
                    "{}: departure {} at {} does not advance past {}",
                    context,
                    format_time(departure),
                    station,
                    format_time(prev.departure)
                )));
            }
        }

        floor = departure;
        stops.push(RawStop {
            station: StationIdentifier::new(station),
            arrival,
            departure,
            platform: entry
                .platform
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(Arc::from),
        });
    }

    let fragment = RawFragment {
        key,
        direction: record
            .direction
            .as_deref()
            .map(strip_namespace)
            .filter(|d| !d.is_empty())
            .map(Arc::from),
        calendar: record.calendar_name().into(),
        train_type: record
            .train_type
            .as_deref()
            .map(strip_namespace)
            .filter(|t| !t.is_empty())
            .map(Arc::from),
        train_name: record.train_name.as_deref().filter(|n| !n.is_empty()).map(Arc::from),
        stops,
        timetable: record
            .id
            .as_deref()
            .map(strip_namespace)
            .filter(|id| !id.is_empty())
            .map(Arc::from),
        previous: timetable_ids(&record.previous_timetables),
        next: timetable_ids(&record.next_timetables),
    };

    fragment.validate()?;
    Ok(fragment)
}

fn timetable_ids(ids: &[String]) -> Vec<Arc<str>> {
    ids.iter()
        .map(|id| strip_namespace(id))
        .filter(|id| !id.is_empty())
        .map(Arc::from)
        .collect()
}
