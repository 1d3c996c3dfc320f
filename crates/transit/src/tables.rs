//! Lookup tables consumed by a build.
//!
//! Every table is a plain list of rows. Loading them (CSV in the CLI) is the
//! caller's business; the engine only reads them through a
//! [`BuildContext`](crate::pipeline::BuildContext).

use chrono::NaiveDate;

use crate::identifiers::*;

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperatorRow {
    pub id: OperatorIdentifier,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouteRow {
    pub id: RouteIdentifier,
    pub operator: OperatorIdentifier,
    pub name: String,
    /// Raw direction label that maps to GTFS direction 0
    #[cfg_attr(feature = "serde", serde(default))]
    pub outbound_direction: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationRow {
    pub id: StationIdentifier,
    pub operator: OperatorIdentifier,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub code: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub lat: Option<f64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub lon: Option<f64>,
}

impl StationRow {
    /// Name key used for merging: the last `.`-separated segment of the id.
    pub fn name_key(&self) -> &str {
        name_key(self.id.as_str())
    }
}

/// Last `.`-separated segment of a station id (`JR-East.Yamanote.Tokyo` -> `Tokyo`).
pub fn name_key(station_id: &str) -> &str {
    let local = strip_namespace(station_id);
    local.rsplit('.').next().unwrap_or(local)
}

/// Extra raw id that should resolve to an existing station row.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationAliasRow {
    pub alias: StationIdentifier,
    pub station: StationIdentifier,
}

/// Corrected position for a station whose published coordinates are wrong.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationFixRow {
    pub station: StationIdentifier,
    pub lat: f64,
    pub lon: f64,
}

/// `(from_operator, from_route, from_train, from_station) ->
/// (to_operator, to_route, to_train, to_station)`.
///
/// Train patterns are anchored regular expressions where a bare `*` stands
/// for "any train number" and the destination pattern may refer to capture
/// groups of the source pattern as `$1`, `$2`, ...
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThroughServiceRow {
    pub from_operator: OperatorIdentifier,
    pub from_route: RouteIdentifier,
    pub from_train: String,
    pub from_station: StationIdentifier,
    pub to_operator: OperatorIdentifier,
    pub to_route: RouteIdentifier,
    pub to_train: String,
    pub to_station: StationIdentifier,
}

/// Headsign override for trips on `route` terminating at `destination`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeadsignRow {
    pub route: RouteIdentifier,
    pub destination: StationIdentifier,
    pub headsign: String,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpecialCalendarRow {
    pub calendar: String,
    pub date: NaiveDate,
}

/// All lookup tables of one build.
#[derive(Clone, Debug, Default)]
pub struct LookupTables {
    pub operators: Vec<OperatorRow>,
    pub routes: Vec<RouteRow>,
    pub stations: Vec<StationRow>,
    pub station_aliases: Vec<StationAliasRow>,
    pub station_fixes: Vec<StationFixRow>,
    pub through_services: Vec<ThroughServiceRow>,
    pub headsigns: Vec<HeadsignRow>,
    pub holidays: Vec<NaiveDate>,
    pub special_calendars: Vec<SpecialCalendarRow>,
    /// Name keys that must never be merged even when close together
    pub separate_stations: Vec<String>,
}

impl LookupTables {
    pub fn route(&self, id: &RouteIdentifier) -> Option<&RouteRow> {
        let id = strip_namespace(id.as_str());
        self.routes.iter().find(|r| strip_namespace(r.id.as_str()) == id)
    }

    pub fn station(&self, id: &StationIdentifier) -> Option<&StationRow> {
        self.stations.iter().find(|s| &s.id == id)
    }
}
