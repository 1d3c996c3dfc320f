//! Fixtures shared by unit tests.

use chrono::NaiveDate;

use crate::config::BuildConfig;
use crate::identifiers::*;
use crate::models::{FragmentPool, RawFragment, RawStop};
use crate::stations::StationResolver;
use crate::tables::{LookupTables, StationRow};

/// 2024-04-`day` (2024-04-01 is a Monday)
pub(crate) fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, day).unwrap()
}

pub(crate) fn fragment(
    operator: &str,
    route: &str,
    train: &str,
    day: u32,
    stops: &[(&str, u32, u32)],
) -> RawFragment {
    RawFragment {
        key: FragmentKey::new(operator, route, train, date(day)),
        direction: None,
        calendar: "Weekday".into(),
        train_type: None,
        train_name: None,
        stops: stops
            .iter()
            .map(|(station, arrival, departure)| RawStop {
                station: StationIdentifier::new(*station),
                arrival: *arrival,
                departure: *departure,
                platform: None,
            })
            .collect(),
        timetable: None,
        previous: Vec::new(),
        next: Vec::new(),
    }
}

pub(crate) fn pool(fragments: Vec<RawFragment>) -> FragmentPool {
    fragments.into_iter().map(|f| (f.key.clone(), f)).collect()
}

/// Stations `P`, `Q`, `R`, `S`, `T`, `U`, each far from the others.
pub(crate) fn station_tables() -> LookupTables {
    let stations = ["P", "Q", "R", "S", "T", "U"]
        .iter()
        .enumerate()
        .map(|(i, id)| StationRow {
            id: StationIdentifier::new(*id),
            operator: OperatorIdentifier::new("X"),
            name: format!("Station {}", id),
            code: None,
            lat: Some(35.0 + i as f64 * 0.1),
            lon: Some(139.0),
        })
        .collect();

    LookupTables {
        stations,
        ..Default::default()
    }
}

pub(crate) fn station_resolver() -> StationResolver {
    StationResolver::new(&station_tables(), &BuildConfig::default()).unwrap()
}
