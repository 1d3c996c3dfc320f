use anyhow::{Context, Result};
use chrono::NaiveDate;
use rail_gtfs_transit::prelude::*;
use rail_gtfs_transit::tables::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct HolidayRow {
    date: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct SeparateStationRow {
    name: String,
}

/// Parse CSV rows from any reader. Headers are required.
pub fn read_rows<T: DeserializeOwned, R: Read>(reader: R) -> Result<Vec<T>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(reader);

    let mut rows = Vec::new();
    for (line, row) in csv_reader.deserialize().enumerate() {
        rows.push(row.with_context(|| format!("Bad row {}", line + 2))?);
    }
    Ok(rows)
}

/// Read `dir/name`. A missing optional table is an empty table.
fn read_table<T: DeserializeOwned>(dir: &Path, name: &str, required: bool) -> Result<Vec<T>> {
    let path = dir.join(name);
    if !path.exists() {
        if required {
            anyhow::bail!("Required table {} not found in {}", name, dir.display());
        }
        tracing::debug!("{} not present, using an empty table", name);
        return Ok(Vec::new());
    }

    let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    let rows: Vec<T> =
        read_rows(BufReader::new(file)).with_context(|| format!("Failed to parse {}", path.display()))?;
    tracing::info!("  {}: {} rows", name, rows.len());
    Ok(rows)
}

/// Load every lookup table from a directory of CSV files.
pub fn load_tables(dir: &Path) -> Result<LookupTables> {
    tracing::info!("Loading tables from {}", dir.display());

    let holidays: Vec<HolidayRow> = read_table(dir, "holidays.csv", false)?;
    let separate: Vec<SeparateStationRow> = read_table(dir, "separate_stations.csv", false)?;

    Ok(LookupTables {
        operators: read_table(dir, "operators.csv", false)?,
        routes: read_table(dir, "routes.csv", false)?,
        stations: read_table(dir, "stations.csv", true)?,
        station_aliases: read_table(dir, "station_aliases.csv", false)?,
        station_fixes: read_table(dir, "station_fixes.csv", false)?,
        through_services: read_table(dir, "through_services.csv", false)?,
        headsigns: read_table(dir, "headsigns.csv", false)?,
        holidays: holidays.into_iter().map(|h| h.date).collect(),
        special_calendars: read_table(dir, "special_calendars.csv", false)?,
        separate_stations: separate.into_iter().map(|s| s.name).collect(),
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Records from ODPT-style JSON files plus scraped table columns.
pub fn load_records(record_files: &[PathBuf], column_files: &[PathBuf]) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();

    for path in record_files {
        let batch: Vec<RawRecord> = read_json(path)?;
        tracing::info!("  {} records from {}", batch.len(), path.display());
        records.extend(batch);
    }

    for path in column_files {
        let columns: Vec<TableColumn> = read_json(path)?;
        tracing::info!("  {} table columns from {}", columns.len(), path.display());
        records.extend(columns.iter().map(RawRecord::from_table_column));
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_rows() {
        let csv = "\
id,operator,name,code,lat,lon
Toei.Asakusa.Oshiage,Toei,Oshiage,A20,35.7107,139.8133
# temporary platform, no coordinates yet
Keisei.Oshiage.Oshiage,Keisei,Oshiage,,,
";
        let rows: Vec<StationRow> = read_rows(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].code.as_deref(), Some("A20"));
        assert_eq!(rows[1].lat, None);
        assert_eq!(rows[1].name_key(), "Oshiage");
    }

    #[test]
    fn test_through_service_rows() {
        let csv = "\
from_operator,from_route,from_train,from_station,to_operator,to_route,to_train,to_station
Toei,Toei.Asakusa,(\\d+)T,Toei.Asakusa.Oshiage,Keisei,Keisei.Oshiage,$1K,Keisei.Oshiage.Oshiage
";
        let rows: Vec<ThroughServiceRow> = read_rows(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].from_train, "(\\d+)T");
        assert_eq!(rows[0].to_train, "$1K");
    }

    #[test]
    fn test_holiday_rows() {
        let rows: Vec<HolidayRow> = read_rows("date\n2024-04-29\n2024-05-03\n".as_bytes()).unwrap();
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2024, 4, 29).unwrap());
    }

    #[test]
    fn test_bad_row_is_reported() {
        let result: Result<Vec<HolidayRow>> = read_rows("date\nnot-a-date\n".as_bytes());
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Bad row 2"));
    }

    #[test]
    fn test_odpt_record_json() {
        let json = r#"[{
            "owl:sameAs": "odpt.TrainTimetable:Toei.Asakusa.1000T.Weekday",
            "odpt:operator": "odpt.Operator:Toei",
            "odpt:railway": "odpt.Railway:Toei.Asakusa",
            "odpt:trainNumber": "1000T",
            "odpt:calendar": "odpt.Calendar:Weekday",
            "odpt:nextTrainTimetable": "odpt.TrainTimetable:Toei.Asakusa.1001T.Weekday",
            "odpt:previousTrainTimetable": ["odpt.TrainTimetable:Keisei.Oshiage.999K.Weekday"],
            "odpt:trainTimetableObject": [
                {"odpt:departureTime": "05:00", "odpt:departureStation": "odpt.Station:Toei.Asakusa.Oshiage"},
                {"odpt:arrivalTime": "05:03", "odpt:arrivalStation": "odpt.Station:Toei.Asakusa.Asakusa"}
            ]
        }]"#;
        let records: Vec<RawRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(records[0].train_number, "1000T");
        assert_eq!(records[0].calendar_name(), "Weekday");
        assert_eq!(records[0].stops.len(), 2);
        assert_eq!(records[0].stops[1].station(), Some("odpt.Station:Toei.Asakusa.Asakusa"));
        assert_eq!(records[0].next_timetables, vec!["odpt.TrainTimetable:Toei.Asakusa.1001T.Weekday"]);
        assert_eq!(records[0].previous_timetables.len(), 1);
    }

    #[test]
    fn test_partial_realtime_feed() {
        let json = r#"[
            {"odpt:operator": "odpt.Operator:Toei", "odpt:trainNumber": "1000T", "service_date": "2024-04-01",
             "odpt:fromStation": "odpt.Station:Toei.Asakusa.Oshiage", "odpt:delay": 120,
             "dct:valid": "2024-04-01T10:05:00+09:00"},
            {"odpt:operator": "odpt.Operator:Toei", "odpt:trainNumber": "1002T", "service_date": "2024-04-01"}
        ]"#;
        let updates: Vec<RealtimeUpdate> = serde_json::from_str(json).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].delay_secs, Some(120));
        assert!(updates[0].valid_until.is_some());
        assert_eq!(updates[1].delay_secs, None);
        assert_eq!(updates[1].station, None);

        let matcher = RealtimeMatcher::default();
        assert!(matches!(
            matcher.try_match(&updates[1]),
            Err(TransitError::NoStaticMatch(_))
        ));
    }
}
