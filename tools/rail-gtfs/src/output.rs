use anyhow::{Context, Result};
use chrono::NaiveDate;
use rail_gtfs_transit::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One `{route}.{calendar}` service: weekly pattern, exceptions and the
/// dates they add up to.
#[derive(Debug, Serialize)]
pub struct ServiceDates {
    pub service_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub weekdays: Vec<String>,
    pub added_dates: Vec<NaiveDate>,
    pub removed_dates: Vec<NaiveDate>,
    pub dates: Vec<NaiveDate>,
}

fn sorted(dates: &std::collections::HashSet<NaiveDate>) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = dates.iter().copied().collect();
    dates.sort();
    dates
}

impl From<&ServiceCalendar> for ServiceDates {
    fn from(calendar: &ServiceCalendar) -> Self {
        Self {
            service_id: calendar.service_id.to_string(),
            start_date: calendar.start_date,
            end_date: calendar.end_date,
            weekdays: calendar.weekdays.days().iter().map(|d| d.to_string()).collect(),
            added_dates: sorted(&calendar.added_dates),
            removed_dates: sorted(&calendar.removed_dates),
            dates: calendar.active_dates(),
        }
    }
}

/// A canonical station as trips refer to it.
#[derive(Debug, Serialize)]
pub struct StationOutput {
    pub id: String,
    pub name: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub codes: Vec<String>,
    pub operators: Vec<String>,
    /// Raw ids merged into this station
    pub aliases: Vec<String>,
}

impl From<&CanonicalStation> for StationOutput {
    fn from(station: &CanonicalStation) -> Self {
        Self {
            id: station.id.to_string(),
            name: station.name.to_string(),
            lat: station.location.map(|p| p.y()),
            lon: station.location.map(|p| p.x()),
            codes: station.codes.clone(),
            operators: station.operators.iter().map(|o| o.to_string()).collect(),
            aliases: station.aliases.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Everything a build writes. The configuration goes along so a later
/// `realtime` run resolves stations the same way.
#[derive(Debug, Serialize)]
pub struct BuildSummary<'a> {
    pub config: &'a BuildConfig,
    pub stations: Vec<StationOutput>,
    pub trips: &'a [Trip],
    pub services: Vec<ServiceDates>,
}

impl<'a> BuildSummary<'a> {
    pub fn new(ctx: &'a BuildContext, built: &'a BuildOutput) -> Self {
        Self {
            config: &ctx.config,
            stations: ctx
                .stations
                .stations()
                .iter()
                .map(|s| StationOutput::from(s.as_ref()))
                .collect(),
            trips: &built.trips,
            services: built.services.iter().map(ServiceDates::from).collect(),
        }
    }
}

pub fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// One diagnostic per line.
pub fn write_diagnostics<W: Write>(diagnostics: &Diagnostics, mut writer: W) -> Result<()> {
    for diagnostic in diagnostics.iter() {
        writeln!(writer, "{}", diagnostic)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rail_gtfs_transit::tables::{StationFixRow, StationRow};

    #[test]
    fn test_diagnostic_lines() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.record(Diagnostic::new(DiagnosticKind::InactiveRoute, "train 1000T on Toei.Arakawa"));
        diagnostics.record(Diagnostic::new(DiagnosticKind::MalformedRecord, "no stops"));

        let mut buffer = Vec::new();
        write_diagnostics(&diagnostics, &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(
            text,
            "[inactive-route] train 1000T on Toei.Arakawa\n[malformed-record] no stops\n"
        );
    }

    #[test]
    fn test_station_output_keeps_position_fix() {
        let station = |id: &str, operator: &str, lat: f64| StationRow {
            id: StationIdentifier::new(id),
            operator: OperatorIdentifier::new(operator),
            name: "Oshiage".into(),
            code: Some(format!("{}-20", operator)),
            lat: Some(lat),
            lon: Some(139.8133),
        };
        let tables = LookupTables {
            stations: vec![
                station("Toei.Asakusa.Oshiage", "Toei", 35.7107),
                station("Keisei.Oshiage.Oshiage", "Keisei", 35.7109),
            ],
            station_fixes: vec![StationFixRow {
                station: StationIdentifier::new("Toei.Asakusa.Oshiage"),
                lat: 35.7100,
                lon: 139.8130,
            }],
            ..Default::default()
        };
        let ctx = BuildContext::new(tables, BuildConfig::default()).unwrap();
        let built = BuildOutput::default();

        let summary = BuildSummary::new(&ctx, &built);
        assert_eq!(summary.stations.len(), 1);
        let merged = &summary.stations[0];
        assert_eq!(merged.id, "Merged.Oshiage");
        assert_eq!(merged.aliases, vec!["Keisei.Oshiage.Oshiage", "Toei.Asakusa.Oshiage"]);

        let json = serde_json::to_value(&summary).unwrap();
        let station = &json["stations"][0];
        // The fixed member pulls the merged position off its published one
        let lat = station["lat"].as_f64().unwrap();
        assert!((lat - 35.71045).abs() < 1e-9);
        assert!((station["lon"].as_f64().unwrap() - 139.81315).abs() < 1e-9);
        assert_eq!(station["codes"], serde_json::json!(["Keisei-20", "Toei-20"]));
        assert_eq!(json["config"]["merge_radius_m"], 1000.0);
    }
}
