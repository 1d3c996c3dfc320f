//! # rail-gtfs-transit
//!
//! Consolidates per-operator train timetables into continuous trips and
//! matches live delay reports onto them.
//!
//! ## Features
//!
//! - **Normalization**: ODPT timetable records and scraped table columns
//!   become fragments timed from the start of the service day
//! - **Station merging**: same-name stations within a radius collapse into
//!   one canonical station
//! - **Through services**: rule-driven continuations stitch fragments of
//!   several operators into one trip, across midnight if needed
//! - **Realtime**: delay reports for any constituent train project onto the
//!   consolidated trip
//! - **Serde** (optional): every input and output type is (de)serializable
//!
//! ## Example
//!
//! ```
//! use rail_gtfs_transit::prelude::*;
//! use rail_gtfs_transit::tables::StationRow;
//!
//! let stations = ["Oshiage", "Asakusa"]
//!     .iter()
//!     .enumerate()
//!     .map(|(i, name)| StationRow {
//!         id: StationIdentifier::new(format!("Toei.Asakusa.{}", name)),
//!         operator: OperatorIdentifier::new("Toei"),
//!         name: name.to_string(),
//!         code: None,
//!         lat: Some(35.71 + i as f64 * 0.01),
//!         lon: Some(139.81),
//!     })
//!     .collect();
//! let tables = LookupTables { stations, ..Default::default() };
//! let config = BuildConfig {
//!     start_date: chrono::NaiveDate::from_ymd_opt(2024, 4, 1),
//!     window_days: 1,
//!     ..Default::default()
//! };
//! let ctx = BuildContext::new(tables, config).unwrap();
//!
//! let record = RawRecord {
//!     route: Some("odpt.Railway:Toei.Asakusa".into()),
//!     train_number: "1000T".into(),
//!     stops: vec![
//!         RawRecordStop {
//!             departure_station: Some("odpt.Station:Toei.Asakusa.Oshiage".into()),
//!             departure_time: Some("05:00".into()),
//!             ..Default::default()
//!         },
//!         RawRecordStop {
//!             arrival_station: Some("odpt.Station:Toei.Asakusa.Asakusa".into()),
//!             arrival_time: Some("05:03".into()),
//!             ..Default::default()
//!         },
//!     ],
//!     ..Default::default()
//! };
//!
//! let output = build(&[record], &ctx).unwrap();
//! assert_eq!(output.trips.len(), 1);
//! assert_eq!(output.trips[0].id.as_str(), "Toei.Asakusa.1000T.20240401");
//! ```

pub mod blocks;
pub mod chain;
pub mod config;
pub mod diagnostics;
pub mod identifiers;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod realtime;
pub mod sequencer;
pub mod spatial;
pub mod stations;
pub mod tables;
pub mod through_service;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub mod prelude {
    pub use crate::config::BuildConfig;
    pub use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
    pub use crate::identifiers::*;
    pub use crate::models::{calendar::*, traits::*, types::*};
    pub use crate::normalize::{normalize, RawRecord, RawRecordStop, TableColumn};
    pub use crate::pipeline::{build, build_standalone, BuildContext, BuildOutput};
    pub use crate::realtime::{
        DelayProjection, ProjectedStopTime, RealtimeMatcher, RealtimeUpdate, TripIndex,
    };
    pub use crate::stations::{CanonicalStation, StationResolver};
    pub use crate::tables::LookupTables;
}

pub use prelude::*;
