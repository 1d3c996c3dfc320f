//! End-to-end consolidation run.
//!
//! Records are normalized and their stations canonicalized in parallel, one
//! task per operator. Once every operator's fragments are in the pool, links,
//! chains and stop times are computed single-threaded over the whole pool.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;

use crate::blocks::BlockMap;
use crate::chain;
use crate::config::BuildConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::identifiers::*;
use crate::models::calendar::dates_between;
use crate::models::{
    CalendarPlanner, FragmentPool, RawFragment, Result, ServiceCalendar, TransitError, Trip,
};
use crate::normalize::{normalize, RawRecord};
use crate::realtime::TripIndex;
use crate::sequencer::StopTimeSequencer;
use crate::stations::StationResolver;
use crate::tables::LookupTables;
use crate::through_service::{LinkSet, ThroughServiceResolver};

/// Everything derived from the lookup tables, built once per run.
#[derive(Debug)]
pub struct BuildContext {
    pub tables: LookupTables,
    pub config: BuildConfig,
    pub stations: Arc<StationResolver>,
    pub planner: CalendarPlanner,
    pub through_services: ThroughServiceResolver,
}

impl BuildContext {
    pub fn new(tables: LookupTables, config: BuildConfig) -> Result<Self> {
        let stations = Arc::new(StationResolver::new(&tables, &config)?);
        let planner = CalendarPlanner::new(
            tables.holidays.iter().copied(),
            tables
                .special_calendars
                .iter()
                .map(|row| (Arc::from(row.calendar.as_str()), row.date)),
        );
        let through_services =
            ThroughServiceResolver::new(&tables.through_services, &stations, &config)?;

        Ok(Self {
            tables,
            config,
            stations,
            planner,
            through_services,
        })
    }

    fn route_is_active(&self, route: &RouteIdentifier) -> bool {
        self.tables.routes.is_empty() || self.tables.route(route).is_some()
    }
}

#[derive(Debug, Default)]
pub struct BuildOutput {
    /// Sorted by trip id
    pub trips: Vec<Trip>,
    /// One per `{route}.{calendar}` referenced by a trip
    pub services: Vec<ServiceCalendar>,
    pub diagnostics: Diagnostics,
}

impl BuildOutput {
    /// Index the trips for realtime matching.
    pub fn index(&self, ctx: &BuildContext) -> TripIndex {
        TripIndex::from_data(self.trips.clone(), ctx.stations.clone())
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Consolidate rail records, following through services across operators.
pub fn build(records: &[RawRecord], ctx: &BuildContext) -> Result<BuildOutput> {
    let Prepared {
        pool,
        window,
        used,
        mut diagnostics,
    } = prepare(records, ctx)?;

    let links = ctx.through_services.resolve(&pool);
    diagnostics.extend(links.diagnostics.iter().cloned());
    let chains = chain::build(&pool, &links);
    diagnostics.extend(chains.diagnostics);

    let sequencer = StopTimeSequencer::new(&ctx.stations, &ctx.tables, &pool);
    let mut trips = Vec::with_capacity(chains.chains.len());
    for chain in &chains.chains {
        let (sequenced, findings) = sequencer.sequence_with_fallback(chain, &pool);
        trips.extend(sequenced);
        diagnostics.extend(findings);
    }

    let blocks = BlockMap::from_pool(&pool);
    Ok(finish(trips, window, &used, diagnostics, ctx, &links, &blocks))
}

/// Consolidate records that never continue into another operator (buses):
/// every fragment becomes its own trip.
pub fn build_standalone(records: &[RawRecord], ctx: &BuildContext) -> Result<BuildOutput> {
    let Prepared {
        pool,
        window,
        used,
        mut diagnostics,
    } = prepare(records, ctx)?;

    let sequencer = StopTimeSequencer::new(&ctx.stations, &ctx.tables, &pool);
    let mut trips = Vec::with_capacity(pool.len());
    for key in pool.keys() {
        let (sequenced, findings) = sequencer.sequence_with_fallback(std::slice::from_ref(key), &pool);
        trips.extend(sequenced);
        diagnostics.extend(findings);
    }

    let blocks = BlockMap::from_pool(&pool);
    Ok(finish(trips, window, &used, diagnostics, ctx, &LinkSet::default(), &blocks))
}

// ============================================================================
// Stages
// ============================================================================

struct Prepared {
    pool: FragmentPool,
    window: (NaiveDate, NaiveDate),
    /// Calendars each route publishes
    used: HashMap<RouteIdentifier, BTreeSet<Arc<str>>>,
    diagnostics: Diagnostics,
}

fn prepare(records: &[RawRecord], ctx: &BuildContext) -> Result<Prepared> {
    if records.is_empty() {
        return Err(TransitError::EmptyInput("no timetable records".into()));
    }

    let fallback = ctx
        .config
        .start_date
        .or_else(|| records.iter().filter_map(|r| r.service_date).min())
        .ok_or_else(|| {
            TransitError::InvalidData(
                "no build start date and no record carries a service date".into(),
            )
        })?;
    let window = ctx.config.window(fallback);

    let mut used: HashMap<RouteIdentifier, BTreeSet<Arc<str>>> = HashMap::new();
    let mut by_operator: BTreeMap<OperatorIdentifier, Vec<&RawRecord>> = BTreeMap::new();
    let mut diagnostics = Diagnostics::new();

    for record in records {
        match record.operator_id() {
            Some(operator) => {
                if let Some(route) = record.route_id() {
                    used.entry(route)
                        .or_default()
                        .insert(Arc::from(record.calendar_name()));
                }
                by_operator.entry(operator).or_default().push(record);
            }
            None => diagnostics.record(Diagnostic::new(
                DiagnosticKind::MalformedRecord,
                format!(
                    "train {:?}: no operator and no route to derive one from",
                    record.train_number
                ),
            )),
        }
    }

    let pass = OperatorPass {
        ctx,
        window,
        used: &used,
    };
    let per_operator: Vec<(Vec<RawFragment>, Diagnostics)> = by_operator
        .par_iter()
        .map(|(operator, records)| pass.operator_fragments(operator, records))
        .collect();

    let mut pool = FragmentPool::new();
    for (fragments, findings) in per_operator {
        diagnostics.extend(findings);
        for fragment in fragments {
            if pool.contains_key(&fragment.key) {
                diagnostics.record(
                    Diagnostic::new(DiagnosticKind::DuplicateFragment, "second record dropped")
                        .with_fragment(fragment.key.clone()),
                );
                continue;
            }
            pool.insert(fragment.key.clone(), fragment);
        }
    }

    if pool.is_empty() {
        return Err(TransitError::EmptyInput(format!(
            "none of {} records produced a usable fragment",
            records.len()
        )));
    }

    tracing::info!(
        records = records.len(),
        operators = by_operator.len(),
        fragments = pool.len(),
        from = %window.0,
        to = %window.1,
        "fragment pool ready"
    );

    Ok(Prepared {
        pool,
        window,
        used,
        diagnostics,
    })
}

/// Per-operator normalization, shared read-only across rayon tasks.
struct OperatorPass<'a> {
    ctx: &'a BuildContext,
    window: (NaiveDate, NaiveDate),
    used: &'a HashMap<RouteIdentifier, BTreeSet<Arc<str>>>,
}

impl OperatorPass<'_> {
    fn operator_fragments(
        &self,
        operator: &OperatorIdentifier,
        records: &[&RawRecord],
    ) -> (Vec<RawFragment>, Diagnostics) {
        let mut fragments = Vec::new();
        let mut diagnostics = Diagnostics::new();

        for record in records {
            if let Some(route) = record.route_id() {
                if !self.ctx.route_is_active(&route) {
                    diagnostics.record(Diagnostic::new(
                        DiagnosticKind::InactiveRoute,
                        format!("train {} on unlisted route {}", record.train_number, route),
                    ));
                    continue;
                }
            }

            let dates = self.service_dates(record);
            let Some(first) = dates.first().copied() else {
                diagnostics.record(Diagnostic::new(
                    DiagnosticKind::InactiveCalendar,
                    format!(
                        "train {}: calendar {} never runs in the build window",
                        record.train_number,
                        record.calendar_name()
                    ),
                ));
                continue;
            };

            let fragment = normalize(record, operator, first)
                .and_then(|fragment| self.canonicalize(fragment))
                .and_then(|fragment| {
                    fragment.validate()?;
                    Ok(fragment)
                });
            let fragment = match fragment {
                Ok(fragment) => fragment,
                Err(e) => {
                    diagnostics.record(Diagnostic::from_error(&e));
                    continue;
                }
            };

            tracing::debug!(
                fragment = %fragment.key,
                stops = fragment.stops.len(),
                dates = dates.len(),
                "normalized"
            );

            for date in &dates[1..] {
                let mut copy = fragment.clone();
                copy.key.service_date = *date;
                fragments.push(copy);
            }
            fragments.push(fragment);
        }

        (fragments, diagnostics)
    }

    /// Explicit service date, else every window date the calendar runs on.
    fn service_dates(&self, record: &RawRecord) -> Vec<NaiveDate> {
        if let Some(date) = record.service_date {
            return vec![date];
        }
        let Some(used) = record.route_id().and_then(|route| self.used.get(&route)) else {
            return Vec::new();
        };
        let calendar = record.calendar_name();

        dates_between(self.window.0, self.window.1)
            .filter(|date| {
                self.ctx
                    .planner
                    .active_calendars(used, *date)
                    .iter()
                    .any(|c| c.as_ref() == calendar)
            })
            .collect()
    }

    /// Replace raw station ids with canonical ones.
    fn canonicalize(&self, mut fragment: RawFragment) -> Result<RawFragment> {
        let operator = fragment.key.operator.clone();
        for stop in &mut fragment.stops {
            stop.station = self.ctx.stations.resolve(&stop.station, &operator)?.id.clone();
        }
        // Two raw ids of one merged station back to back
        fragment.stops.dedup_by(|next, prev| {
            if next.station != prev.station {
                return false;
            }
            prev.departure = next.departure;
            if next.platform.is_some() {
                prev.platform = next.platform.take();
            }
            true
        });
        Ok(fragment)
    }
}

fn finish(
    mut trips: Vec<Trip>,
    window: (NaiveDate, NaiveDate),
    used: &HashMap<RouteIdentifier, BTreeSet<Arc<str>>>,
    mut diagnostics: Diagnostics,
    ctx: &BuildContext,
    links: &LinkSet,
    blocks: &BlockMap,
) -> BuildOutput {
    trips.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.provenance.cmp(&b.provenance)));

    // Two operators publishing the same route id and train number
    trips.dedup_by(|later, kept| {
        if later.id != kept.id {
            return false;
        }
        let mut diagnostic = Diagnostic::new(
            DiagnosticKind::DuplicateFragment,
            format!("trip id {} already used by a train of {}", later.id, kept.operator),
        );
        if let Some(head) = later.provenance.first() {
            diagnostic = diagnostic.with_fragment(head.clone());
        }
        diagnostics.record(diagnostic);
        true
    });

    for trip in &mut trips {
        trip.block_id = blocks.block_of(trip);
    }

    let mut referenced: BTreeMap<ServiceIdentifier, (&RouteIdentifier, Arc<str>)> = BTreeMap::new();
    for trip in &trips {
        if let Some(head) = trip.provenance.first() {
            let calendar = trip
                .service
                .as_str()
                .strip_prefix(head.route.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .unwrap_or_default();
            referenced
                .entry(trip.service.clone())
                .or_insert_with(|| (&trip.route, Arc::from(calendar)));
        }
    }

    let empty = BTreeSet::new();
    let services: Vec<ServiceCalendar> = referenced
        .into_values()
        .map(|(route, calendar)| {
            let used = used.get(route).unwrap_or(&empty);
            ctx.planner
                .service_calendar(route, &calendar, used, window.0, window.1)
        })
        .collect();

    tracing::info!(
        trips = trips.len(),
        through = trips.iter().filter(|t| t.is_through_service()).count(),
        links = links.len(),
        blocks = blocks.len(),
        services = services.len(),
        diagnostics = diagnostics.len(),
        "build finished"
    );

    BuildOutput {
        trips,
        services,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::RawRecordStop;
    use crate::tables::{HeadsignRow, RouteRow, ThroughServiceRow};
    use crate::testing::*;

    fn stop(station: &str, arrival: Option<&str>, departure: Option<&str>) -> RawRecordStop {
        RawRecordStop {
            departure_station: departure.map(|_| format!("odpt.Station:{}", station)),
            departure_time: departure.map(str::to_owned),
            arrival_station: arrival.map(|_| format!("odpt.Station:{}", station)),
            arrival_time: arrival.map(str::to_owned),
            ..Default::default()
        }
    }

    fn record(operator: &str, route: &str, train: &str, stops: Vec<RawRecordStop>) -> RawRecord {
        RawRecord {
            operator: Some(format!("odpt.Operator:{}", operator)),
            route: Some(format!("odpt.Railway:{}", route)),
            train_number: train.into(),
            calendar: Some("odpt.Calendar:Weekday".into()),
            stops,
            ..Default::default()
        }
    }

    fn through_rule() -> ThroughServiceRow {
        ThroughServiceRow {
            from_operator: "X".into(),
            from_route: "X.Line".into(),
            from_train: "*".into(),
            from_station: "S".into(),
            to_operator: "Y".into(),
            to_route: "Y.Line".into(),
            to_train: "*".into(),
            to_station: "S".into(),
        }
    }

    fn context(window_days: u32) -> BuildContext {
        let mut tables = station_tables();
        tables.through_services.push(through_rule());
        let config = BuildConfig {
            start_date: Some(date(1)),
            window_days,
            ..Default::default()
        };
        BuildContext::new(tables, config).unwrap()
    }

    fn scenario_a() -> Vec<RawRecord> {
        vec![
            record(
                "X",
                "X.Line",
                "100",
                vec![
                    stop("P", None, Some("00:50")),
                    stop("S", Some("01:00"), None),
                ],
            ),
            record(
                "Y",
                "Y.Line",
                "200",
                vec![
                    stop("S", None, Some("01:01")),
                    stop("Q", Some("01:10"), Some("01:11")),
                    stop("R", Some("01:20"), None),
                ],
            ),
        ]
    }

    #[test]
    fn test_through_service_build() {
        let ctx = context(1);
        let output = build(&scenario_a(), &ctx).unwrap();

        assert_eq!(output.trips.len(), 1);
        let trip = &output.trips[0];
        assert_eq!(trip.id.as_str(), "X.Line.100.20240401");
        assert!(trip.is_through_service());
        let at_s: Vec<_> = trip
            .stop_times
            .iter()
            .filter(|st| st.station_id.as_str() == "S")
            .collect();
        assert_eq!(at_s.len(), 1);
        assert_eq!((at_s[0].arrival, at_s[0].departure), (3600, 3660));
        assert_eq!(trip.stop_times[2].arrival, 4200);
        assert!(output.diagnostics.is_empty());

        assert_eq!(output.services.len(), 1);
        assert!(output.services[0].runs_on(date(1)));
    }

    #[test]
    fn test_calendar_expansion() {
        // 2024-04-01..07: five weekdays
        let ctx = context(7);
        let output = build(&scenario_a(), &ctx).unwrap();

        assert_eq!(output.trips.len(), 5);
        assert!(output.trips.iter().all(|t| t.provenance.len() == 2));
        let service = &output.services[0];
        assert_eq!(service.service_id.as_str(), "X.Line.Weekday");
        assert!(service.runs_on(date(5)));
        assert!(!service.runs_on(date(6)));
    }

    #[test]
    fn test_repeatable() {
        let ctx = context(3);
        let mut records = scenario_a();
        let first = build(&records, &ctx).unwrap();
        records.reverse();
        let second = build(&records, &ctx).unwrap();
        assert_eq!(first.trips, second.trips);
    }

    #[test]
    fn test_standalone_skips_through_service() {
        let ctx = context(1);
        let output = build_standalone(&scenario_a(), &ctx).unwrap();
        assert_eq!(output.trips.len(), 2);
        assert!(output.trips.iter().all(|t| !t.is_through_service()));
    }

    #[test]
    fn test_bad_records_become_diagnostics() {
        let ctx = context(1);
        let mut records = scenario_a();
        records.push(record(
            "X",
            "X.Line",
            "101",
            vec![stop("P", None, Some("02:00")), stop("Nowhere", Some("02:10"), None)],
        ));
        records.push(record("X", "X.Line", "102", vec![stop("P", None, Some("02:00"))]));
        records.push(scenario_a().remove(1));

        let output = build(&records, &ctx).unwrap();
        assert_eq!(output.trips.len(), 1);
        assert_eq!(output.diagnostics.count(DiagnosticKind::UnknownStation), 1);
        assert_eq!(output.diagnostics.count(DiagnosticKind::MalformedRecord), 1);
        assert_eq!(output.diagnostics.count(DiagnosticKind::DuplicateFragment), 1);
    }

    #[test]
    fn test_route_filter_and_headsign() {
        let mut tables = station_tables();
        tables.routes.push(RouteRow {
            id: "X.Line".into(),
            operator: "X".into(),
            name: "X Line".into(),
            outbound_direction: None,
        });
        tables.headsigns.push(HeadsignRow {
            route: "X.Line".into(),
            destination: "S".into(),
            headsign: "Via S".into(),
        });
        let config = BuildConfig {
            start_date: Some(date(1)),
            window_days: 1,
            ..Default::default()
        };
        let ctx = BuildContext::new(tables, config).unwrap();

        let output = build(&scenario_a(), &ctx).unwrap();
        assert_eq!(output.trips.len(), 1);
        assert_eq!(output.trips[0].headsign.as_ref(), "Via S");
        assert_eq!(output.diagnostics.count(DiagnosticKind::InactiveRoute), 1);
    }

    #[test]
    fn test_empty_input() {
        let ctx = context(1);
        assert!(matches!(build(&[], &ctx), Err(TransitError::EmptyInput(_))));

        let weekend_only = BuildContext::new(
            station_tables(),
            BuildConfig {
                start_date: Some(date(6)),
                window_days: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let result = build(&scenario_a(), &weekend_only);
        assert!(matches!(result, Err(TransitError::EmptyInput(_))));
    }

    #[test]
    fn test_missing_station_table() {
        let result = BuildContext::new(LookupTables::default(), BuildConfig::default());
        assert!(matches!(result, Err(TransitError::MissingTable("stations"))));
    }

    #[test]
    fn test_same_trip_id_from_two_operators() {
        let ctx = context(1);
        let trip = |operator: &str| {
            record(
                operator,
                "Shared.Line",
                "1",
                vec![stop("P", None, Some("06:00")), stop("T", Some("06:10"), None)],
            )
        };

        let output = build(&[trip("Y"), trip("X")], &ctx).unwrap();
        assert_eq!(output.trips.len(), 1);
        assert_eq!(output.trips[0].id.as_str(), "Shared.Line.1.20240401");
        assert_eq!(output.trips[0].operator.as_str(), "X");
        assert_eq!(output.diagnostics.count(DiagnosticKind::DuplicateFragment), 1);
    }

    #[test]
    fn test_block_ids_from_timetable_links() {
        let ctx = context(1);
        let mut outbound = record(
            "X",
            "X.Line",
            "100",
            vec![stop("P", None, Some("06:00")), stop("T", Some("06:10"), None)],
        );
        outbound.id = Some("odpt.TrainTimetable:X.Line.100.Weekday".into());
        outbound.next_timetables = vec!["odpt.TrainTimetable:X.Line.101.Weekday".into()];
        let mut back = record(
            "X",
            "X.Line",
            "101",
            vec![stop("T", None, Some("06:20")), stop("P", Some("06:30"), None)],
        );
        back.id = Some("odpt.TrainTimetable:X.Line.101.Weekday".into());
        let unlinked = record(
            "X",
            "X.Line",
            "102",
            vec![stop("P", None, Some("07:00")), stop("T", Some("07:10"), None)],
        );

        let output = build(&[outbound, back, unlinked], &ctx).unwrap();
        let blocks: Vec<Option<&str>> = output.trips.iter().map(|t| t.block_id.as_deref()).collect();
        assert_eq!(
            blocks,
            vec![
                Some("X.Line.100.Weekday.20240401"),
                Some("X.Line.100.Weekday.20240401"),
                None
            ]
        );
    }

    #[test]
    fn test_realtime_against_build() {
        let ctx = context(1);
        let output = build(&scenario_a(), &ctx).unwrap();
        let matcher = crate::realtime::RealtimeMatcher::new(output.index(&ctx));

        let update = crate::realtime::RealtimeUpdate {
            operator: "Y".into(),
            train_number: "200".into(),
            service_date: date(1),
            station: Some("Q".into()),
            delay_secs: Some(60),
            timestamp: 0,
            valid_until: None,
        };
        let projection = matcher.match_update(&update).unwrap();
        assert_eq!(projection.trip_id.as_str(), "X.Line.100.20240401");
        assert_eq!(projection.stops[0].arrival, 4260);
    }
}
