//! Stop-time sequencing.
//!
//! Turns an ordered list of fragment keys into one [`Trip`]: offsets of
//! later fragments are rebased onto the head fragment's service day, the
//! hand-over station appears once, and the result must be strictly
//! increasing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::diagnostics::Diagnostic;
use crate::identifiers::*;
use crate::models::{
    DirectionId, FragmentPool, RawFragment, Result, StopTime, TransitError, Trip, SECONDS_PER_DAY,
};
use crate::stations::StationResolver;
use crate::tables::{name_key, LookupTables};

/// Per-build lookups the sequencer decorates trips with.
pub struct StopTimeSequencer<'a> {
    stations: &'a StationResolver,
    /// (route, canonical destination) -> headsign
    headsigns: HashMap<(RouteIdentifier, StationIdentifier), Arc<str>>,
    /// route -> raw direction label treated as outbound
    outbound: HashMap<RouteIdentifier, Arc<str>>,
}

impl<'a> StopTimeSequencer<'a> {
    pub fn new(stations: &'a StationResolver, tables: &LookupTables, pool: &FragmentPool) -> Self {
        let operator_of = |route: &RouteIdentifier| -> OperatorIdentifier {
            tables
                .route(route)
                .map(|r| r.operator.clone())
                .unwrap_or_else(|| {
                    OperatorIdentifier::new(route.as_str().split('.').next().unwrap_or_default())
                })
        };

        let mut headsigns = HashMap::new();
        for row in &tables.headsigns {
            let route = RouteIdentifier::new(strip_namespace(row.route.as_str()));
            match stations.resolve(&row.destination, &operator_of(&route)) {
                Ok(station) => {
                    headsigns.insert((route, station.id.clone()), Arc::from(row.headsign.as_str()));
                }
                Err(e) => tracing::warn!(route = route.as_str(), "headsign rule skipped: {}", e),
            }
        }

        // Declared outbound direction, else the smallest label seen on the route
        let mut outbound: BTreeMap<RouteIdentifier, Arc<str>> = BTreeMap::new();
        for fragment in pool.values() {
            if let Some(direction) = &fragment.direction {
                outbound
                    .entry(fragment.key.route.clone())
                    .and_modify(|d| {
                        if direction < d {
                            *d = direction.clone();
                        }
                    })
                    .or_insert_with(|| direction.clone());
            }
        }
        for route in &tables.routes {
            if let Some(direction) = route.outbound_direction.as_deref() {
                outbound.insert(
                    RouteIdentifier::new(strip_namespace(route.id.as_str())),
                    Arc::from(strip_namespace(direction)),
                );
            }
        }

        Self {
            stations,
            headsigns,
            outbound: outbound.into_iter().collect(),
        }
    }

    fn direction(&self, head: &RawFragment) -> DirectionId {
        match (&head.direction, self.outbound.get(&head.key.route)) {
            (Some(direction), Some(outbound)) if direction != outbound => DirectionId::Inbound,
            _ => DirectionId::Outbound,
        }
    }

    fn headsign(&self, head: &RawFragment, destination: &StationIdentifier) -> Arc<str> {
        if let Some(rule) = self.headsigns.get(&(head.key.route.clone(), destination.clone())) {
            return rule.clone();
        }
        let name = self.stations.display_name(destination);
        match head.train_type.as_deref() {
            Some(train_type) => format!("({}) {}", name_key(train_type), name).into(),
            None => name,
        }
    }

    /// Sequence one chain. Fails on the first boundary where offsets would
    /// decrease.
    pub fn sequence(&self, chain: &[FragmentKey], pool: &FragmentPool) -> Result<Trip> {
        let lookup = |key: &FragmentKey| {
            pool.get(key)
                .ok_or_else(|| TransitError::InvalidData(format!("{} is not in the pool", key)))
        };

        let head_key = chain
            .first()
            .ok_or_else(|| TransitError::InvalidData("empty chain".into()))?;
        let head = lookup(head_key)?;

        let mut stop_times: Vec<StopTime> = Vec::new();
        let mut fragment_starts = Vec::with_capacity(chain.len());
        for key in chain {
            let fragment = lookup(key)?;
            let non_monotonic = || TransitError::NonMonotonicChain {
                head: head_key.clone(),
                at: key.clone(),
            };

            let day_delta = (fragment.key.service_date - head.key.service_date).num_days();
            let shift = day_delta * i64::from(SECONDS_PER_DAY);
            let rebase = |offset: u32| -> Result<u32> {
                u32::try_from(i64::from(offset) + shift).map_err(|_| non_monotonic())
            };

            for (i, stop) in fragment.stops.iter().enumerate() {
                let arrival = rebase(stop.arrival)?;
                let departure = rebase(stop.departure)?;

                let len = stop_times.len();
                let floor = len
                    .checked_sub(2)
                    .map(|i| stop_times[i].departure);

                match stop_times.last_mut() {
                    // Junction: one stop, arrival from the earlier side,
                    // departure from the later one
                    Some(last) if last.station_id == stop.station => {
                        if departure < last.arrival || floor.is_some_and(|f| departure <= f) {
                            return Err(non_monotonic());
                        }
                        last.departure = departure;
                        if stop.platform.is_some() {
                            last.platform = stop.platform.clone();
                        }
                    }
                    Some(last) if arrival < last.departure || departure <= last.departure => {
                        return Err(non_monotonic());
                    }
                    _ => stop_times.push(StopTime {
                        station_id: stop.station.clone(),
                        arrival,
                        departure,
                        stop_sequence: len as u32,
                        platform: stop.platform.clone(),
                    }),
                }
                if i == 0 {
                    fragment_starts.push(stop_times.len() - 1);
                }
            }
        }

        let destination = stop_times
            .last()
            .map(|st| st.station_id.clone())
            .ok_or_else(|| TransitError::InvalidData(format!("{} has no stops", head_key)))?;

        Ok(Trip {
            id: Trip::make_id(head_key),
            route: head.key.route.clone(),
            operator: head.key.operator.clone(),
            train_number: head.key.train_number.clone(),
            direction: self.direction(head),
            headsign: self.headsign(head, &destination),
            train_name: head.train_name.clone(),
            service: Trip::make_service(&head.key.route, &head.calendar),
            service_date: head.key.service_date,
            stop_times,
            provenance: chain.to_vec(),
            fragment_starts,
            block_id: None,
        })
    }

    /// Sequence a chain, splitting it at every boundary that fails. Each
    /// piece is exported as its own trip.
    pub fn sequence_with_fallback(
        &self,
        chain: &[FragmentKey],
        pool: &FragmentPool,
    ) -> (Vec<Trip>, Vec<Diagnostic>) {
        let mut trips = Vec::new();
        let mut diagnostics = Vec::new();
        let mut remaining = chain;

        while !remaining.is_empty() {
            match self.sequence(remaining, pool) {
                Ok(trip) => {
                    trips.push(trip);
                    break;
                }
                Err(error) => {
                    diagnostics.push(Diagnostic::from_error(&error));
                    let TransitError::NonMonotonicChain { at, .. } = error else {
                        break;
                    };
                    let split = remaining
                        .iter()
                        .position(|k| *k == at)
                        .filter(|i| *i > 0)
                        .unwrap_or(1);

                    match self.sequence(&remaining[..split], pool) {
                        Ok(trip) => trips.push(trip),
                        Err(e) => diagnostics.push(Diagnostic::from_error(&e)),
                    }
                    remaining = &remaining[split..];
                }
            }
        }

        for diagnostic in &diagnostics {
            tracing::warn!(kind = diagnostic.kind.as_str(), "{}", diagnostic);
        }
        (trips, diagnostics)
    }
}
