//! Station canonicalization.
//!
//! Every operator publishes its own id for a shared interchange
//! (`JR-East.Yamanote.Shinagawa`, `Keikyu.Main.Shinagawa`, ...). The
//! resolver folds same-named stations that sit close together into one merge
//! group, answers alias lookups, and falls back to a same-name match for ids
//! no table mentions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use geo::Point;

use crate::config::BuildConfig;
use crate::identifiers::*;
use crate::models::{Result, TransitError};
use crate::spatial::{average_point, within_radius};
use crate::tables::{name_key, LookupTables, StationRow};

/// Prefix of canonical ids given to multi-member merge groups.
pub const MERGED_PREFIX: &str = "Merged";

/// A station as exported: one per merge group.
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalStation {
    pub id: StationIdentifier,
    pub name: Arc<str>,
    /// Position fix if one exists, else the average of member positions
    pub location: Option<Point>,
    /// Raw ids folded into this station, sorted
    pub aliases: BTreeSet<StationIdentifier>,
    pub operators: BTreeSet<OperatorIdentifier>,
    pub codes: Vec<String>,
}

impl CanonicalStation {
    pub fn is_merged(&self) -> bool {
        self.aliases.len() > 1
    }

    pub fn served_by(&self, operator: &OperatorIdentifier) -> bool {
        self.operators.contains(operator)
    }
}

// ============================================================================
// Merge groups
// ============================================================================

struct MergeGroup<'a> {
    group_id: String,
    anchor: Option<Point>,
    members: Vec<&'a StationRow>,
}

fn row_position(row: &StationRow, fixes: &HashMap<&str, Point>) -> Option<Point> {
    if let Some(fix) = fixes.get(strip_namespace(row.id.as_str())) {
        return Some(*fix);
    }
    match (row.lon, row.lat) {
        (Some(lon), Some(lat)) => Some(Point::new(lon, lat)),
        _ => None,
    }
}

/// Group rows by name key. Within one name key a row joins the first group
/// whose first member lies within `radius_m`; otherwise it opens the next
/// suffixed group (`Tokyo`, `Tokyo.1`, ...). Name keys listed in `separate`
/// always open a new group.
fn merge_groups<'a>(
    rows: &[&'a StationRow],
    fixes: &HashMap<&str, Point>,
    separate: &HashSet<&str>,
    radius_m: f64,
) -> Vec<MergeGroup<'a>> {
    let mut groups: Vec<MergeGroup<'a>> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let key = row.name_key();
        let position = row_position(row, fixes);
        let mut suffix = 0usize;

        loop {
            let group_id = if suffix == 0 {
                key.to_owned()
            } else {
                format!("{}.{}", key, suffix)
            };

            let Some(&idx) = by_id.get(&group_id) else {
                by_id.insert(group_id.clone(), groups.len());
                groups.push(MergeGroup {
                    group_id,
                    anchor: position,
                    members: vec![*row],
                });
                break;
            };

            let group = &mut groups[idx];
            let close = !separate.contains(key)
                && matches!((group.anchor, position), (Some(a), Some(p)) if within_radius(a, p, radius_m));
            if close {
                group.members.push(*row);
                break;
            }
            suffix += 1;
        }
    }

    groups
}

// ============================================================================
// Resolver
// ============================================================================

/// Maps raw station ids to canonical stations for one build.
///
/// Construction does all table work up front; lookups only read, apart from
/// memoizing same-name fallbacks.
pub struct StationResolver {
    stations: Vec<Arc<CanonicalStation>>,
    by_alias: HashMap<StationIdentifier, Arc<CanonicalStation>>,
    by_name: HashMap<String, Vec<Arc<CanonicalStation>>>,
    fallback_cache: RwLock<HashMap<(StationIdentifier, OperatorIdentifier), Arc<CanonicalStation>>>,
}

impl StationResolver {
    pub fn new(tables: &LookupTables, config: &BuildConfig) -> Result<Self> {
        if tables.stations.is_empty() {
            return Err(TransitError::MissingTable("stations"));
        }

        let fixes: HashMap<&str, Point> = tables
            .station_fixes
            .iter()
            .map(|f| (strip_namespace(f.station.as_str()), Point::new(f.lon, f.lat)))
            .collect();
        let separate: HashSet<&str> = tables.separate_stations.iter().map(|s| s.as_str()).collect();

        let mut rows: Vec<&StationRow> = tables.stations.iter().collect();
        rows.sort_by(|a, b| strip_namespace(a.id.as_str()).cmp(strip_namespace(b.id.as_str())));
        rows.dedup_by(|a, b| strip_namespace(a.id.as_str()) == strip_namespace(b.id.as_str()));

        let mut stations = Vec::new();
        let mut by_alias: HashMap<StationIdentifier, Arc<CanonicalStation>> = HashMap::new();
        let mut by_name: HashMap<String, Vec<Arc<CanonicalStation>>> = HashMap::new();

        for group in merge_groups(&rows, &fixes, &separate, config.merge_radius_m) {
            let id = if group.members.len() > 1 {
                StationIdentifier::new(format!("{}.{}", MERGED_PREFIX, group.group_id))
            } else {
                StationIdentifier::new(strip_namespace(group.members[0].id.as_str()))
            };

            let positions: Vec<Point> = group
                .members
                .iter()
                .filter_map(|row| row_position(row, &fixes))
                .collect();
            let location = fixes
                .get(id.as_str())
                .copied()
                .or_else(|| average_point(&positions));

            let station = Arc::new(CanonicalStation {
                name: group.members[0].name.as_str().into(),
                location,
                aliases: group
                    .members
                    .iter()
                    .map(|row| StationIdentifier::new(strip_namespace(row.id.as_str())))
                    .collect(),
                operators: group.members.iter().map(|row| row.operator.clone()).collect(),
                codes: group.members.iter().filter_map(|row| row.code.clone()).collect(),
                id,
            });

            for alias in &station.aliases {
                by_alias.insert(alias.clone(), station.clone());
            }
            by_alias.insert(station.id.clone(), station.clone());
            by_name
                .entry(group.members[0].name_key().to_owned())
                .or_default()
                .push(station.clone());
            stations.push(station);
        }

        for row in &tables.station_aliases {
            let target = StationIdentifier::new(strip_namespace(row.station.as_str()));
            match by_alias.get(&target).cloned() {
                Some(station) => {
                    by_alias.insert(StationIdentifier::new(strip_namespace(row.alias.as_str())), station);
                }
                None => tracing::warn!(
                    alias = row.alias.as_str(),
                    target = row.station.as_str(),
                    "station alias points at an unknown station"
                ),
            }
        }

        tracing::info!(
            rows = rows.len(),
            stations = stations.len(),
            merged = stations.iter().filter(|s| s.is_merged()).count(),
            "station merge groups built"
        );

        Ok(Self {
            stations,
            by_alias,
            by_name,
            fallback_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Canonical station for a raw (or already canonical) id seen on `operator`.
    pub fn resolve(
        &self,
        raw: &StationIdentifier,
        operator: &OperatorIdentifier,
    ) -> Result<Arc<CanonicalStation>> {
        let local = StationIdentifier::new(strip_namespace(raw.as_str()));
        if let Some(station) = self.by_alias.get(&local) {
            return Ok(station.clone());
        }

        let cache_key = (local, operator.clone());
        {
            let cache = self.fallback_cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(station) = cache.get(&cache_key) {
                return Ok(station.clone());
            }
        }

        let station = self.same_name_fallback(&cache_key.0, operator)?;
        tracing::debug!(
            raw = cache_key.0.as_str(),
            operator = operator.as_str(),
            canonical = station.id.as_str(),
            "resolved station by name"
        );
        self.fallback_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cache_key, station.clone());
        Ok(station)
    }

    fn same_name_fallback(
        &self,
        raw: &StationIdentifier,
        operator: &OperatorIdentifier,
    ) -> Result<Arc<CanonicalStation>> {
        let unknown = || TransitError::UnknownStation {
            station: raw.clone(),
            operator: operator.clone(),
        };

        let candidates = self.by_name.get(name_key(raw.as_str())).ok_or_else(unknown)?;
        if let [only] = candidates.as_slice() {
            return Ok(only.clone());
        }

        // Same name on several groups: an interchange with another operator
        // is only taken when it is the one group this operator does not serve.
        let foreign: Vec<&Arc<CanonicalStation>> =
            candidates.iter().filter(|s| !s.served_by(operator)).collect();
        match foreign.as_slice() {
            [only] => Ok((*only).clone()),
            _ => Err(unknown()),
        }
    }

    pub fn get(&self, canonical: &StationIdentifier) -> Option<&Arc<CanonicalStation>> {
        self.by_alias.get(canonical).filter(|s| &s.id == canonical)
    }

    pub fn stations(&self) -> &[Arc<CanonicalStation>] {
        &self.stations
    }

    pub fn display_name(&self, canonical: &StationIdentifier) -> Arc<str> {
        match self.get(canonical) {
            Some(station) => station.name.clone(),
            None => canonical.as_str().into(),
        }
    }
}

impl std::fmt::Debug for StationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationResolver")
            .field("stations", &self.stations.len())
            .field("aliases", &self.by_alias.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{StationAliasRow, StationFixRow};
    use approx::assert_relative_eq;

    fn row(id: &str, operator: &str, name: &str, lon: f64, lat: f64) -> StationRow {
        StationRow {
            id: StationIdentifier::new(id),
            operator: OperatorIdentifier::new(operator),
            name: name.into(),
            code: None,
            lat: Some(lat),
            lon: Some(lon),
        }
    }

    fn tables() -> LookupTables {
        LookupTables {
            stations: vec![
                row("Keikyu.Main.Shinagawa", "Keikyu", "Shinagawa", 139.7387, 35.6285),
                row("JR-East.Yamanote.Shinagawa", "JR-East", "Shinagawa", 139.7399, 35.6284),
                row("Toei.Asakusa.Sengakuji", "Toei", "Sengakuji", 139.7404, 35.6386),
                // Same name, far away
                row("Tobu.Noda.Kashiwa", "Tobu", "Kashiwa", 139.9714, 35.8622),
                row("Foo.Bar.Kashiwa", "Foo", "Kashiwa", 135.0, 34.0),
                row("TokyoMetro.Tozai.Waseda", "TokyoMetro", "Waseda", 139.7214, 35.7058),
                row("Toden.Arakawa.Waseda", "Toden", "Waseda", 139.7196, 35.7117),
            ],
            separate_stations: vec!["Waseda".into()],
            ..Default::default()
        }
    }

    fn toei() -> OperatorIdentifier {
        OperatorIdentifier::new("Toei")
    }

    #[test]
    fn test_missing_station_table() {
        let result = StationResolver::new(&LookupTables::default(), &BuildConfig::default());
        assert!(matches!(result, Err(TransitError::MissingTable("stations"))));
    }

    #[test]
    fn test_merge_close_same_name() {
        let resolver = StationResolver::new(&tables(), &BuildConfig::default()).unwrap();

        let a = resolver
            .resolve(&StationIdentifier::new("odpt.Station:Keikyu.Main.Shinagawa"), &toei())
            .unwrap();
        let b = resolver
            .resolve(&StationIdentifier::new("JR-East.Yamanote.Shinagawa"), &toei())
            .unwrap();

        assert_eq!(a.id.as_str(), "Merged.Shinagawa");
        assert_eq!(a.id, b.id);
        assert!(a.is_merged());
        let location = a.location.unwrap();
        assert_relative_eq!(location.x(), 139.7393, epsilon = 1e-9);
        assert_relative_eq!(location.y(), 35.62845, epsilon = 1e-9);
    }

    #[test]
    fn test_far_and_separate_stations_stay_apart() {
        let resolver = StationResolver::new(&tables(), &BuildConfig::default()).unwrap();

        let foo = resolver
            .resolve(&StationIdentifier::new("Foo.Bar.Kashiwa"), &toei())
            .unwrap();
        let tobu = resolver
            .resolve(&StationIdentifier::new("Tobu.Noda.Kashiwa"), &toei())
            .unwrap();
        assert_eq!(foo.id.as_str(), "Foo.Bar.Kashiwa");
        assert_eq!(tobu.id.as_str(), "Tobu.Noda.Kashiwa");

        let metro = resolver
            .resolve(&StationIdentifier::new("TokyoMetro.Tozai.Waseda"), &toei())
            .unwrap();
        assert_eq!(metro.id.as_str(), "TokyoMetro.Tozai.Waseda");
        assert!(!metro.is_merged());
    }

    #[test]
    fn test_single_station_keeps_raw_id() {
        let resolver = StationResolver::new(&tables(), &BuildConfig::default()).unwrap();
        let station = resolver
            .resolve(&StationIdentifier::new("Toei.Asakusa.Sengakuji"), &toei())
            .unwrap();
        assert_eq!(station.id.as_str(), "Toei.Asakusa.Sengakuji");
        assert_eq!(station.name.as_ref(), "Sengakuji");
    }

    #[test]
    fn test_alias_and_position_fix() {
        let mut tables = tables();
        tables.station_aliases.push(StationAliasRow {
            alias: StationIdentifier::new("Keisei.Oshiage.Sengakuji"),
            station: StationIdentifier::new("Toei.Asakusa.Sengakuji"),
        });
        tables.station_fixes.push(StationFixRow {
            station: StationIdentifier::new("Toei.Asakusa.Sengakuji"),
            lat: 35.6390,
            lon: 139.7400,
        });
        let resolver = StationResolver::new(&tables, &BuildConfig::default()).unwrap();

        let station = resolver
            .resolve(&StationIdentifier::new("Keisei.Oshiage.Sengakuji"), &toei())
            .unwrap();
        assert_eq!(station.id.as_str(), "Toei.Asakusa.Sengakuji");
        assert_relative_eq!(station.location.unwrap().y(), 35.6390);
    }

    #[test]
    fn test_same_name_fallback_is_cached() {
        let resolver = StationResolver::new(&tables(), &BuildConfig::default()).unwrap();
        let raw = StationIdentifier::new("Keisei.Oshiage.Sengakuji");

        let first = resolver.resolve(&raw, &OperatorIdentifier::new("Keisei")).unwrap();
        let second = resolver.resolve(&raw, &OperatorIdentifier::new("Keisei")).unwrap();
        assert_eq!(first.id.as_str(), "Toei.Asakusa.Sengakuji");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_ambiguous_name_is_unknown() {
        let resolver = StationResolver::new(&tables(), &BuildConfig::default()).unwrap();
        let result = resolver.resolve(
            &StationIdentifier::new("Keisei.Main.Kashiwa"),
            &OperatorIdentifier::new("Keisei"),
        );
        assert!(matches!(result, Err(TransitError::UnknownStation { .. })));

        // Only one of the Kashiwa groups is foreign to Tobu
        let station = resolver
            .resolve(
                &StationIdentifier::new("Tobu.Urban.Kashiwa"),
                &OperatorIdentifier::new("Tobu"),
            )
            .unwrap();
        assert_eq!(station.id.as_str(), "Foo.Bar.Kashiwa");

        assert!(resolver
            .resolve(&StationIdentifier::new("Nowhere.Line.Atlantis"), &toei())
            .is_err());
    }
}
