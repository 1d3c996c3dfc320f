//! Through-service resolution.
//!
//! A through service is one physical train that keeps running onto another
//! operator's line under a new train number. Each rule of the
//! through-services table says where that hand-over happens; this module
//! finds which fragment in the pool actually continues which.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use chrono::NaiveDate;
use regex::{Captures, Regex};

use crate::config::BuildConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::identifiers::*;
use crate::models::{FragmentPool, RawFragment, Result, TransitError, SECONDS_PER_DAY};
use crate::stations::StationResolver;
use crate::tables::ThroughServiceRow;

/// A realized continuation between two fragments.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChainLink {
    pub source: FragmentKey,
    pub destination: FragmentKey,
    /// The rule that produced this link, spelled out from its table row
    pub rule: Arc<str>,
    pub from_station: StationIdentifier,
    pub to_station: StationIdentifier,
    /// Seconds between the source's arrival and the destination's departure
    pub gap_secs: u32,
}

/// Realized links, keyed by source.
#[derive(Debug, Default)]
pub struct LinkSet {
    links: BTreeMap<FragmentKey, ChainLink>,
    pub diagnostics: Diagnostics,
}

impl LinkSet {
    pub fn from_links(links: impl IntoIterator<Item = ChainLink>) -> Self {
        Self {
            links: links.into_iter().map(|l| (l.source.clone(), l)).collect(),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn outgoing(&self, source: &FragmentKey) -> Option<&ChainLink> {
        self.links.get(source)
    }

    pub fn links(&self) -> impl Iterator<Item = &ChainLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

// ============================================================================
// Rules
// ============================================================================

/// Compile a train number pattern: a bare `*` matches anything, anything
/// else is an anchored regular expression.
fn compile_pattern(pattern: &str) -> Result<Regex> {
    let source = match pattern.trim() {
        "*" | "" => "^(.*)$".to_owned(),
        p => format!("^(?:{})$", p),
    };
    Regex::new(&source).map_err(|e| TransitError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason: e.to_string(),
    })
}

/// `$1` or `${1}` inside a destination train pattern.
static CAPTURE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(?:\{(\d+)\}|(\d+))").unwrap());

/// Destination pattern for one source match, `$n` replaced by the
/// (escaped) capture.
fn destination_pattern(template: &str, caps: &Captures<'_>) -> String {
    if template.is_empty() || template == "*" {
        return "*".to_owned();
    }
    CAPTURE_REF
        .replace_all(template, |refs: &Captures<'_>| {
            let group = refs
                .get(1)
                .or_else(|| refs.get(2))
                .and_then(|m| m.as_str().parse::<usize>().ok());
            group
                .and_then(|g| caps.get(g))
                .map(|m| regex::escape(m.as_str()))
                .unwrap_or_default()
        })
        .into_owned()
}

#[derive(Debug)]
struct CompiledRule {
    label: Arc<str>,
    from_operator: OperatorIdentifier,
    from_route: RouteIdentifier,
    from_train: Regex,
    from_station: StationIdentifier,
    to_operator: OperatorIdentifier,
    to_route: RouteIdentifier,
    to_train: String,
    to_station: StationIdentifier,
}

/// Finds the continuation of every fragment that ends where a rule says a
/// through service hands over.
#[derive(Debug)]
pub struct ThroughServiceResolver {
    rules: Vec<CompiledRule>,
    lookahead_secs: u32,
    skipped: Vec<Diagnostic>,
}

impl ThroughServiceResolver {
    /// Compile rules. Rule stations are canonicalized with `stations`; a rule
    /// naming a station nobody knows is skipped with a diagnostic.
    pub fn new(
        rows: &[ThroughServiceRow],
        stations: &StationResolver,
        config: &BuildConfig,
    ) -> Result<Self> {
        let mut rules = Vec::with_capacity(rows.len());
        let mut skipped = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            let from_train = compile_pattern(&row.from_train)?;
            // Validate the destination template with captures stubbed out
            compile_pattern(&CAPTURE_REF.replace_all(&row.to_train, ".*"))?;

            let from_station = stations.resolve(&row.from_station, &row.from_operator);
            let to_station = stations.resolve(&row.to_station, &row.to_operator);
            let (from_station, to_station) = match (from_station, to_station) {
                (Ok(from), Ok(to)) => (from.id.clone(), to.id.clone()),
                (Err(e), _) | (_, Err(e)) => {
                    skipped.push(Diagnostic::new(
                        DiagnosticKind::UnknownStation,
                        format!("through-service rule {} skipped: {}", index, e),
                    ));
                    continue;
                }
            };

            let from_operator = OperatorIdentifier::new(strip_namespace(row.from_operator.as_str()));
            let from_route = RouteIdentifier::new(strip_namespace(row.from_route.as_str()));
            let to_operator = OperatorIdentifier::new(strip_namespace(row.to_operator.as_str()));
            let to_route = RouteIdentifier::new(strip_namespace(row.to_route.as_str()));
            let to_train = row.to_train.trim().to_owned();
            let label = format!(
                "{}/{}/{}@{} > {}/{}/{}@{}",
                from_operator,
                from_route,
                row.from_train.trim(),
                from_station,
                to_operator,
                to_route,
                to_train,
                to_station
            );

            rules.push(CompiledRule {
                label: label.into(),
                from_operator,
                from_route,
                from_train,
                from_station,
                to_operator,
                to_route,
                to_train,
                to_station,
            });
        }

        Ok(Self {
            rules,
            lookahead_secs: config.lookahead_secs,
            skipped,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Realize links over the whole pool. Deterministic: the same pool and
    /// rule set always give the same links.
    pub fn resolve(&self, pool: &FragmentPool) -> LinkSet {
        let mut diagnostics = Diagnostics::new();
        for diagnostic in &self.skipped {
            diagnostics.record(diagnostic.clone());
        }

        // Destinations by (operator, route, first station, date)
        let mut heads: HashMap<(&OperatorIdentifier, &RouteIdentifier, &StationIdentifier, NaiveDate), Vec<&RawFragment>> =
            HashMap::new();
        // Sources by (operator, route)
        let mut by_route: HashMap<(&OperatorIdentifier, &RouteIdentifier), Vec<&RawFragment>> = HashMap::new();

        for fragment in pool.values() {
            let key = &fragment.key;
            if let Some(first) = fragment.first_stop() {
                heads
                    .entry((&key.operator, &key.route, &first.station, key.service_date))
                    .or_default()
                    .push(fragment);
            }
            by_route.entry((&key.operator, &key.route)).or_default().push(fragment);
        }

        let mut patterns: HashMap<String, Option<Regex>> = HashMap::new();
        let mut candidates: BTreeMap<&FragmentKey, Vec<Candidate<'_>>> = BTreeMap::new();

        for rule in &self.rules {
            let Some(sources) = by_route.get(&(&rule.from_operator, &rule.from_route)) else {
                continue;
            };

            for &source in sources {
                let Some(last) = source.last_stop() else { continue };
                if last.station != rule.from_station {
                    continue;
                }
                let Some(caps) = rule.from_train.captures(source.key.train_number.as_str()) else {
                    continue;
                };

                let pattern_text = destination_pattern(&rule.to_train, &caps);
                let pattern = patterns
                    .entry(pattern_text)
                    .or_insert_with_key(|text| compile_pattern(text).ok());
                let Some(pattern) = pattern.as_ref() else { continue };

                let found = candidates.entry(&source.key).or_default();
                let source_end = i64::from(source.end_offset());

                // Offsets run up to two days past their service date, so the
                // continuation can be declared on a neighbouring date.
                let span = 2 + i64::from(self.lookahead_secs / SECONDS_PER_DAY);
                for day_delta in -2..=span {
                    let Some(date) = shift_date(source.key.service_date, day_delta) else {
                        continue;
                    };
                    let Some(dests) = heads.get(&(&rule.to_operator, &rule.to_route, &rule.to_station, date)) else {
                        continue;
                    };

                    for &dest in dests {
                        if dest.key == source.key
                            || !pattern.is_match(dest.key.train_number.as_str())
                        {
                            continue;
                        }
                        let start = i64::from(dest.start_offset()) + day_delta * i64::from(SECONDS_PER_DAY);
                        let gap = start - source_end;
                        if gap < 0 || gap > i64::from(self.lookahead_secs) {
                            continue;
                        }
                        found.push(Candidate {
                            gap: gap as u32,
                            destination: &dest.key,
                            rule: &rule.label,
                            from_station: &rule.from_station,
                            to_station: &rule.to_station,
                            source: &source.key,
                        });
                    }
                }
            }
        }

        // Best candidate per source
        let mut chosen: Vec<Candidate<'_>> = Vec::new();
        let mut sources_of: BTreeMap<&FragmentKey, Vec<(&FragmentKey, u32)>> = BTreeMap::new();

        for (source, mut found) in candidates {
            if found.is_empty() {
                diagnostics.record(
                    Diagnostic::new(
                        DiagnosticKind::UnmatchedContinuation,
                        format!(
                            "no continuation within {}s of its terminal",
                            self.lookahead_secs
                        ),
                    )
                    .with_fragment(source.clone()),
                );
                continue;
            }

            // Rules yielding the same link tie-break on their content, not
            // their position in the table
            found.sort_by(|a, b| (a.gap, a.destination, a.rule).cmp(&(b.gap, b.destination, b.rule)));
            found.dedup_by(|a, b| a.destination == b.destination);
            let best = found[0].clone();

            let tied: Vec<String> = found
                .iter()
                .filter(|c| c.gap == best.gap)
                .map(|c| c.destination.to_string())
                .collect();
            if tied.len() > 1 {
                diagnostics.record(
                    Diagnostic::new(
                        DiagnosticKind::AmbiguousContinuation,
                        format!(
                            "{} continuations {}s after arrival ({}), took {}",
                            tied.len(),
                            best.gap,
                            tied.join(", "),
                            best.destination
                        ),
                    )
                    .with_fragment(source.clone()),
                );
            }

            sources_of
                .entry(best.destination)
                .or_default()
                .push((source, best.gap));
            chosen.push(best);
        }

        // A destination claimed by several sources keeps the closest one
        let mut winners: HashMap<&FragmentKey, &FragmentKey> = HashMap::new();
        for (destination, mut claims) in sources_of {
            claims.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));
            let (winner, _) = claims[0];
            for (loser, _) in &claims[1..] {
                diagnostics.record(
                    Diagnostic::new(
                        DiagnosticKind::ContestedContinuation,
                        format!("{} already continues {}", destination, winner),
                    )
                    .with_fragment((*loser).clone()),
                );
            }
            winners.insert(destination, winner);
        }

        let links = chosen.into_iter().filter_map(|c| {
            if winners.get(c.destination) != Some(&c.source) {
                return None;
            }
            Some(ChainLink {
                source: c.source.clone(),
                destination: c.destination.clone(),
                rule: c.rule.clone(),
                from_station: c.from_station.clone(),
                to_station: c.to_station.clone(),
                gap_secs: c.gap,
            })
        });

        let mut set = LinkSet::from_links(links);
        tracing::info!(
            rules = self.rules.len(),
            links = set.len(),
            findings = diagnostics.len(),
            "through services resolved"
        );
        set.diagnostics = diagnostics;
        set
    }
}

#[derive(Clone)]
struct Candidate<'a> {
    gap: u32,
    destination: &'a FragmentKey,
    rule: &'a Arc<str>,
    from_station: &'a StationIdentifier,
    to_station: &'a StationIdentifier,
    source: &'a FragmentKey,
}

fn shift_date(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    date.checked_add_signed(chrono::Duration::days(days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn rule(from: (&str, &str, &str, &str), to: (&str, &str, &str, &str)) -> ThroughServiceRow {
        ThroughServiceRow {
            from_operator: from.0.into(),
            from_route: from.1.into(),
            from_train: from.2.into(),
            from_station: from.3.into(),
            to_operator: to.0.into(),
            to_route: to.1.into(),
            to_train: to.2.into(),
            to_station: to.3.into(),
        }
    }

    fn resolver(rows: &[ThroughServiceRow]) -> ThroughServiceResolver {
        let stations = station_resolver();
        ThroughServiceResolver::new(rows, &stations, &BuildConfig::default()).unwrap()
    }

    fn x_to_y() -> ThroughServiceRow {
        rule(("X", "X.Line", "*", "S"), ("Y", "Y.Line", "*", "S"))
    }

    #[test]
    fn test_invalid_pattern() {
        let stations = station_resolver();
        let bad = rule(("X", "X.Line", "(", "S"), ("Y", "Y.Line", "*", "S"));
        let result = ThroughServiceResolver::new(&[bad], &stations, &BuildConfig::default());
        assert!(matches!(result, Err(TransitError::InvalidPattern { .. })));
    }

    #[test]
    fn test_links_nearest_continuation() {
        let pool = pool(vec![
            fragment("X", "X.Line", "100", 1, &[("P", 3000, 3000), ("S", 3600, 3600)]),
            fragment("Y", "Y.Line", "200", 1, &[("S", 3660, 3660), ("Q", 4000, 4000)]),
            fragment("Y", "Y.Line", "202", 1, &[("S", 4200, 4200), ("Q", 4500, 4500)]),
            // Leaves before the source arrives
            fragment("Y", "Y.Line", "198", 1, &[("S", 3500, 3500), ("Q", 3900, 3900)]),
        ]);

        let links = resolver(&[x_to_y()]).resolve(&pool);
        assert_eq!(links.len(), 1);
        let link = links.links().next().unwrap();
        assert_eq!(link.destination.train_number.as_str(), "200");
        assert_eq!(link.gap_secs, 60);
        assert_eq!(link.to_station.as_str(), "S");
        assert!(links.diagnostics.is_empty());
    }

    #[test]
    fn test_unmatched_outside_lookahead() {
        let pool = pool(vec![
            fragment("X", "X.Line", "100", 1, &[("P", 3000, 3000), ("S", 3600, 3600)]),
            fragment("Y", "Y.Line", "200", 1, &[("S", 9000, 9000), ("Q", 9500, 9500)]),
        ]);

        let links = resolver(&[x_to_y()]).resolve(&pool);
        assert!(links.is_empty());
        assert_eq!(links.diagnostics.count(DiagnosticKind::UnmatchedContinuation), 1);
    }

    #[test]
    fn test_ambiguous_tie_takes_smallest_key() {
        let pool = pool(vec![
            fragment("X", "X.Line", "100", 1, &[("P", 3000, 3000), ("S", 3600, 3600)]),
            fragment("Y", "Y.Line", "201", 1, &[("S", 3660, 3660), ("Q", 4000, 4000)]),
            fragment("Y", "Y.Line", "200", 1, &[("S", 3660, 3660), ("R", 4000, 4000)]),
        ]);

        let links = resolver(&[x_to_y()]).resolve(&pool);
        assert_eq!(links.links().next().unwrap().destination.train_number.as_str(), "200");
        assert_eq!(links.diagnostics.count(DiagnosticKind::AmbiguousContinuation), 1);
    }

    #[test]
    fn test_capture_expansion() {
        let row = rule(("X", "X.Line", r"(\d+)K", "S"), ("Y", "Y.Line", "${1}T", "S"));
        let pool = pool(vec![
            fragment("X", "X.Line", "1234K", 1, &[("P", 3000, 3000), ("S", 3600, 3600)]),
            fragment("Y", "Y.Line", "9999T", 1, &[("S", 3610, 3610), ("Q", 4000, 4000)]),
            fragment("Y", "Y.Line", "1234T", 1, &[("S", 3900, 3900), ("Q", 4300, 4300)]),
            // Does not match the source pattern
            fragment("X", "X.Line", "1234", 1, &[("P", 3000, 3000), ("S", 3600, 3600)]),
        ]);

        let links = resolver(&[row]).resolve(&pool);
        assert_eq!(links.len(), 1);
        let link = links.links().next().unwrap();
        assert_eq!(link.source.train_number.as_str(), "1234K");
        assert_eq!(link.destination.train_number.as_str(), "1234T");
    }

    #[test]
    fn test_next_day_continuation() {
        let pool = pool(vec![
            fragment("X", "X.Line", "100", 1, &[("P", 85800, 85800), ("S", 86100, 86100)]),
            fragment("Y", "Y.Line", "200", 2, &[("S", 120, 120), ("Q", 600, 600)]),
        ]);

        let links = resolver(&[x_to_y()]).resolve(&pool);
        let link = links.links().next().unwrap();
        assert_eq!(link.destination.service_date, date(2));
        assert_eq!(link.gap_secs, 420);
    }

    #[test]
    fn test_contested_destination() {
        let pool = pool(vec![
            fragment("X", "X.Line", "100", 1, &[("P", 3000, 3000), ("S", 3600, 3600)]),
            fragment("X", "X.Line", "102", 1, &[("P", 3100, 3100), ("S", 3620, 3620)]),
            fragment("Y", "Y.Line", "200", 1, &[("S", 3660, 3660), ("Q", 4000, 4000)]),
        ]);

        let links = resolver(&[x_to_y()]).resolve(&pool);
        assert_eq!(links.len(), 1);
        assert_eq!(links.links().next().unwrap().source.train_number.as_str(), "102");
        assert_eq!(links.diagnostics.count(DiagnosticKind::ContestedContinuation), 1);
    }

    #[test]
    fn test_rule_order_independent() {
        let pool = pool(vec![
            fragment("X", "X.Line", "100", 1, &[("P", 3000, 3000), ("S", 3600, 3600)]),
            fragment("Y", "Y.Line", "200", 1, &[("S", 3660, 3660), ("Q", 4000, 4000)]),
            fragment("Z", "Z.Line", "300", 1, &[("S", 3700, 3700), ("R", 4000, 4000)]),
        ]);
        let to_z = rule(("X", "X.Line", "*", "S"), ("Z", "Z.Line", "*", "S"));

        let forward = resolver(&[x_to_y(), to_z.clone()]).resolve(&pool);
        let backward = resolver(&[to_z, x_to_y()]).resolve(&pool);
        let pairs = |set: &LinkSet| -> Vec<(FragmentKey, FragmentKey)> {
            set.links().map(|l| (l.source.clone(), l.destination.clone())).collect()
        };
        assert_eq!(pairs(&forward), pairs(&backward));
        assert_eq!(pairs(&forward)[0].1.train_number.as_str(), "200");
    }

    #[test]
    fn test_equivalent_rules_keep_one_link() {
        let pool = pool(vec![
            fragment("X", "X.Line", "100", 1, &[("P", 3000, 3000), ("S", 3600, 3600)]),
            fragment("Y", "Y.Line", "100", 1, &[("S", 3660, 3660), ("Q", 4000, 4000)]),
        ]);
        let by_number = rule(("X", "X.Line", r"(\d+)", "S"), ("Y", "Y.Line", "$1", "S"));

        let forward = resolver(&[x_to_y(), by_number.clone()]).resolve(&pool);
        let backward = resolver(&[by_number, x_to_y()]).resolve(&pool);
        let links = |set: &LinkSet| -> Vec<ChainLink> { set.links().cloned().collect() };
        assert_eq!(links(&forward).len(), 1);
        assert_eq!(links(&forward), links(&backward));
        assert_eq!(forward.links().next().unwrap().rule.as_ref(), r"X/X.Line/(\d+)@S > Y/Y.Line/$1@S");
    }

    #[test]
    fn test_unknown_rule_station_skipped() {
        let row = rule(("X", "X.Line", "*", "Atlantis"), ("Y", "Y.Line", "*", "S"));
        let resolver = resolver(&[row]);
        assert_eq!(resolver.rule_count(), 0);
        let links = resolver.resolve(&FragmentPool::new());
        assert_eq!(links.diagnostics.count(DiagnosticKind::UnknownStation), 1);
    }
}
