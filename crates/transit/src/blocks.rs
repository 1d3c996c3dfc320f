//! Vehicle blocks from explicit timetable links.
//!
//! ODPT records can name the timetables a vehicle runs as before and after
//! the current one. Fragments connected through those links on one service
//! date form a block, exported as the trips' `block_id`. Fragments without
//! links, or whose links reach no other fragment, get no block.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;

use crate::identifiers::FragmentKey;
use crate::models::{FragmentPool, Trip};

/// Block id of every fragment that belongs to one.
#[derive(Debug, Default)]
pub struct BlockMap {
    blocks: BTreeMap<FragmentKey, Arc<str>>,
}

impl BlockMap {
    /// Connected components over previous/next links, per service date.
    ///
    /// A block is named after its smallest timetable id and the date, so the
    /// same input always gives the same ids.
    pub fn from_pool(pool: &FragmentPool) -> Self {
        let mut by_timetable: HashMap<(NaiveDate, &str), &FragmentKey> = HashMap::new();
        for fragment in pool.values() {
            if let Some(timetable) = fragment.timetable.as_deref() {
                by_timetable.insert((fragment.key.service_date, timetable), &fragment.key);
            }
        }

        // Undirected edges, only between fragments that exist
        let mut edges: BTreeMap<&FragmentKey, BTreeSet<&FragmentKey>> = BTreeMap::new();
        for fragment in pool.values() {
            let date = fragment.key.service_date;
            for linked in fragment.previous.iter().chain(&fragment.next) {
                let Some(&other) = by_timetable.get(&(date, linked.as_ref())) else {
                    tracing::debug!(fragment = %fragment.key, linked = linked.as_ref(), "linked timetable not in pool");
                    continue;
                };
                if other == &fragment.key {
                    continue;
                }
                edges.entry(&fragment.key).or_default().insert(other);
                edges.entry(other).or_default().insert(&fragment.key);
            }
        }

        let mut blocks = BTreeMap::new();
        for &start in edges.keys() {
            if blocks.contains_key(start) {
                continue;
            }

            let mut members = BTreeSet::from([start]);
            let mut pending = vec![start];
            while let Some(key) = pending.pop() {
                for &next in edges.get(key).into_iter().flatten() {
                    if members.insert(next) {
                        pending.push(next);
                    }
                }
            }

            let name = members
                .iter()
                .filter_map(|key| pool.get(*key).and_then(|f| f.timetable.as_deref()))
                .min()
                .unwrap_or_default();
            let id: Arc<str> = format!("{}.{}", name, start.service_date.format("%Y%m%d")).into();
            for key in members {
                blocks.insert(key.clone(), id.clone());
            }
        }

        tracing::debug!(fragments = blocks.len(), "blocks assigned");
        Self { blocks }
    }

    pub fn get(&self, key: &FragmentKey) -> Option<&Arc<str>> {
        self.blocks.get(key)
    }

    /// Block of the first fragment of `trip` that has one.
    pub fn block_of(&self, trip: &Trip) -> Option<Arc<str>> {
        trip.provenance.iter().find_map(|key| self.get(key)).cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawFragment;
    use crate::testing::*;

    fn linked(
        train: &str,
        day: u32,
        previous: &[&str],
        next: &[&str],
    ) -> RawFragment {
        let mut fragment = fragment("X", "X.Line", train, day, &[("P", 1000, 1000), ("S", 2000, 2000)]);
        fragment.timetable = Some(format!("X.Line.{}.Weekday", train).into());
        fragment.previous = previous.iter().map(|id| Arc::from(*id)).collect();
        fragment.next = next.iter().map(|id| Arc::from(*id)).collect();
        fragment
    }

    #[test]
    fn test_linked_fragments_share_block() {
        let pool = pool(vec![
            linked("100", 1, &[], &["X.Line.101.Weekday"]),
            // Only the later train declares the link back
            linked("101", 1, &[], &[]),
            linked("102", 1, &["X.Line.101.Weekday"], &[]),
            linked("200", 1, &[], &[]),
            // Link to a timetable nobody published
            linked("300", 1, &["X.Line.299.Weekday"], &[]),
        ]);
        let blocks = BlockMap::from_pool(&pool);

        let key = |train: &str| FragmentKey::new("X", "X.Line", train, date(1));
        let block = blocks.get(&key("100")).unwrap();
        assert_eq!(block.as_ref(), "X.Line.100.Weekday.20240401");
        assert_eq!(blocks.get(&key("101")), Some(block));
        assert_eq!(blocks.get(&key("102")), Some(block));
        assert!(blocks.get(&key("200")).is_none());
        assert!(blocks.get(&key("300")).is_none());
        assert_eq!(blocks.len(), 3);
    }

    #[test]
    fn test_blocks_are_per_service_date() {
        let pool = pool(vec![
            linked("100", 1, &[], &["X.Line.101.Weekday"]),
            linked("101", 1, &[], &[]),
            linked("100", 2, &[], &["X.Line.101.Weekday"]),
            linked("101", 2, &[], &[]),
        ]);
        let blocks = BlockMap::from_pool(&pool);

        let first = blocks.get(&FragmentKey::new("X", "X.Line", "101", date(1))).unwrap();
        let second = blocks.get(&FragmentKey::new("X", "X.Line", "101", date(2))).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.as_ref(), "X.Line.100.Weekday.20240402");
    }

    #[test]
    fn test_unlinked_pool_has_no_blocks() {
        let pool = pool(vec![fragment("X", "X.Line", "100", 1, &[("P", 0, 0), ("S", 60, 60)])]);
        assert!(BlockMap::from_pool(&pool).is_empty());
    }
}
