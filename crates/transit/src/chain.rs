//! Trip chain assembly.
//!
//! Fragments and realized links form a directed graph whose nodes are keys
//! into the fragment pool. Walking it from every chain head yields the
//! ordered fragment lists the sequencer turns into trips.

use std::collections::{BTreeSet, HashSet};

use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::identifiers::FragmentKey;
use crate::models::{FragmentPool, TransitError};
use crate::through_service::LinkSet;

/// Ordered fragment keys making up one trip, head first.
pub type Chain = Vec<FragmentKey>;

#[derive(Debug, Default)]
pub struct ChainSet {
    /// Sorted by head key
    pub chains: Vec<Chain>,
    pub diagnostics: Diagnostics,
}

/// Every pool fragment ends up in exactly one chain.
pub fn build(pool: &FragmentPool, links: &LinkSet) -> ChainSet {
    let destinations: HashSet<&FragmentKey> = links
        .links()
        .filter(|l| pool.contains_key(&l.source))
        .map(|l| &l.destination)
        .collect();

    let mut visited: HashSet<&FragmentKey> = HashSet::with_capacity(pool.len());
    let mut chains = Vec::new();
    let mut diagnostics = Diagnostics::new();

    let heads = pool.keys().filter(|k| !destinations.contains(k));
    for head in heads {
        chains.push(walk(head, pool, links, &mut visited, &mut diagnostics));
    }

    // Whatever is left sits on a cycle with no way in
    let leftovers: BTreeSet<&FragmentKey> =
        pool.keys().filter(|k| !visited.contains(k)).collect();
    for start in leftovers {
        if visited.contains(start) {
            continue;
        }
        chains.push(walk(start, pool, links, &mut visited, &mut diagnostics));
    }

    chains.sort_by(|a, b| a.first().cmp(&b.first()));

    tracing::info!(
        fragments = pool.len(),
        chains = chains.len(),
        through = chains.iter().filter(|c| c.len() > 1).count(),
        "trip chains assembled"
    );

    ChainSet {
        chains,
        diagnostics,
    }
}

fn walk<'a>(
    head: &'a FragmentKey,
    pool: &'a FragmentPool,
    links: &'a LinkSet,
    visited: &mut HashSet<&'a FragmentKey>,
    diagnostics: &mut Diagnostics,
) -> Chain {
    let mut chain = vec![head.clone()];
    let mut in_chain: HashSet<&FragmentKey> = HashSet::from([head]);
    visited.insert(head);

    let mut current = head;
    while let Some(link) = links.outgoing(current) {
        let next = &link.destination;
        if !pool.contains_key(next) {
            break;
        }
        if in_chain.contains(next) {
            diagnostics.record(
                Diagnostic::from_error(&TransitError::CyclicChain(next.clone()))
                    .with_fragment(head.clone()),
            );
            break;
        }
        if visited.contains(next) {
            diagnostics.record(
                Diagnostic::new(
                    DiagnosticKind::ContestedContinuation,
                    format!("{} already belongs to another chain", next),
                )
                .with_fragment(current.clone()),
            );
            break;
        }

        visited.insert(next);
        in_chain.insert(next);
        chain.push(next.clone());
        current = next;
    }

    chain
}
