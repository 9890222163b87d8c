//! C4 — sort & evict (spec.md §4.2).

use crate::error::{BuildError, Result};
use crate::graph::ReverseDepGraph;

/// Everything the sort key and overflow evictor need about one cached
/// dylib, independent of its parsed Mach-O.
#[derive(Debug, Clone)]
pub struct SortableDylib {
    pub install_name: String,
    pub runtime_path: String,
    pub is_catalyst: bool,
    pub text_vm_size: u64,
    /// Install-names of this dylib's direct dependencies among the
    /// *cacheable* set, used to build the reverse-dependency map
    /// `evict_until_fits` needs to tell an actual leaf (spec.md GLOSSARY)
    /// from a dylib other survivors still depend on.
    pub dependencies: Vec<String>,
}

/// Sort key, lexicographically: (explicit order rank or +∞, "mac before
/// Catalyst" bit, runtime-path string).
fn sort_key<'a>(dylib: &'a SortableDylib, ordering: &[String]) -> (usize, bool, &'a str) {
    let rank = ordering
        .iter()
        .position(|name| name == &dylib.install_name)
        .unwrap_or(usize::MAX);
    (rank, dylib.is_catalyst, dylib.runtime_path.as_str())
}

pub fn sort_dylibs(mut dylibs: Vec<SortableDylib>, ordering: &[String]) -> Vec<SortableDylib> {
    dylibs.sort_by(|a, b| sort_key(a, ordering).cmp(&sort_key(b, ordering)));
    dylibs
}

/// Repeatedly evict the heaviest leaf dylib until `fits` reports the
/// remaining set no longer overflows, per spec.md §4.2's overflow handling.
/// `fits` is called with the current (sorted, un-evicted) slice after every
/// eviction; it should reflect whatever sub-cache planning (C5) says about
/// the set's total size.
///
/// Only dylibs that are leaves of the *current* (shrinking) reverse-
/// dependency graph are eligible: evicting anything else would strand a
/// still-present dependent with a missing dependency, breaking
/// self-containment (spec.md §3 "Global invariants").
pub fn evict_until_fits(
    mut dylibs: Vec<SortableDylib>,
    ordering: &[String],
    allow_eviction: bool,
    mut fits: impl FnMut(&[SortableDylib]) -> bool,
) -> Result<(Vec<SortableDylib>, Vec<String>)> {
    let mut evicted = Vec::new();

    let mut graph = ReverseDepGraph::new();
    for dylib in &dylibs {
        for dep in &dylib.dependencies {
            graph.add_edge(dylib.install_name.clone(), dep.clone());
        }
    }

    while !fits(&dylibs) {
        if !allow_eviction {
            return Err(BuildError::CacheOverflow(0));
        }

        // Amongst current leaves, prefer the one absent from the order file
        // (tie-broken by largest __TEXT size); only once no absent-from-
        // order leaf remains do in-order leaves become eligible, tie-broken
        // by highest order-file rank (i.e. latest in the file), never by
        // size (spec.md §4.2).
        let (victim_index, _) = dylibs
            .iter()
            .enumerate()
            .filter(|(_, d)| graph.is_leaf(&d.install_name))
            .max_by_key(|(_, d)| match ordering.iter().position(|name| name == &d.install_name) {
                None => (true, 0usize, d.text_vm_size),
                Some(rank) => (false, rank, 0u64),
            })
            .ok_or(BuildError::BelowMinimumDylibCount)?;

        let victim = dylibs.remove(victim_index);
        graph.remove(&victim.install_name);
        log::warn!("cache overflow: evicting leaf dylib '{}' ({} bytes of __TEXT)", victim.install_name, victim.text_vm_size);
        evicted.push(victim.install_name);
    }

    Ok((dylibs, evicted))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dylib(name: &str, size: u64) -> SortableDylib {
        dylib_depending_on(name, size, &[])
    }

    fn dylib_depending_on(name: &str, size: u64, deps: &[&str]) -> SortableDylib {
        SortableDylib {
            install_name: name.to_string(),
            runtime_path: name.to_string(),
            is_catalyst: false,
            text_vm_size: size,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn sort_respects_explicit_ordering_first() {
        let dylibs = vec![dylib("/usr/lib/b.dylib", 10), dylib("/usr/lib/a.dylib", 10)];
        let ordering = vec!["/usr/lib/b.dylib".to_string()];
        let sorted = sort_dylibs(dylibs, &ordering);
        assert_eq!(sorted[0].install_name, "/usr/lib/b.dylib");
    }

    #[test]
    fn evict_until_fits_stops_when_fits_returns_true() {
        let dylibs = vec![dylib("a", 100), dylib("b", 10)];
        let mut calls = 0;
        let (remaining, evicted) =
            evict_until_fits(dylibs, &[], true, |d| {
                calls += 1;
                d.iter().map(|x| x.text_vm_size).sum::<u64>() <= 50
            })
            .unwrap();
        assert_eq!(evicted, vec!["a".to_string()]);
        assert_eq!(remaining.len(), 1);
        assert!(calls >= 2);
    }

    #[test]
    fn evict_disallowed_is_fatal() {
        let dylibs = vec![dylib("a", 100)];
        let err = evict_until_fits(dylibs, &[], false, |_| false).unwrap_err();
        assert!(matches!(err, BuildError::CacheOverflow(_)));
    }

    #[test]
    fn evict_prefers_highest_order_rank_over_size_when_all_leaves_are_ordered() {
        // Both leaves are present in the order file, so the tie-break must
        // be order-file rank ("prefer last"), not text size — "small" is
        // smaller but ranked after "big" in the order file, so it must be
        // evicted first even though naive size-based tie-break would pick
        // "big".
        let dylibs = vec![dylib("big", 100), dylib("small", 10)];
        let ordering = vec!["big".to_string(), "small".to_string()];
        let (remaining, evicted) = evict_until_fits(dylibs, &ordering, true, |d| d.len() <= 1).unwrap();
        assert_eq!(evicted, vec!["small".to_string()]);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].install_name, "big");
    }

    #[test]
    fn evict_skips_a_dylib_that_still_has_a_cached_dependent() {
        // "b" is bigger and would otherwise be picked first, but "a"
        // depends on it, so evicting "b" first would strand "a" with a
        // missing dependency. Only once "a" (the actual leaf) is gone does
        // "b" become eligible.
        let dylibs = vec![dylib_depending_on("a", 10, &["b"]), dylib("b", 100)];
        let (remaining, evicted) = evict_until_fits(dylibs, &[], true, |d| d.len() <= 1).unwrap();
        assert_eq!(evicted, vec!["a".to_string()]);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].install_name, "b");
    }
}
