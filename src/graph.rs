//! SPEC_FULL.md §C.4: a reverse-dependency graph shared by C3 (required-dep
//! promotion), C4 (leaf eviction, spec.md §4.2) and the JSON dependents
//! report. Grounded in `DyldSharedCache::computeReverseDependencyMapForDylib`
//! (`examples/original_source/dyld/common/DyldSharedCache.cpp`), generalized
//! here into a reusable graph instead of a one-off per-call traversal.

use std::collections::{BTreeMap, BTreeSet};

/// A reverse-dependency map over install-names: `dependents_of("libfoo")`
/// lists every install-name whose dependency list names `libfoo`.
#[derive(Debug, Default)]
pub struct ReverseDepGraph {
    /// install-name -> direct dependencies (forward edges, as given)
    forward: BTreeMap<String, BTreeSet<String>>,
    /// install-name -> direct dependents (reverse edges, derived)
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl ReverseDepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dylib` depends on `dependency`.
    pub fn add_edge(&mut self, dylib: impl Into<String>, dependency: impl Into<String>) {
        let dylib = dylib.into();
        let dependency = dependency.into();
        self.reverse
            .entry(dependency.clone())
            .or_default()
            .insert(dylib.clone());
        self.forward.entry(dylib).or_default().insert(dependency);
    }

    /// Direct dependents of `install_name` (spec.md GLOSSARY "Leaf dylib":
    /// a cached dylib with an empty dependents set).
    pub fn dependents_of(&self, install_name: &str) -> impl Iterator<Item = &str> {
        self.reverse
            .get(install_name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn is_leaf(&self, install_name: &str) -> bool {
        self.reverse
            .get(install_name)
            .map(|set| set.is_empty())
            .unwrap_or(true)
    }

    pub fn direct_dependencies_of(&self, install_name: &str) -> impl Iterator<Item = &str> {
        self.forward
            .get(install_name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Every transitive dependent of `install_name`, BFS order, `install_name`
    /// itself excluded. Used by C3's required-dep promotion to find which
    /// "other" dylibs a `MustBeIncluded` one pulls in.
    pub fn transitive_dependents(&self, install_name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut queue: Vec<String> = self.dependents_of(install_name).map(String::from).collect();
        let mut out = Vec::new();
        while let Some(name) = queue.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            out.push(name.clone());
            queue.extend(self.dependents_of(&name).map(String::from));
        }
        out
    }

    /// Every transitive dependency of `install_name`, used the same way by
    /// `findDependentsRecursively`'s dual (promoting a `MustBeIncluded`
    /// dylib's own deps, not just its dependents).
    pub fn transitive_dependencies(&self, install_name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut queue: Vec<String> = self
            .direct_dependencies_of(install_name)
            .map(String::from)
            .collect();
        let mut out = Vec::new();
        while let Some(name) = queue.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            out.push(name.clone());
            queue.extend(self.direct_dependencies_of(&name).map(String::from));
        }
        out
    }

    pub fn remove(&mut self, install_name: &str) {
        if let Some(deps) = self.forward.remove(install_name) {
            for dep in deps {
                if let Some(set) = self.reverse.get_mut(&dep) {
                    set.remove(install_name);
                }
            }
        }
        if let Some(dependents) = self.reverse.remove(install_name) {
            for dependent in dependents {
                if let Some(set) = self.forward.get_mut(&dependent) {
                    set.remove(install_name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReverseDepGraph {
        let mut g = ReverseDepGraph::new();
        g.add_edge("app", "libA");
        g.add_edge("libA", "libB");
        g.add_edge("libC", "libB");
        g
    }

    #[test]
    fn leaf_has_no_dependents() {
        let g = sample();
        assert!(g.is_leaf("app"));
        assert!(!g.is_leaf("libB"));
    }

    #[test]
    fn transitive_dependents_follow_chain() {
        let g = sample();
        let mut dependents = g.transitive_dependents("libB");
        dependents.sort();
        assert_eq!(dependents, vec!["app", "libA", "libC"]);
    }

    #[test]
    fn remove_cleans_both_directions() {
        let mut g = sample();
        g.remove("libA");
        assert!(g.dependents_of("libB").eq(["libC"]));
        assert!(g.direct_dependencies_of("app").eq(Vec::<&str>::new()));
    }
}
