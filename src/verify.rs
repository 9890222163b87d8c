//! C3 — self-contained verifier (spec.md §4.1).
//!
//! Takes the three disjoint lists produced by the input loader (C2) and
//! applies the five eviction/promotion rules to a fixed point, so that the
//! cacheable set that comes out is closed under (non-weak) dependency.

use indexmap::IndexMap;

use crate::error::Diagnostics;
use crate::graph::ReverseDepGraph;
use crate::input::LoadedInputs;
use crate::macho::DependencyKind;
use crate::model::RequirementState;

/// A small hard-coded set of install-names that are never cached, per
/// spec.md §4.1 rule 2 ("Blacklist"). Recovered from
/// `DyldSharedCache::isPathBlackListed` in `DyldSharedCache.cpp`; kept tiny
/// since the actual modern list is OS-version-dependent and out of this
/// crate's scope to track exactly.
const BLACKLISTED_INSTALL_NAMES: &[&str] = &["/usr/lib/system/introspection/libdispatch.dylib"];

/// Install-name prefixes/paths that are root-overridable (spec.md §4.6 pass
/// 1, and SPEC_FULL.md §C.2). Recovered from `DyldSharedCache::isOverridablePath`.
const OVERRIDABLE_PATHS: &[&str] = &[
    "/usr/lib/system/",
    "/usr/lib/libSystem.B.dylib",
    "/usr/lib/libobjc.A.dylib",
];

pub fn is_overridable_path(install_name: &str) -> bool {
    OVERRIDABLE_PATHS
        .iter()
        .any(|prefix| install_name.starts_with(prefix))
}

pub fn has_non_overridable_path(install_name: &str) -> bool {
    !is_overridable_path(install_name)
}

struct Candidate {
    path: String,
    install_name: String,
    requirement: RequirementState,
    /// (install_name, weak) pairs.
    dependencies: Vec<(String, bool)>,
}

/// The subset of the original [`LoadedInputs`] that survived verification,
/// in the order C3 last saw them (sort order is C4's job, not this one's).
pub struct VerifiedInputs {
    pub cacheable_install_names: Vec<String>,
    pub evictions: Vec<(String, String)>,
}

fn dependencies_of(image: &crate::macho::ParsedImage) -> Vec<(String, bool)> {
    image
        .dependencies()
        .iter()
        .map(|d| (d.install_name.clone(), d.kind == DependencyKind::Weak))
        .collect()
}

pub fn verify(inputs: &LoadedInputs, diagnostics: &mut Diagnostics) -> VerifiedInputs {
    let mut cacheable: IndexMap<String, Candidate> = IndexMap::new();
    let mut originally_must_include: Vec<String> = Vec::new();
    for dylib in &inputs.cacheable {
        if dylib.requirement == RequirementState::MustBeIncluded {
            originally_must_include.push(dylib.install_name.clone());
        }
    }
    for dylib in &inputs.cacheable {
        let dependencies = dependencies_of(&dylib.image);
        cacheable.insert(
            dylib.install_name.clone(),
            Candidate {
                path: dylib.path.clone(),
                install_name: dylib.install_name.clone(),
                requirement: dylib.requirement,
                dependencies,
            },
        );
    }

    // "Other" dylibs (C2's second list) never enter the cache on their own,
    // but rule 5 below can pull one in as a dependency of a MustBeIncluded
    // dylib.
    let other_by_name: IndexMap<String, &crate::input::LoadedDylib> =
        inputs.other.iter().map(|d| (d.install_name.clone(), d)).collect();

    let mut evictions: Vec<(String, String)> = Vec::new();
    let mut promoted: Vec<String> = Vec::new();

    loop {
        // Rule 5: required-dep promotion. Walk every transitive non-weak
        // dependency reachable from a MustBeIncluded (or already-promoted)
        // dylib; any such dependency currently sitting in the "other" list
        // is raised to MustBeIncludedForDependent and pulled into the
        // cacheable set, so rule 3 below judges it as present rather than
        // missing. Run before this iteration's eviction rules so a freshly
        // promoted dylib is immediately subject to (and can immediately
        // satisfy) them.
        let mut stack: Vec<String> = cacheable
            .values()
            .filter(|c| {
                matches!(
                    c.requirement,
                    RequirementState::MustBeIncluded | RequirementState::MustBeIncludedForDependent
                )
            })
            .map(|c| c.install_name.clone())
            .collect();
        let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();
        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let deps = if let Some(candidate) = cacheable.get(&name) {
                candidate.dependencies.clone()
            } else if let Some(dylib) = other_by_name.get(&name) {
                dependencies_of(&dylib.image)
            } else {
                Vec::new()
            };
            for (dep, weak) in deps {
                if weak {
                    continue;
                }
                // `!promoted.contains` makes promotion one-shot per name:
                // without it, a promoted dylib that a later rule evicts
                // (e.g. its own missing dependency) would be re-promoted
                // on every subsequent iteration forever, since nothing
                // else ever removes it from `other_by_name`.
                if !cacheable.contains_key(&dep) && !promoted.contains(&dep) {
                    if let Some(dylib) = other_by_name.get(&dep) {
                        cacheable.insert(
                            dep.clone(),
                            Candidate {
                                path: dylib.path.clone(),
                                install_name: dep.clone(),
                                requirement: RequirementState::MustBeIncludedForDependent,
                                dependencies: dependencies_of(&dylib.image),
                            },
                        );
                        promoted.push(dep.clone());
                    }
                }
                stack.push(dep);
            }
        }

        let mut graph = ReverseDepGraph::new();
        for candidate in cacheable.values() {
            for (dep, _weak) in &candidate.dependencies {
                graph.add_edge(&candidate.install_name, dep);
            }
        }

        let mut to_evict: Vec<(String, String)> = Vec::new();

        // Rule 1: bad-zippered twin.
        for candidate in cacheable.values() {
            for (dep, weak) in &candidate.dependencies {
                if *weak {
                    continue;
                }
                if let Some(twin) = dep.strip_prefix("/System/iOSSupport") {
                    if cacheable.contains_key(dep) && !cacheable.contains_key(twin) {
                        to_evict.push((
                            dep.clone(),
                            format!("unzippered twin of '{twin}' mismatched with zippered client"),
                        ));
                    }
                }
            }
        }

        // Rule 2: blacklist, plus direct dependents.
        for name in BLACKLISTED_INSTALL_NAMES {
            if cacheable.contains_key(*name) {
                to_evict.push((name.to_string(), "blacklisted install name".to_string()));
                for dependent in graph.dependents_of(name) {
                    to_evict.push((dependent.to_string(), format!("depends on blacklisted '{name}'")));
                }
            }
        }

        // Rule 3: missing non-weak dependency.
        for candidate in cacheable.values() {
            for (dep, weak) in &candidate.dependencies {
                if *weak {
                    continue;
                }
                if !cacheable.contains_key(dep) {
                    to_evict.push((
                        candidate.install_name.clone(),
                        format!("Could not find dependency '{dep}'"),
                    ));
                }
            }
        }

        // Rule 4: unused-leaf eviction.
        for candidate in cacheable.values() {
            if candidate.requirement == RequirementState::MustBeExcludedIfUnused
                && graph.is_leaf(&candidate.install_name)
            {
                to_evict.push((
                    candidate.install_name.clone(),
                    "unused leaf marked MustBeExcludedIfUnused".to_string(),
                ));
            }
        }

        if to_evict.is_empty() {
            // No more evictions (and no more promotions, or this iteration
            // would have produced more candidates for rules 1-4 to judge) —
            // the fixpoint is reached.
            break;
        }

        for (name, reason) in to_evict {
            if cacheable.shift_remove(&name).is_some() {
                log::debug!("evicting '{name}': {reason}");
                evictions.push((name, reason));
            }
        }
    }

    // Rule 5 (cont'd): any dylib that was required up front, or pulled in
    // from the "other" list as a transitive dependency of one, and didn't
    // survive the fixpoint above (directly evicted, or a non-weak dep of
    // something evicted) is a hard failure, not a silent drop.
    let mut must_survive = originally_must_include;
    for name in &promoted {
        if !must_survive.contains(name) {
            must_survive.push(name.clone());
        }
    }
    for name in &must_survive {
        if !cacheable.contains_key(name) {
            let reason = evictions
                .iter()
                .find(|(evicted, _)| evicted == name)
                .map(|(_, reason)| reason.clone())
                .unwrap_or_else(|| "not present in input set".to_string());
            diagnostics.error(format!("Required binary not included: {name} ({reason})"));
        }
    }

    VerifiedInputs {
        cacheable_install_names: cacheable.values().map(|c| c.install_name.clone()).collect(),
        evictions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::LoadedDylib;
    use crate::macho::{Dependency, DependencyKind, ParsedImage};

    #[test]
    fn overridable_path_table() {
        assert!(is_overridable_path("/usr/lib/system/libdispatch.dylib"));
        assert!(!is_overridable_path("/usr/lib/libfoo.dylib"));
        assert!(has_non_overridable_path("/usr/lib/libfoo.dylib"));
    }

    fn image(install_name: &str, deps: &[&str]) -> ParsedImage {
        ParsedImage {
            install_name: install_name.to_string(),
            dependencies: deps
                .iter()
                .map(|d| Dependency {
                    install_name: d.to_string(),
                    kind: DependencyKind::Load,
                    current_version: 0,
                    compatibility_version: 0,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// A `MustBeIncluded` dylib whose dependency is missing must surface as
    /// a fatal diagnostic, not silently vanish because the post-fixpoint
    /// scan only re-checked survivors (regression: rule 5's check used to
    /// filter `cacheable.values()` and then ask `cacheable.contains_key`,
    /// which is trivially always true).
    #[test]
    fn missing_dependency_of_required_dylib_is_reported() {
        let inputs = LoadedInputs {
            cacheable: vec![LoadedDylib::fixture_with_requirement(
                "/usr/lib/libneeds.dylib",
                image("/usr/lib/libneeds.dylib", &["/usr/lib/libmissing.dylib"]),
                RequirementState::MustBeIncluded,
            )],
            other: Vec::new(),
            unloadable: Vec::new(),
        };
        let mut diagnostics = Diagnostics::new();
        let result = verify(&inputs, &mut diagnostics);
        assert!(result.cacheable_install_names.is_empty());
        assert!(diagnostics.has_error());
    }

    #[test]
    fn self_contained_set_survives_verification() {
        let inputs = LoadedInputs {
            cacheable: vec![
                LoadedDylib::fixture_with_requirement(
                    "/usr/lib/liba.dylib",
                    image("/usr/lib/liba.dylib", &["/usr/lib/libb.dylib"]),
                    RequirementState::MustBeIncluded,
                ),
                LoadedDylib::fixture_with_requirement(
                    "/usr/lib/libb.dylib",
                    image("/usr/lib/libb.dylib", &[]),
                    RequirementState::MustBeIncluded,
                ),
            ],
            other: Vec::new(),
            unloadable: Vec::new(),
        };
        let mut diagnostics = Diagnostics::new();
        let result = verify(&inputs, &mut diagnostics);
        assert!(!diagnostics.has_error());
        assert_eq!(result.cacheable_install_names.len(), 2);
    }

    /// Rule 5: a non-weak dependency of a `MustBeIncluded` dylib that
    /// lives in the "other" list (not originally requested for caching) is
    /// promoted to `MustBeIncludedForDependent` and pulled into the
    /// cacheable set rather than making its dependent look like it has a
    /// missing dependency.
    #[test]
    fn other_dylib_is_promoted_as_required_dependency() {
        let inputs = LoadedInputs {
            cacheable: vec![LoadedDylib::fixture_with_requirement(
                "/usr/lib/libneeds.dylib",
                image("/usr/lib/libneeds.dylib", &["/usr/lib/libhelper.dylib"]),
                RequirementState::MustBeIncluded,
            )],
            other: vec![LoadedDylib::fixture("/usr/lib/libhelper.dylib", image("/usr/lib/libhelper.dylib", &[]))],
            unloadable: Vec::new(),
        };
        let mut diagnostics = Diagnostics::new();
        let result = verify(&inputs, &mut diagnostics);
        assert!(!diagnostics.has_error());
        assert!(result.cacheable_install_names.contains(&"/usr/lib/libhelper.dylib".to_string()));
        assert!(result.cacheable_install_names.contains(&"/usr/lib/libneeds.dylib".to_string()));
    }

    /// If the promoted-in dependency itself fails verification (here: it
    /// has a missing non-weak dependency of its own), the eviction stands
    /// and is reported as a fatal diagnostic rather than silently dropped.
    #[test]
    fn promoted_dependency_that_still_fails_is_reported() {
        let inputs = LoadedInputs {
            cacheable: vec![LoadedDylib::fixture_with_requirement(
                "/usr/lib/libneeds.dylib",
                image("/usr/lib/libneeds.dylib", &["/usr/lib/libhelper.dylib"]),
                RequirementState::MustBeIncluded,
            )],
            other: vec![LoadedDylib::fixture(
                "/usr/lib/libhelper.dylib",
                image("/usr/lib/libhelper.dylib", &["/usr/lib/libmissing.dylib"]),
            )],
            unloadable: Vec::new(),
        };
        let mut diagnostics = Diagnostics::new();
        let result = verify(&inputs, &mut diagnostics);
        assert!(diagnostics.has_error());
        assert!(!result.cacheable_install_names.contains(&"/usr/lib/libhelper.dylib".to_string()));
    }
}
