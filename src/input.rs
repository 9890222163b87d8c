//! C2 — input loader (spec.md §2/§3).
//!
//! Maps candidate files, classifies each as a cacheable dylib / other dylib
//! / executable / unloadable, and hands the self-contained verifier (C3) its
//! starting lists. File mmap + Mach-O parsing itself is delegated to
//! [`crate::macho::parse`]; this module owns only the classification policy.

use std::fs::File;

use memmap2::Mmap;

use crate::error::{Diagnostics, Result};
use crate::macho::{self, MachoImage};
use crate::model::{InputFile, RequirementState};

/// The outcome of loading one candidate path.
pub enum Classification {
    CacheableDylib(LoadedDylib),
    OtherDylib(LoadedDylib),
    Executable(LoadedDylib),
    Unloadable { path: String, reason: String },
}

/// A successfully-parsed input, still holding the mmap alive so the parsed
/// image's borrows (if any) stay valid for the rest of the build.
pub struct LoadedDylib {
    pub path: String,
    pub install_name: String,
    /// The requirement state of the `InputFile` this was loaded from,
    /// captured by path at load time. Looking this back up later by
    /// `install_name` (which may differ from the path a dylib was staged
    /// at) would silently default to `Unset` for every such dylib.
    pub requirement: RequirementState,
    #[allow(dead_code)]
    mapping: Mmap,
    pub image: macho::ParsedImage,
}

impl LoadedDylib {
    /// The mmap'd bytes, still alive behind `self.mapping` for as long as
    /// this value lives — used by the binder (C7) to read pre-fixup section
    /// bytes without re-reading the file.
    pub fn bytes(&self) -> &[u8] {
        &self.mapping
    }

    /// Builds a fixture backed by an empty anonymous mapping, for tests of
    /// stages past C2 that need a `LoadedDylib` without a real Mach-O file
    /// on disk (e.g. [`crate::verify`]'s fixpoint tests).
    #[cfg(test)]
    pub(crate) fn fixture(path: &str, image: macho::ParsedImage) -> Self {
        Self::fixture_with_requirement(path, image, RequirementState::Unset)
    }

    #[cfg(test)]
    pub(crate) fn fixture_with_requirement(
        path: &str,
        image: macho::ParsedImage,
        requirement: RequirementState,
    ) -> Self {
        let mapping = memmap2::MmapMut::map_anon(1).expect("anon mmap").make_read_only().expect("ro");
        Self {
            path: path.to_string(),
            install_name: image.install_name.clone(),
            requirement,
            mapping,
            image,
        }
    }
}

/// Three disjoint output lists, matching spec.md §4.1's verifier input.
#[derive(Default)]
pub struct LoadedInputs {
    pub cacheable: Vec<LoadedDylib>,
    pub other: Vec<LoadedDylib>,
    pub unloadable: Vec<(String, String)>,
}

/// Load and classify every candidate input file.
///
/// `cacheable_dirs` holds the path prefixes (e.g. `/usr/lib/`,
/// `/System/Library/Frameworks/`) whose dylibs are cache-eligible; anything
/// outside them that still parses as a dylib is classified `OtherDylib`
/// (a dependency the verifier may still need to reason about, e.g. to
/// detect a missing dependency, without itself entering the cache).
pub fn load_inputs(
    inputs: &[InputFile],
    cacheable_dirs: &[&str],
    diagnostics: &mut Diagnostics,
) -> Result<LoadedInputs> {
    let mut out = LoadedInputs::default();

    for input in inputs {
        match load_one(&input.path, input.requirement) {
            Ok(loaded) => {
                let cacheable = cacheable_dirs.iter().any(|dir| loaded.path.starts_with(dir));
                if cacheable {
                    out.cacheable.push(loaded);
                } else {
                    out.other.push(loaded);
                }
            }
            Err(err) => {
                let reason = err.to_string();
                if input.requirement == RequirementState::MustBeIncluded {
                    diagnostics.error(format!(
                        "Required binary not included: '{}' ({reason})",
                        input.path
                    ));
                } else {
                    diagnostics.warning(format!("unloadable input '{}': {reason}", input.path));
                }
                out.unloadable.push((input.path.clone(), reason));
            }
        }
    }

    Ok(out)
}

fn load_one(path: &str, requirement: RequirementState) -> Result<LoadedDylib> {
    let file = File::open(path)?;
    // SAFETY: the file is treated as read-only input for the lifetime of
    // the build; nothing else in this process writes to it concurrently.
    let mapping = unsafe { Mmap::map(&file)? };
    let image = macho::parse(&mapping)?;
    let install_name = if image.install_name().is_empty() {
        path.to_string()
    } else {
        image.install_name().to_string()
    };
    Ok(LoadedDylib {
        path: path.to_string(),
        install_name,
        requirement,
        mapping,
        image,
    })
}
