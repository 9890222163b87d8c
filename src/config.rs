//! Config surface (spec.md §6.5). One Rust struct, one field per option,
//! each documented with its single-effect contract. No file/CLI parsing
//! lives here — that belongs to the out-of-scope CLI (spec §1).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalSymbolsMode {
    Keep,
    Unmap,
    Strip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeSigningDigestMode {
    Sha256Only,
    Sha1Only,
    Agile,
}

/// Every recognized build option (spec.md §6.5). Each field's comment is
/// its single-effect contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Base path the writer (C12) derives `.N`/`.symbols` suffixes from.
    pub output_file_path: String,
    /// If set, C9's debug map (SPEC_FULL.md §C.3) is written here too.
    pub output_map_file_path: Option<String>,
    /// Architecture name, looked up in `arch::ARCH_TABLE`.
    pub arch: String,
    /// Platform identifier stored verbatim in the cache header.
    pub platform: u8,
    /// Governs whether the LINKEDIT optimizer strips local symbols.
    pub local_symbol_mode: LocalSymbolsMode,
    /// Enables the external stub-elimination pass and flips the cache type
    /// tag to `Production`.
    pub optimize_stubs: bool,
    /// Enables dlopen-closure prebuilding by the external optimizer.
    pub optimize_dyld_dlopens: bool,
    /// Enables launch-closure prebuilding by the external optimizer.
    pub optimize_dyld_launches: bool,
    /// Which digest(s) the codesigner (C11) computes.
    pub code_signing_digest_mode: CodeSigningDigestMode,
    /// Dylibs present on-disk that should be omitted from the final image
    /// list even though they contributed fixups at build time.
    pub dylibs_removed_during_mastering: Vec<String>,
    /// If true, the images array's inode/modTime fields are copied from the
    /// input files; if false, they're zeroed.
    pub inodes_are_same_as_runtime: bool,
    /// Whether the produced cache type supports runtime ASLR at all.
    pub cache_supports_aslr: bool,
    /// Builds a cache meant for the Simulator rather than the host OS.
    pub for_simulator: bool,
    /// Sets the `locallyBuiltCache` header flag.
    pub is_locally_built_cache: bool,
    pub verbose: bool,
    /// If false, a cache overflow during C4/C5 is fatal rather than
    /// triggering leaf eviction.
    pub evict_leaf_dylibs_on_overflow: bool,
    /// Explicit dylib-order ranks consulted by C4's sort key.
    pub dylib_ordering: Vec<String>,
    /// Explicit per-dylib ordering consulted when emitting `__DATA_DIRTY`
    /// in C6 step 4.
    pub dirty_data_segment_ordering: Vec<String>,
    /// Forwarded, uninterpreted, to the external ObjC/Swift optimizer.
    pub objc_optimizations: bool,
    /// Prefix attached to every `log::Record` target this build emits.
    pub logging_prefix: String,
    /// If set, local (non-exported) symbols are written to a side file
    /// instead of the symbols sub-cache.
    pub local_symbols_path: Option<String>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            output_file_path: String::new(),
            output_map_file_path: None,
            arch: "arm64e".to_string(),
            platform: 1,
            local_symbol_mode: LocalSymbolsMode::Keep,
            optimize_stubs: false,
            optimize_dyld_dlopens: false,
            optimize_dyld_launches: false,
            code_signing_digest_mode: CodeSigningDigestMode::Sha256Only,
            dylibs_removed_during_mastering: Vec::new(),
            inodes_are_same_as_runtime: false,
            cache_supports_aslr: true,
            for_simulator: false,
            is_locally_built_cache: true,
            verbose: false,
            evict_leaf_dylibs_on_overflow: true,
            dylib_ordering: Vec::new(),
            dirty_data_segment_ordering: Vec::new(),
            objc_optimizations: true,
            logging_prefix: "shared_cache_builder".to_string(),
            local_symbols_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pick_safe_values() {
        let opts = CreateOptions::default();
        assert!(opts.evict_leaf_dylibs_on_overflow);
        assert_eq!(opts.local_symbol_mode, LocalSymbolsMode::Keep);
    }
}
