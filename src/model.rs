//! Spec.md §3 DATA MODEL: the value types every other stage of the pipeline
//! reads and writes. `ArchLayout` lives in [`crate::arch`]; everything below
//! is new here.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::macho::{Fixup, MachoImage};

/// Where an `InputFile` stands relative to "must it end up in the cache".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementState {
    Unset,
    MustBeIncluded,
    MustBeIncludedForDependent,
    MustBeExcludedIfUnused,
}

/// A single candidate file handed to the input loader (C2), before
/// self-containment verification (C3) decides its fate.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub path: String,
    pub requirement: RequirementState,
    pub diagnostics: Vec<String>,
}

impl InputFile {
    pub fn new(path: impl Into<String>, requirement: RequirementState) -> Self {
        Self {
            path: path.into(),
            requirement,
            diagnostics: Vec::new(),
        }
    }
}

/// How a region name is classified, independent of which concrete `__FOO`
/// segment names land there (spec.md §4.4 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegionKind {
    Text,
    DataConst,
    Data,
    Auth,
    AuthConst,
    DataDirty,
    Linkedit,
    CodeSignature,
}

impl RegionKind {
    pub fn name(&self) -> &'static str {
        match self {
            RegionKind::Text => "__TEXT",
            RegionKind::DataConst => "__DATA_CONST",
            RegionKind::Data => "__DATA",
            RegionKind::Auth => "__AUTH",
            RegionKind::AuthConst => "__AUTH_CONST",
            RegionKind::DataDirty => "__DATA_DIRTY",
            RegionKind::Linkedit => "__LINKEDIT",
            RegionKind::CodeSignature => "__CODE_SIGNATURE",
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            RegionKind::DataConst
                | RegionKind::Data
                | RegionKind::Auth
                | RegionKind::AuthConst
                | RegionKind::DataDirty
        )
    }
}

/// Where one source segment of one dylib landed: destination region, offset
/// within it, and how many bytes were actually copied (which can be less
/// than the segment's vmsize for coalesced trailing sections).
#[derive(Debug, Clone)]
pub struct SegmentMapping {
    pub source_segment_index: usize,
    pub region: RegionKind,
    pub dst_offset_in_region: u64,
    pub dst_size: u64,
    pub copy_size: u64,
}

/// Which of this dylib's sections were deduplicated into the shared string
/// pool rather than copied verbatim (spec.md §4.4 step 1 "coalesced trailing
/// sections").
#[derive(Debug, Clone, Default)]
pub struct TextCoalescer {
    pub coalesced_sections: Vec<String>,
}

/// A cached dylib plus everything the pipeline has computed about its
/// placement so far. Holds the parsed Mach-O behind a boxed trait object
/// per SPEC_FULL.md §B — the concrete parser is an implementation detail,
/// not a pipeline dependency.
pub struct DylibInfo {
    pub install_name: String,
    pub path: String,
    pub image: Box<dyn MachoImage>,
    pub segment_mappings: Vec<SegmentMapping>,
    pub text_coalescer: TextCoalescer,
    /// Index of the `SubCache` whose ASLR tracker owns this dylib's DATA
    /// fixups.
    pub owning_subcache: usize,
    /// Index of this dylib within the final sorted, cached list — this is
    /// the `imageIndex` used throughout the patch table and tries.
    pub image_index: usize,
}

impl DylibInfo {
    pub fn fixups(&self) -> &[Fixup] {
        self.image.fixups()
    }
}

/// A contiguous, same-protection range of bytes within one sub-cache, in
/// both VM and file space (spec.md §3 `Region`).
#[derive(Debug, Clone)]
pub struct Region {
    pub kind: RegionKind,
    pub buffer: Vec<u8>,
    pub size_in_use: u64,
    pub unslid_load_address: u64,
    pub cache_file_offset: u64,
    pub init_prot: i32,
    pub max_prot: i32,
}

impl Region {
    pub fn new(kind: RegionKind, capacity: u64) -> Self {
        Self {
            kind,
            buffer: vec![0u8; capacity as usize],
            size_in_use: 0,
            unslid_load_address: 0,
            cache_file_offset: 0,
            init_prot: 0b011,
            max_prot: 0b111,
        }
    }
}

/// Per-sub-cache relocation tracker (spec.md §3 `ASLR tracker`). Tracks one
/// bit per 4-byte slot across the sub-cache's concatenated DATA regions,
/// plus side tables for metadata that doesn't fit in the pointer itself.
#[derive(Debug, Clone, Default)]
pub struct AslrTracker {
    /// Set of slot indices (slot = byte offset / 4) that must be rebased.
    bits: BTreeMap<u64, ()>,
    /// Explicit 32-bit rebase target for architectures whose in-situ value
    /// can't hold the full target.
    pub explicit_targets: BTreeMap<u64, u32>,
    /// High-8 TBI byte per slot.
    pub high8: BTreeMap<u64, u8>,
    /// arm64e authentication metadata per slot.
    pub auth: BTreeMap<u64, PointerMetaData>,
}

/// `{diversity:16, addrDiv:1, key:2, authenticated:1, high8:8}` (GLOSSARY).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerMetaData {
    pub diversity: u16,
    pub addr_div: bool,
    pub key: u8,
    pub authenticated: bool,
    pub high8: u8,
}

impl AslrTracker {
    pub fn set_bit(&mut self, byte_offset: u64) {
        debug_assert_eq!(byte_offset % 4, 0, "ASLR slots are 4-byte aligned");
        self.bits.insert(byte_offset / 4, ());
    }

    pub fn is_set(&self, byte_offset: u64) -> bool {
        self.bits.contains_key(&(byte_offset / 4))
    }

    /// Iterate set bits in ascending byte-offset order.
    pub fn iter_offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits.keys().map(|slot| slot * 4)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// One output file's worth of regions (spec.md §3 `SubCache`).
pub struct SubCache {
    pub text: Region,
    pub data_regions: Vec<Region>,
    pub linkedit: Option<Region>,
    pub code_signature: Region,
    pub aslr: AslrTracker,
    pub text_first_dylib: usize,
    pub text_num_dylibs: usize,
    pub data_first_dylib: usize,
    pub data_num_dylibs: usize,
    pub linkedit_first_dylib: usize,
    pub linkedit_num_dylibs: usize,
    pub cd_hash: [u8; 20],
    pub cd_hash_agile: Option<[u8; 20]>,
    pub uuid: Uuid,
}

impl SubCache {
    /// Invariant check from spec.md §3: within one sub-cache, file offsets
    /// strictly increase TEXT < DATA* < LINKEDIT < CodeSignature.
    pub fn offsets_are_ordered(&self) -> bool {
        let text_off = self.text.cache_file_offset;
        let mut prev = text_off;
        for data in &self.data_regions {
            if data.cache_file_offset <= prev {
                return false;
            }
            prev = data.cache_file_offset;
        }
        if let Some(linkedit) = &self.linkedit {
            if linkedit.cache_file_offset <= prev {
                return false;
            }
            prev = linkedit.cache_file_offset;
        }
        self.code_signature.cache_file_offset > prev
    }
}

/// A patch-table tuple recorded by the binder (spec.md §4.5/§4.6), before
/// C8 compresses it into the on-disk parallel-array form.
#[derive(Debug, Clone)]
pub struct PatchTuple {
    pub producer_image_index: usize,
    pub export_dylib_vm_offset: u64,
    pub export_name: String,
    pub client_image_index: usize,
    pub location_dylib_vm_offset: u64,
    pub pointer_meta: PointerMetaData,
    pub addend: i64,
    /// Whether the resolved export is weak-def (spec.md §4.5: "if the
    /// export is weak-def, additionally record ... in the weak-export
    /// set"). Gates pass 1's keep decision in [`crate::patch`] alongside
    /// path-overridability and the never-eliminate name list (spec.md §4.6).
    pub weak_def: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aslr_tracker_rounds_offsets_to_slots() {
        let mut tracker = AslrTracker::default();
        tracker.set_bit(0x100);
        tracker.set_bit(0x104);
        assert!(tracker.is_set(0x100));
        assert!(tracker.is_set(0x104));
        assert!(!tracker.is_set(0x108));
        assert_eq!(tracker.len(), 2);
        let offsets: Vec<u64> = tracker.iter_offsets().collect();
        assert_eq!(offsets, vec![0x100, 0x104]);
    }

    #[test]
    fn subcache_offset_ordering_detects_violations() {
        let mut sub = SubCache {
            text: Region::new(RegionKind::Text, 0x1000),
            data_regions: vec![Region::new(RegionKind::Data, 0x1000)],
            linkedit: Some(Region::new(RegionKind::Linkedit, 0x1000)),
            code_signature: Region::new(RegionKind::CodeSignature, 0x100),
            aslr: AslrTracker::default(),
            text_first_dylib: 0,
            text_num_dylibs: 0,
            data_first_dylib: 0,
            data_num_dylibs: 0,
            linkedit_first_dylib: 0,
            linkedit_num_dylibs: 0,
            cd_hash: [0; 20],
            cd_hash_agile: None,
            uuid: Uuid::nil(),
        };
        sub.text.cache_file_offset = 0;
        sub.data_regions[0].cache_file_offset = 0x1000;
        sub.linkedit.as_mut().unwrap().cache_file_offset = 0x2000;
        sub.code_signature.cache_file_offset = 0x3000;
        assert!(sub.offsets_are_ordered());

        sub.data_regions[0].cache_file_offset = 0; // now equal to TEXT
        assert!(!sub.offsets_are_ordered());
    }
}
