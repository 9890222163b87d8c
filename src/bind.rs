//! C7 — binder (spec.md §4.5).
//!
//! Walks each cached dylib's fixups (as decoded by [`crate::macho`]),
//! resolves binds against the producing dylib's exports, writes the
//! resolved value into the mapped segment, and records the location in the
//! sub-cache's ASLR tracker plus the patch-table accumulator.
//!
//! Every raw fixup -- both a rebase's `target` and a fixup's own
//! `image_offset` -- is expressed in the *producing image's own*
//! mach-header-relative vm-offset space (the same space `LC_SEGMENT_64`
//! vmaddrs live in), not in cache-relative coordinates: C6 repacks a
//! dylib's segments into region buffers that don't preserve the relative
//! distance between e.g. its own `__TEXT` and `__DATA`, so every such
//! offset has to be translated through that dylib's own
//! `SegmentMapping`s before it means anything in the finished cache. The
//! caller supplies that translation (`locate`/`resolve_target`) since only
//! it holds every region's placement; this module only sequences the
//! walk and the bookkeeping.

use std::collections::BTreeMap;

use crate::error::{BuildError, Result};
use crate::macho::FixupKind;
use crate::model::{AslrTracker, DylibInfo, PatchTuple, PointerMetaData, RegionKind};

/// Maps a dylib's ordinal-indexed dependency table (as it appears in its own
/// `LC_LOAD_DYLIB` list) to the producing dylib's index in the cached list,
/// so a `Bind { ordinal, .. }` fixup can find its producer.
pub struct OrdinalTable<'a> {
    /// dependency ordinal (1-based, per Mach-O convention) -> cached image
    /// index.
    entries: Vec<usize>,
    exports_by_name: &'a [BTreeMap<String, (u64, bool)>],
}

impl<'a> OrdinalTable<'a> {
    pub fn new(entries: Vec<usize>, exports_by_name: &'a [BTreeMap<String, (u64, bool)>]) -> Self {
        Self { entries, exports_by_name }
    }

    fn producer_for_ordinal(&self, ordinal: u32) -> Option<usize> {
        self.entries.get(ordinal.wrapping_sub(1) as usize).copied()
    }
}

/// Resolve and apply every fixup of one dylib.
///
/// - `locate(offset)` translates an offset in `dylib`'s own vm-offset space
///   (a fixup's `image_offset`, or a rebase's `target`) into the
///   `(region, offset_in_region)` it landed at in C6's layout.
/// - `resolve_target(offset)` is `locate` composed with each region's own
///   cache-relative base address, yielding the absolute value to store at
///   a rebase location.
/// - `resolve_export(producer_index, export_offset)` is the same
///   composition against the *producer's* own vm-offset space, for a
///   symbolic bind's target.
/// - `write_slot(region, offset_in_region, value)` stores the resolved
///   8-byte value at the fixup's own (translated) location.
#[allow(clippy::too_many_arguments)]
pub fn bind_dylib(
    dylib: &DylibInfo,
    ordinals: &OrdinalTable,
    aslr: &mut AslrTracker,
    mut locate: impl FnMut(u64) -> Option<(RegionKind, u64)>,
    mut resolve_target: impl FnMut(u64) -> Option<u64>,
    mut resolve_export: impl FnMut(usize, u64) -> Option<u64>,
    mut write_slot: impl FnMut(RegionKind, u64, u64) -> Result<()>,
    patch_tuples: &mut Vec<PatchTuple>,
) -> Result<()> {
    for fixup in dylib.fixups() {
        let (loc_region, loc_offset) = locate(fixup.image_offset).ok_or_else(|| BuildError::FixupFailed {
            message: format!("fixup location 0x{:x} is outside every mapped segment", fixup.image_offset),
            dylib_path: dylib.path.clone(),
        })?;

        match &fixup.kind {
            FixupKind::Rebase { target } => {
                let resolved = resolve_target(*target).ok_or_else(|| BuildError::FixupFailed {
                    message: format!("rebase target 0x{target:x} is outside every mapped segment"),
                    dylib_path: dylib.path.clone(),
                })?;
                write_slot(loc_region, loc_offset, resolved)?;
                aslr.set_bit(fixup.image_offset);
            }
            FixupKind::AuthRebase { target, diversity, addr_div, key } => {
                let resolved = resolve_target(*target as u64).ok_or_else(|| BuildError::FixupFailed {
                    message: format!("auth rebase target 0x{target:x} is outside every mapped segment"),
                    dylib_path: dylib.path.clone(),
                })?;
                write_slot(loc_region, loc_offset, resolved)?;
                aslr.set_bit(fixup.image_offset);
                aslr.auth.insert(
                    fixup.image_offset / 4,
                    PointerMetaData {
                        diversity: *diversity,
                        addr_div: *addr_div,
                        key: *key,
                        authenticated: true,
                        high8: 0,
                    },
                );
            }
            FixupKind::Bind { lib_ordinal, symbol_name, addend } => {
                let addend = *addend;
                let producer = ordinals.producer_for_ordinal(*lib_ordinal).ok_or_else(|| {
                    BuildError::FixupFailed {
                        message: format!("unresolved bind ordinal {lib_ordinal}"),
                        dylib_path: dylib.path.clone(),
                    }
                })?;
                let exports = ordinals
                    .exports_by_name
                    .get(producer)
                    .ok_or_else(|| BuildError::FixupFailed {
                        message: "bind producer has no export table".to_string(),
                        dylib_path: dylib.path.clone(),
                    })?;
                let (export_offset, weak) = *exports.get(symbol_name).ok_or_else(|| BuildError::FixupFailed {
                    message: format!("could not find symbol '{symbol_name}' in producer"),
                    dylib_path: dylib.path.clone(),
                })?;
                let export_address = resolve_export(producer, export_offset).ok_or_else(|| BuildError::FixupFailed {
                    message: format!("export '{symbol_name}' at 0x{export_offset:x} is outside every mapped segment of its producer"),
                    dylib_path: dylib.path.clone(),
                })?;
                let resolved = (export_address as i64 + addend) as u64;
                write_slot(loc_region, loc_offset, resolved)?;
                aslr.set_bit(fixup.image_offset);
                patch_tuples.push(PatchTuple {
                    producer_image_index: producer,
                    export_dylib_vm_offset: export_offset,
                    export_name: symbol_name.clone(),
                    client_image_index: dylib.image_index,
                    location_dylib_vm_offset: fixup.image_offset,
                    pointer_meta: PointerMetaData::default(),
                    addend,
                    weak_def: weak,
                });
            }
            FixupKind::AuthBind { lib_ordinal, symbol_name, diversity, addr_div, key } => {
                let producer = ordinals.producer_for_ordinal(*lib_ordinal).ok_or_else(|| {
                    BuildError::FixupFailed {
                        message: format!("unresolved auth bind ordinal {lib_ordinal}"),
                        dylib_path: dylib.path.clone(),
                    }
                })?;
                let exports = ordinals
                    .exports_by_name
                    .get(producer)
                    .ok_or_else(|| BuildError::FixupFailed {
                        message: "auth bind producer has no export table".to_string(),
                        dylib_path: dylib.path.clone(),
                    })?;
                let (export_offset, weak) = *exports.get(symbol_name).ok_or_else(|| BuildError::FixupFailed {
                    message: format!("could not find symbol '{symbol_name}' in producer"),
                    dylib_path: dylib.path.clone(),
                })?;
                let export_address = resolve_export(producer, export_offset).ok_or_else(|| BuildError::FixupFailed {
                    message: format!("export '{symbol_name}' at 0x{export_offset:x} is outside every mapped segment of its producer"),
                    dylib_path: dylib.path.clone(),
                })?;
                write_slot(loc_region, loc_offset, export_address)?;
                aslr.set_bit(fixup.image_offset);
                aslr.auth.insert(
                    fixup.image_offset / 4,
                    PointerMetaData {
                        diversity: *diversity,
                        addr_div: *addr_div,
                        key: *key,
                        authenticated: true,
                        high8: 0,
                    },
                );
                patch_tuples.push(PatchTuple {
                    producer_image_index: producer,
                    export_dylib_vm_offset: export_offset,
                    export_name: symbol_name.clone(),
                    client_image_index: dylib.image_index,
                    location_dylib_vm_offset: fixup.image_offset,
                    pointer_meta: PointerMetaData {
                        diversity: *diversity,
                        addr_div: *addr_div,
                        key: *key,
                        authenticated: true,
                        high8: 0,
                    },
                    addend: 0,
                    weak_def: weak,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::{Dependency, DependencyKind, ExportSymbol, Fixup, ParsedImage, Segment};
    use crate::model::{SegmentMapping, TextCoalescer};

    fn text_segment(vmaddr: u64, vmsize: u64) -> Segment {
        Segment {
            name: "__TEXT".to_string(),
            vmaddr,
            vmsize,
            fileoff: 0,
            filesize: vmsize,
            max_prot: 0b101,
            init_prot: 0b101,
            sections: Vec::new(),
        }
    }

    fn data_segment(vmaddr: u64, vmsize: u64) -> Segment {
        Segment {
            name: "__DATA".to_string(),
            vmaddr,
            vmsize,
            fileoff: 0,
            filesize: vmsize,
            max_prot: 0b011,
            init_prot: 0b011,
            sections: Vec::new(),
        }
    }

    /// A dylib whose `__TEXT` (image vmaddr 0) and `__DATA` (image vmaddr
    /// 0x4000) get repacked into cache regions that do *not* preserve that
    /// 0x4000 distance, so a naive `base_address + offset` resolution would
    /// land in the wrong region entirely.
    fn dylib_with_repacked_regions() -> DylibInfo {
        DylibInfo {
            install_name: "/usr/lib/libexporter.dylib".to_string(),
            path: "/usr/lib/libexporter.dylib".to_string(),
            image: Box::new(ParsedImage {
                install_name: "/usr/lib/libexporter.dylib".to_string(),
                uuid: [1u8; 16],
                is64: true,
                cpu_type: 0x0100000c,
                cpu_subtype: 0,
                current_version: 0,
                compatibility_version: 0,
                segments: vec![text_segment(0, 0x1000), data_segment(0x4000, 0x1000)],
                dependencies: Vec::new(),
                exports: vec![ExportSymbol {
                    name: "_exported_global".to_string(),
                    offset: 0x4010, // inside __DATA, not __TEXT
                    weak_definition: false,
                    reexport: false,
                    reexported_from: None,
                    stub_and_resolver: false,
                }],
                fixups: Vec::new(),
            }),
            segment_mappings: vec![
                SegmentMapping { source_segment_index: 0, region: RegionKind::Text, dst_offset_in_region: 0x9000, dst_size: 0x1000, copy_size: 0x1000 },
                SegmentMapping { source_segment_index: 1, region: RegionKind::Data, dst_offset_in_region: 0x100, dst_size: 0x1000, copy_size: 0x1000 },
            ],
            text_coalescer: TextCoalescer::default(),
            owning_subcache: 0,
            image_index: 0,
        }
    }

    fn client_dylib() -> DylibInfo {
        DylibInfo {
            install_name: "/usr/lib/libclient.dylib".to_string(),
            path: "/usr/lib/libclient.dylib".to_string(),
            image: Box::new(ParsedImage {
                install_name: "/usr/lib/libclient.dylib".to_string(),
                uuid: [2u8; 16],
                is64: true,
                cpu_type: 0x0100000c,
                cpu_subtype: 0,
                current_version: 0,
                compatibility_version: 0,
                segments: vec![text_segment(0, 0x1000), data_segment(0x2000, 0x1000)],
                dependencies: vec![Dependency {
                    install_name: "/usr/lib/libexporter.dylib".to_string(),
                    kind: DependencyKind::Load,
                    current_version: 0,
                    compatibility_version: 0,
                }],
                exports: Vec::new(),
                fixups: vec![Fixup {
                    image_offset: 0x2008,
                    kind: FixupKind::Bind { lib_ordinal: 1, symbol_name: "_exported_global".to_string(), addend: 0 },
                }],
            }),
            segment_mappings: vec![
                SegmentMapping { source_segment_index: 0, region: RegionKind::Text, dst_offset_in_region: 0x5000, dst_size: 0x1000, copy_size: 0x1000 },
                SegmentMapping { source_segment_index: 1, region: RegionKind::Data, dst_offset_in_region: 0x300, dst_size: 0x1000, copy_size: 0x1000 },
            ],
            text_coalescer: TextCoalescer::default(),
            owning_subcache: 0,
            image_index: 1,
        }
    }

    fn locate_in<'a>(dylib: &'a DylibInfo) -> impl FnMut(u64) -> Option<(RegionKind, u64)> + 'a {
        move |offset| {
            let segments = dylib.image.segments();
            let (idx, seg) = segments.iter().enumerate().find(|(_, s)| offset >= s.vmaddr && offset < s.vmaddr + s.vmsize)?;
            let mapping = dylib.segment_mappings.iter().find(|m| m.source_segment_index == idx)?;
            Some((mapping.region, mapping.dst_offset_in_region + (offset - seg.vmaddr)))
        }
    }

    const TEXT_BASE: u64 = 0x1_8000_0000;
    const DATA_BASE: u64 = 0x1_8010_0000;

    fn region_base(kind: RegionKind) -> u64 {
        match kind {
            RegionKind::Text => TEXT_BASE,
            RegionKind::Data => DATA_BASE,
            _ => 0,
        }
    }

    #[test]
    fn bind_resolves_export_through_producers_own_segment_mapping() {
        let exporter = dylib_with_repacked_regions();
        let client = client_dylib();
        let exports_by_name: Vec<BTreeMap<String, (u64, bool)>> =
            vec![[("_exported_global".to_string(), (0x4010u64, false))].into_iter().collect(), BTreeMap::new()];
        let ordinals = OrdinalTable::new(vec![0], &exports_by_name);

        let mut aslr = AslrTracker::default();
        let mut patch_tuples = Vec::new();
        let mut writes = Vec::new();

        bind_dylib(
            &client,
            &ordinals,
            &mut aslr,
            locate_in(&client),
            |offset| locate_in(&client)(offset).map(|(k, o)| region_base(k) + o),
            |producer_idx, export_offset| {
                assert_eq!(producer_idx, 0);
                locate_in(&exporter)(export_offset).map(|(k, o)| region_base(k) + o)
            },
            |kind, offset, value| {
                writes.push((kind, offset, value));
                Ok(())
            },
            &mut patch_tuples,
        )
        .unwrap();

        // Exported global lives at image offset 0x4010 in __DATA (mapping
        // puts __DATA's dst_offset at 0x100, vmaddr base 0x4000), so its
        // resolved absolute address must land in the DATA region, not TEXT.
        let expected = DATA_BASE + 0x100 + (0x4010 - 0x4000);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], (RegionKind::Data, 0x300 + (0x2008 - 0x2000), expected));
        assert_eq!(patch_tuples.len(), 1);
        assert_eq!(patch_tuples[0].export_dylib_vm_offset, 0x4010);
    }

    #[test]
    fn rebase_target_translates_through_its_own_dylibs_mapping() {
        let dylib = client_dylib();
        let mut dylib = dylib;
        dylib.image = Box::new(ParsedImage {
            install_name: dylib.install_name.clone(),
            uuid: [3u8; 16],
            is64: true,
            cpu_type: 0x0100000c,
            cpu_subtype: 0,
            current_version: 0,
            compatibility_version: 0,
            segments: vec![text_segment(0, 0x1000), data_segment(0x2000, 0x1000)],
            dependencies: Vec::new(),
            exports: Vec::new(),
            fixups: vec![Fixup { image_offset: 0x2000, kind: FixupKind::Rebase { target: 0x10 } }],
        });

        let exports_by_name: Vec<BTreeMap<String, (u64, bool)>> = vec![BTreeMap::new()];
        let ordinals = OrdinalTable::new(Vec::new(), &exports_by_name);
        let mut aslr = AslrTracker::default();
        let mut patch_tuples = Vec::new();
        let mut writes = Vec::new();

        bind_dylib(
            &dylib,
            &ordinals,
            &mut aslr,
            locate_in(&dylib),
            |offset| locate_in(&dylib)(offset).map(|(k, o)| region_base(k) + o),
            |_, _| None,
            |kind, offset, value| {
                writes.push((kind, offset, value));
                Ok(())
            },
            &mut patch_tuples,
        )
        .unwrap();

        // target 0x10 is in __TEXT (vmaddr 0..0x1000), whose dst_offset is
        // 0x5000: the rebase must resolve into the TEXT region, not
        // `TEXT_BASE + 0x10` with the dylib's own placement ignored.
        assert_eq!(writes, vec![(RegionKind::Data, 0x300, TEXT_BASE + 0x5000 + 0x10)]);
        assert!(aslr.is_set(0x2000));
    }
}
