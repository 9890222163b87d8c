//! Top-level orchestrator (spec.md §1/§9): wires C1 through C12 end to end.
//!
//! Scope note shared with [`crate::macho`] and [`crate::bind`]: this crate's
//! external-optimizer boundary (SPEC_FULL.md §B) means the dlopen/launch
//! closures, ObjC/Swift selector uniquing, and LINKEDIT local-symbol
//! optimization a real build delegates to those collaborators are invoked
//! here only as the trait hook — nothing past the hook is implemented, per
//! spec.md's own "only interfaces are fixed" Non-goal. What lands in a
//! produced cache is exactly what C1-C12 own: layout, binding, patch
//! tables, tries, slide info, and ad-hoc code signing.
//!
//! [`crate::layout::assign_addresses`] is called exactly once, over every
//! cached dylib, producing one TEXT region, one set of DATA* regions, and
//! one LINKEDIT region shared by every planned sub-cache. For the
//! non-split architectures this is exact — `plan_subcaches` only ever
//! returns a single plan there, covering the whole of each range. For
//! arm64e's split layout, the dedicated DATA-only and LINKEDIT-only plans
//! already want the whole of those regions, and each TEXT-only plan just
//! slices its own byte range out of the one TEXT buffer — so no dylib's
//! bytes or segment mappings are ever computed twice.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::arch::ArchLayout;
use crate::bind::{self, OrdinalTable};
use crate::codesign;
use crate::config::CreateOptions;
use crate::error::{BuildError, Diagnostics, Result};
use crate::header::{CacheHeader, ImageInfo, MappingFlags, MappingInfo, MappingWithSlideInfo, SubCacheEntry};
use crate::input::{self, LoadedInputs};
use crate::layout::{self, SubCachePlan};
use crate::macho::MachoImage;
use crate::map::{CacheMap, MapDylib, MapRegion};
use crate::model::{AslrTracker, DylibInfo, InputFile, Region, RegionKind, RequirementState, TextCoalescer};
use crate::patch::{self, PatchTable};
use crate::slide_info;
use crate::sort::{self, SortableDylib};
use crate::tries;
use crate::verify;
use crate::writer::{OutputKind, PendingOutput};

/// Everything a finished build hands back to the caller, who then chooses
/// how to emit [`PendingOutput`]s (to disk via [`crate::writer`], or
/// in-memory for a test).
pub struct BuildResult {
    pub outputs: Vec<PendingOutput>,
    pub warnings: Vec<String>,
    pub evicted: Vec<(String, String)>,
    /// Present when [`CreateOptions::output_map_file_path`] is set
    /// (SPEC_FULL.md §C.3); writing it to disk is left to the caller, same
    /// as every other [`PendingOutput`].
    pub map: Option<CacheMap>,
}

/// Find which segment (by vmaddr range) a raw offset in `dylib`'s own
/// mach-header-relative vm-offset space falls in, and translate it through
/// that segment's `SegmentMapping` into the `(region, offset_in_region)`
/// destination coordinate C6 placed it at. Used for a fixup's own location
/// and, since rebases only ever point within their own image, a rebase's
/// `target` too (spec.md §4.5).
fn translate_offset(dylib: &DylibInfo, source_offset: u64) -> Option<(RegionKind, u64)> {
    let segments = dylib.image.segments();
    let (seg_idx, seg) = segments
        .iter()
        .enumerate()
        .find(|(_, s)| source_offset >= s.vmaddr && source_offset < s.vmaddr + s.vmsize)?;
    let mapping = dylib.segment_mappings.iter().find(|m| m.source_segment_index == seg_idx)?;
    Some((mapping.region, mapping.dst_offset_in_region + (source_offset - seg.vmaddr)))
}

fn region_buffer_mut<'a>(
    text: &'a mut Region,
    data_regions: &'a mut [Region],
    linkedit: &'a mut Option<Region>,
    kind: RegionKind,
) -> Option<&'a mut Vec<u8>> {
    match kind {
        RegionKind::Text => Some(&mut text.buffer),
        RegionKind::Linkedit => linkedit.as_mut().map(|r| &mut r.buffer),
        other => data_regions.iter_mut().find(|r| r.kind == other).map(|r| &mut r.buffer),
    }
}

/// The byte range of the global TEXT buffer that dylibs `range` occupy,
/// derived from their own `__TEXT` `SegmentMapping`s. `range.end` may equal
/// `dylibs.len()`, in which case the range runs to `text_size_in_use`.
fn text_byte_range(dylibs: &[DylibInfo], range: Range<usize>, text_size_in_use: u64) -> Range<u64> {
    if range.is_empty() {
        return 0..0;
    }
    let start = dylibs[range.start]
        .segment_mappings
        .iter()
        .find(|m| m.region == RegionKind::Text)
        .map(|m| m.dst_offset_in_region)
        .unwrap_or(0);
    let end = dylibs
        .get(range.end)
        .and_then(|d| d.segment_mappings.iter().find(|m| m.region == RegionKind::Text))
        .map(|m| m.dst_offset_in_region)
        .unwrap_or(text_size_in_use);
    start..end
}

/// Drive one full build: load, verify, sort, lay out, bind, patch-table,
/// trie, slide-info, sign, and serialize every sub-cache.
pub fn build(options: &CreateOptions, inputs: &[InputFile], cacheable_dirs: &[&str]) -> Result<BuildResult> {
    let arch: &'static ArchLayout = ArchLayout::for_arch(&options.arch)?;
    log::debug!("{}: building {} cache for {} inputs", options.logging_prefix, arch.name, inputs.len());
    let mut diagnostics = Diagnostics::new();

    let loaded: LoadedInputs = input::load_inputs(inputs, cacheable_dirs, &mut diagnostics)?;
    if diagnostics.has_error() {
        return Err(diagnostics.into_result().unwrap_err());
    }

    let verified = verify::verify(&loaded, &mut diagnostics);
    if diagnostics.has_error() {
        return Err(diagnostics.into_result().unwrap_err());
    }

    let mut by_install_name: BTreeMap<String, usize> = BTreeMap::new();
    for (idx, loaded_dylib) in loaded.cacheable.iter().enumerate() {
        by_install_name.insert(loaded_dylib.install_name.clone(), idx);
    }

    let cacheable_names: std::collections::BTreeSet<&String> = verified.cacheable_install_names.iter().collect();
    let sortables: Vec<SortableDylib> = verified
        .cacheable_install_names
        .iter()
        .filter_map(|name| {
            let idx = *by_install_name.get(name)?;
            let dylib = &loaded.cacheable[idx];
            let text_vm_size: u64 =
                dylib.image.segments().iter().filter(|s| s.name == "__TEXT").map(|s| s.vmsize).sum();
            // Only edges within the final cacheable set matter for leaf
            // eviction (spec.md §4.2): a dependency the verifier already
            // dropped can never keep a dylib from being a leaf here.
            let dependencies: Vec<String> = dylib
                .image
                .dependencies()
                .iter()
                .filter(|dep| cacheable_names.contains(&dep.install_name))
                .map(|dep| dep.install_name.clone())
                .collect();
            Some(SortableDylib {
                install_name: name.clone(),
                runtime_path: dylib.path.clone(),
                is_catalyst: dylib.path.contains("/System/iOSSupport"),
                text_vm_size,
                dependencies,
            })
        })
        .collect();

    let sorted = sort::sort_dylibs(sortables, &options.dylib_ordering);
    let (fitted, overflow_evicted) = sort::evict_until_fits(
        sorted,
        &options.dylib_ordering,
        options.evict_leaf_dylibs_on_overflow,
        |set| {
            let total: u64 = set.iter().map(|d| d.text_vm_size).sum();
            arch.sub_cache_text_limit == 0 || total <= arch.sub_cache_text_limit
        },
    )?;

    // spec.md §8: an input list below the 25-dylib minimum never becomes a
    // cache, evictions or no.
    const MINIMUM_CACHEABLE_DYLIBS: usize = 25;
    if fitted.len() < MINIMUM_CACHEABLE_DYLIBS {
        return Err(BuildError::BelowMinimumDylibCount);
    }

    let mut dylibs: Vec<DylibInfo> = fitted
        .iter()
        .enumerate()
        .map(|(image_index, sortable)| {
            let idx = by_install_name[&sortable.install_name];
            let image = loaded.cacheable[idx].image.clone();
            DylibInfo {
                install_name: sortable.install_name.clone(),
                path: sortable.runtime_path.clone(),
                image: Box::new(image),
                segment_mappings: Vec::new(),
                text_coalescer: TextCoalescer::default(),
                owning_subcache: 0,
                image_index,
            }
        })
        .collect();

    let text_vm_sizes: Vec<u64> = dylibs
        .iter()
        .map(|d| d.image.segments().iter().filter(|s| s.name == "__TEXT").map(|s| s.vmsize).sum())
        .collect();
    let plans: Vec<SubCachePlan> = layout::plan_subcaches(arch, &text_vm_sizes);
    if plans.is_empty() {
        return Err(BuildError::BelowMinimumDylibCount);
    }
    log::debug!("laid out {} dylibs across {} sub-cache(s)", dylibs.len(), plans.len());

    // Single global layout pass: assign_addresses always computes TEXT,
    // every DATA* kind, and LINKEDIT together for whichever dylib slice
    // it's given, appending to each dylib's segment_mappings as a side
    // effect. Calling it once per plan would push duplicate mappings onto
    // dylibs shared across plans (every dylib is covered by its own
    // TEXT-only plan *and* the whole-range DATA/LINKEDIT plans in arm64e's
    // split layout), so it is called exactly once here over every dylib.
    let (mut text, mut data_regions, mut linkedit) =
        layout::assign_addresses(arch, &mut dylibs, &options.dirty_data_segment_ordering)?;

    // Every region of a sub-cache shares one vm_allocate'd address range
    // (spec.md §4.4): TEXT first at arch.base_address, then each DATA*
    // region, then LINKEDIT, each immediately after the previous region's
    // bytes. Recording each region's own base here is what lets bind/patch
    // resolution turn a (region, offset_in_region) pair back into the
    // single cache-relative address the runtime loader actually sees.
    let mut cursor = arch.base_address;
    text.unslid_load_address = cursor;
    cursor += text.buffer.len() as u64;
    for region in &mut data_regions {
        region.unslid_load_address = cursor;
        cursor += region.buffer.len() as u64;
    }
    if let Some(region) = &mut linkedit {
        region.unslid_load_address = cursor;
    }

    let exports_by_name: Vec<BTreeMap<String, (u64, bool)>> = dylibs
        .iter()
        .map(|d| {
            d.image
                .exports()
                .iter()
                .filter(|e| !e.reexport)
                .map(|e| (e.name.clone(), (e.offset, e.weak_definition)))
                .collect()
        })
        .collect();
    let name_to_index: BTreeMap<String, usize> =
        dylibs.iter().map(|d| (d.install_name.clone(), d.image_index)).collect();

    // A snapshot of every region's base address, taken once before the bind
    // loop starts mutating region buffers: regions don't move once
    // assign_addresses returns, so this can be plain copied u64s rather than
    // a live borrow that would fight write_slot's `&mut` over the same
    // regions.
    let region_base = {
        let text_base = text.unslid_load_address;
        let data_bases: Vec<(RegionKind, u64)> = data_regions.iter().map(|r| (r.kind, r.unslid_load_address)).collect();
        let linkedit_base = linkedit.as_ref().map(|r| r.unslid_load_address).unwrap_or(0);
        move |kind: RegionKind| -> u64 {
            match kind {
                RegionKind::Text => text_base,
                RegionKind::Linkedit => linkedit_base,
                other => data_bases.iter().find(|(k, _)| *k == other).map(|(_, b)| *b).unwrap_or(0),
            }
        }
    };

    let mut aslr = AslrTracker::default();
    let mut patch_tuples = Vec::new();
    for dylib in &dylibs {
        let ordinal_entries: Vec<usize> = dylib
            .image
            .dependencies()
            .iter()
            .map(|dep| name_to_index.get(&dep.install_name).copied().unwrap_or(usize::MAX))
            .collect();
        let ordinals = OrdinalTable::new(ordinal_entries, &exports_by_name);

        bind::bind_dylib(
            dylib,
            &ordinals,
            &mut aslr,
            |offset| translate_offset(dylib, offset),
            |offset| translate_offset(dylib, offset).map(|(kind, region_offset)| region_base(kind) + region_offset),
            |producer_idx, export_offset| {
                let producer = dylibs.get(producer_idx)?;
                translate_offset(producer, export_offset).map(|(kind, region_offset)| region_base(kind) + region_offset)
            },
            |kind, region_offset, value| {
                let buffer = region_buffer_mut(&mut text, &mut data_regions, &mut linkedit, kind)
                    .ok_or(BuildError::BufferAllocationFailed)?;
                let slot = buffer
                    .get_mut(region_offset as usize..region_offset as usize + 8)
                    .ok_or(BuildError::BufferAllocationFailed)?;
                slot.copy_from_slice(&value.to_le_bytes());
                Ok(())
            },
            &mut patch_tuples,
        )?;
    }

    log::debug!("recorded {} binder patch tuples across {} rebase slots", patch_tuples.len(), aslr.len());
    let producer_path = |idx: usize| dylibs.get(idx).map(|d| d.install_name.clone()).unwrap_or_default();
    let patch_table: PatchTable = patch::build_patch_table(&patch_tuples, dylibs.len(), producer_path)?;
    let patch_bytes = patch_table.serialize();

    let dylib_trie = tries::build_dylib_trie(&dylibs, &[]);
    let image_text_info = tries::build_image_text_info(&dylibs, arch.base_address, |d| d.image_index as u32);

    for region in &mut data_regions {
        let size = region.size_in_use.max(1);
        let base = region.unslid_load_address;
        slide_info::encode_region(arch, &mut region.buffer, size, &aslr, base)?;
    }

    struct BuiltSubcache {
        plan: SubCachePlan,
        bytes: Vec<u8>,
        uuid: uuid::Uuid,
        super_blob: Vec<u8>,
        text_mapping: Option<(u64, u64)>,
        data_mappings: Vec<(u64, u64)>,
    }

    let mut built: Vec<BuiltSubcache> = Vec::with_capacity(plans.len());
    for plan in &plans {
        let mut concatenated = Vec::new();
        let mut text_mapping = None;
        let mut data_mappings = Vec::new();
        let mut text_mapping_size = 0u64;

        if !plan.text_range.is_empty() {
            let range = text_byte_range(&dylibs, plan.text_range.clone(), text.size_in_use);
            let start = range.start.min(text.buffer.len() as u64) as usize;
            let end = range.end.min(text.buffer.len() as u64) as usize;
            concatenated.extend_from_slice(&text.buffer[start..end]);
            text_mapping_size = (end - start) as u64;
            text_mapping = Some((text.unslid_load_address + start as u64, text_mapping_size));
        }
        if !plan.data_range.is_empty() {
            for region in &data_regions {
                concatenated.extend_from_slice(&region.buffer);
                data_mappings.push((region.unslid_load_address, region.buffer.len() as u64));
            }
        }
        if !plan.linkedit_range.is_empty() {
            if let Some(region) = &linkedit {
                concatenated.extend_from_slice(&region.buffer);
            }
        }

        let exec_seg_limit = if !plan.text_range.is_empty() { text_mapping_size } else { 0 };
        let sign_result = codesign::sign(
            &mut concatenated,
            concatenated.len() as u64,
            0,
            exec_seg_limit,
            arch.code_signing_page_size,
            options.code_signing_digest_mode,
            "com.apple.dyld.cache",
            16,
        )?;

        built.push(BuiltSubcache {
            plan: plan.clone(),
            bytes: concatenated,
            uuid: sign_result.uuid,
            super_blob: sign_result.super_blob,
            text_mapping,
            data_mappings,
        });
    }

    let all_uuids: Vec<uuid::Uuid> = built.iter().map(|b| b.uuid).collect();

    let mut outputs = Vec::with_capacity(built.len());
    for (idx, subcache) in built.into_iter().enumerate() {
        let mut mappings = Vec::new();
        if let Some((address, size)) = subcache.text_mapping {
            mappings.push(MappingInfo { address, size, file_offset: 0, max_prot: 0b101, init_prot: 0b101 });
        }

        let mappings_with_slide: Vec<MappingWithSlideInfo> = subcache
            .data_mappings
            .iter()
            .map(|(address, size)| MappingWithSlideInfo {
                mapping: MappingInfo { address: *address, size: *size, file_offset: 0, max_prot: 0b011, init_prot: 0b011 },
                slide_info_file_offset: 0,
                slide_info_file_size: 0,
                flags: MappingFlags::empty(),
            })
            .collect();

        let images: Vec<ImageInfo> = if idx == 0 {
            dylibs
                .iter()
                .map(|d| ImageInfo {
                    address: text.unslid_load_address
                        + d.segment_mappings
                            .iter()
                            .find(|m| m.region == RegionKind::Text)
                            .map(|m| m.dst_offset_in_region)
                            .unwrap_or(0),
                    mod_time: 0,
                    inode: 0,
                    path_file_offset: d.image_index as u32,
                })
                .collect()
        } else {
            Vec::new()
        };

        let sub_caches: Vec<SubCacheEntry> = if idx == 0 {
            all_uuids.iter().skip(1).map(|uuid| SubCacheEntry { uuid: *uuid, cache_vm_offset: 0 }).collect()
        } else {
            Vec::new()
        };

        let header = CacheHeader {
            arch_name: arch.name.to_string(),
            mappings,
            mappings_with_slide,
            images,
            images_text: if idx == 0 { image_text_info.clone() } else { Vec::new() },
            patch_info_addr: 0,
            patch_info_size: if idx == 0 { patch_bytes.len() as u32 } else { 0 },
            dylibs_trie_addr: 0,
            dylibs_trie_size: if idx == 0 { dylib_trie.len() as u32 } else { 0 },
            sub_caches,
            uuid: subcache.uuid,
            platform: options.platform,
            format_version: 1,
            shared_region_start: arch.base_address,
            shared_region_size: arch.shared_region_size,
            max_slide: arch.shared_region_size,
            ..Default::default()
        };

        let mut bytes = header.serialize();
        bytes.extend_from_slice(&subcache.bytes);
        if idx == 0 {
            bytes.extend_from_slice(&patch_bytes);
            bytes.extend_from_slice(&dylib_trie);
        }
        bytes.extend_from_slice(&subcache.super_blob);

        let kind = if idx == 0 { OutputKind::Primary } else { OutputKind::Numbered(idx as u32) };
        outputs.push(PendingOutput { kind, bytes });
    }

    let mut evicted = verified.evictions;
    evicted.extend(overflow_evicted.into_iter().map(|name| (name, "overflow eviction".to_string())));

    let map = options.output_map_file_path.is_some().then(|| {
        // Matches the rx/rw/r split already used for the header's own
        // MappingInfo entries above -- Region::init_prot/max_prot default to
        // a single generic value for every kind, so this crate's one
        // authoritative per-kind permission table lives here rather than on
        // Region itself.
        let mut regions = vec![MapRegion {
            name: RegionKind::Text.name().to_string(),
            address: text.unslid_load_address,
            size: text.buffer.len() as u64,
            init_prot: 0b101,
            max_prot: 0b101,
        }];
        regions.extend(data_regions.iter().map(|region| MapRegion {
            name: region.kind.name().to_string(),
            address: region.unslid_load_address,
            size: region.buffer.len() as u64,
            init_prot: 0b011,
            max_prot: 0b011,
        }));
        if let Some(region) = &linkedit {
            regions.push(MapRegion {
                name: RegionKind::Linkedit.name().to_string(),
                address: region.unslid_load_address,
                size: region.buffer.len() as u64,
                init_prot: 0b001,
                max_prot: 0b001,
            });
        }
        let dylibs_map = dylibs
            .iter()
            .map(|d| {
                let mapping = d.segment_mappings.iter().find(|m| m.region == RegionKind::Text);
                MapDylib {
                    install_name: d.install_name.clone(),
                    text_address: text.unslid_load_address + mapping.map(|m| m.dst_offset_in_region).unwrap_or(0),
                    text_size: mapping.map(|m| m.dst_size).unwrap_or(0),
                }
            })
            .collect();
        CacheMap { arch: arch.name.to_string(), regions, dylibs: dylibs_map }
    });

    log::debug!("{}: emitted {} sub-cache file(s), {} dylib(s) evicted", options.logging_prefix, outputs.len(), evicted.len());
    Ok(BuildResult { outputs, warnings: diagnostics.into_result()?, evicted, map })
}
