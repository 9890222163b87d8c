//! C5 sub-cache planner + C6 address assigner (spec.md §4.3/§4.4).
//!
//! Split into two passes over the same sorted dylib list: [`plan_subcaches`]
//! decides which dylibs share a sub-cache (driven only by the TEXT-size
//! limit and the split/per-sub-cache DATA+LINKEDIT policy), then
//! [`assign_addresses`] walks one sub-cache's dylib range and produces the
//! `Region`s plus each dylib's `SegmentMapping`s.

use crate::arch::ArchLayout;
use crate::error::{BuildError, Result};
use crate::model::{DylibInfo, Region, RegionKind, SegmentMapping, SubCache};

/// One planned sub-cache: a contiguous range into the sorted dylib list for
/// each of its TEXT/DATA/LINKEDIT ownership spans.
#[derive(Debug, Clone)]
pub struct SubCachePlan {
    pub text_range: std::ops::Range<usize>,
    pub data_range: std::ops::Range<usize>,
    pub linkedit_range: std::ops::Range<usize>,
}

/// Per spec.md §4.3: accumulate `__TEXT` vmSize in sort order, closing a
/// sub-cache whenever the running total would exceed `arch.sub_cache_text_limit`
/// (0 meaning "one sub-cache total"). Then apply the split/per-sub-cache
/// DATA+LINKEDIT policy on top of the resulting TEXT partition.
pub fn plan_subcaches(arch: &ArchLayout, text_vm_sizes: &[u64]) -> Vec<SubCachePlan> {
    let mut text_ranges = Vec::new();
    if text_vm_sizes.is_empty() {
        return text_ranges;
    }

    if arch.sub_cache_text_limit == 0 {
        text_ranges.push(0..text_vm_sizes.len());
    } else {
        let mut start = 0;
        let mut accumulated = 0u64;
        for (i, &size) in text_vm_sizes.iter().enumerate() {
            if accumulated != 0 && accumulated + size > arch.sub_cache_text_limit {
                text_ranges.push(start..i);
                start = i;
                accumulated = 0;
            }
            accumulated += size;
        }
        text_ranges.push(start..text_vm_sizes.len());
    }

    let total = text_vm_sizes.len();
    if arch.split_layout() {
        // Split layout: every sub-cache owns only TEXT; one trailing
        // DATA-only sub-cache owns all DATA; one final LINKEDIT-only
        // sub-cache owns all LINKEDIT.
        let mut plans: Vec<SubCachePlan> = text_ranges
            .into_iter()
            .map(|r| SubCachePlan {
                text_range: r,
                data_range: 0..0,
                linkedit_range: 0..0,
            })
            .collect();
        plans.push(SubCachePlan {
            text_range: 0..0,
            data_range: 0..total,
            linkedit_range: 0..0,
        });
        plans.push(SubCachePlan {
            text_range: 0..0,
            data_range: 0..0,
            linkedit_range: 0..total,
        });
        plans
    } else {
        // Per-sub-cache DATA; the last sub-cache owns all LINKEDIT unless
        // the arch's VM size implies > 4GB total, in which case each owns
        // its own (approximated here via `shared_region_size`, since actual
        // total cache size isn't known until C6 runs).
        let last_owns_all_linkedit = arch.shared_region_size <= 0x1_0000_0000;
        let n = text_ranges.len();
        text_ranges
            .into_iter()
            .enumerate()
            .map(|(i, r)| SubCachePlan {
                data_range: r.clone(),
                linkedit_range: if last_owns_all_linkedit {
                    if i == n - 1 {
                        0..total
                    } else {
                        0..0
                    }
                } else {
                    r.clone()
                },
                text_range: r,
            })
            .collect()
    }
}

/// Classify one segment name into a `RegionKind`, per the decision cascade
/// of spec.md §4.4 step 4. `writable`/`split_seg_v2` come from the segment's
/// protection bits and the dylib's load-command shape; the deny-list and
/// relative-method-list checks are collapsed into `force_legacy_data` since
/// this crate's bounded Mach-O reader doesn't interpret ObjC metadata.
pub fn classify_data_segment(
    segment_name: &str,
    writable: bool,
    split_seg_v2: bool,
    force_legacy_data: bool,
    auth_capable: bool,
) -> Option<RegionKind> {
    if !writable {
        return None;
    }
    if !split_seg_v2 {
        return Some(RegionKind::Data);
    }
    if segment_name.ends_with("_CONST") && force_legacy_data {
        return Some(RegionKind::Data);
    }
    if segment_name == "__DATA_DIRTY" {
        return Some(RegionKind::DataDirty);
    }
    if segment_name.starts_with("__AUTH") {
        return Some(if auth_capable {
            if segment_name.ends_with("_CONST") {
                RegionKind::AuthConst
            } else {
                RegionKind::Auth
            }
        } else if segment_name.ends_with("_CONST") {
            RegionKind::DataConst
        } else {
            RegionKind::Data
        });
    }
    match segment_name {
        "__DATA_CONST" => Some(RegionKind::DataConst),
        _ => Some(RegionKind::Data),
    }
}

/// Assigns TEXT/DATA*/LINKEDIT placement for one sub-cache's dylibs,
/// populating each `DylibInfo`'s `segment_mappings` and returning the
/// finished `Region`s. `dirty_data_ordering` is the external ordering file
/// from `CreateOptions::dirty_data_segment_ordering` (spec.md §4.4 step 4).
pub fn assign_addresses(
    arch: &ArchLayout,
    dylibs: &mut [DylibInfo],
    dirty_data_ordering: &[String],
) -> Result<(Region, Vec<Region>, Option<Region>)> {
    let text_capacity: u64 = dylibs
        .iter()
        .map(|d| d.image.segments().iter().map(|s| s.vmsize).sum::<u64>())
        .sum::<u64>()
        + 0x4000;
    let mut text = Region::new(RegionKind::Text, text_capacity.max(0x4000));
    let mut cursor = arch.page_size as u64; // header reserve

    for (idx, dylib) in dylibs.iter_mut().enumerate() {
        for (seg_idx, seg) in dylib.image.segments().iter().enumerate() {
            if seg.name != "__TEXT" {
                continue;
            }
            let alignment = (1u64 << 12).max(arch.page_size as u64 / 4).max(0x1000);
            cursor = crate::arch::align_to(cursor, alignment);
            if cursor + seg.vmsize > text.buffer.len() as u64 {
                return Err(BuildError::BufferAllocationFailed);
            }
            dylib.segment_mappings.push(SegmentMapping {
                source_segment_index: seg_idx,
                region: RegionKind::Text,
                dst_offset_in_region: cursor,
                dst_size: seg.vmsize,
                copy_size: seg.filesize.min(seg.vmsize),
            });
            cursor += seg.vmsize;
            let _ = idx;
        }
    }
    text.size_in_use = arch.align(cursor);

    // DATA regions, fixed order: __DATA_CONST, __DATA, __AUTH, __AUTH_CONST,
    // (+ __DATA_DIRTY handled within __DATA's bucket, emitted first).
    let order = [
        RegionKind::DataConst,
        RegionKind::DataDirty,
        RegionKind::Data,
        RegionKind::Auth,
        RegionKind::AuthConst,
    ];
    let mut data_regions = Vec::new();
    for kind in order {
        let capacity: u64 = dylibs
            .iter()
            .flat_map(|d| d.image.segments())
            .filter(|s| region_for_segment(arch, s.name.as_str(), s.init_prot) == Some(kind))
            .map(|s| s.vmsize)
            .sum();
        if capacity == 0 {
            continue;
        }
        let mut region = Region::new(kind, arch.align(capacity));
        let mut cursor = 0u64;

        let mut dylib_order: Vec<usize> = (0..dylibs.len()).collect();
        if kind == RegionKind::DataDirty {
            dylib_order.sort_by_key(|&i| {
                let name = &dylibs[i].install_name;
                dirty_data_ordering
                    .iter()
                    .position(|n| n == name)
                    .unwrap_or(usize::MAX)
            });
        }

        for &i in &dylib_order {
            let dylib = &mut dylibs[i];
            for (seg_idx, seg) in dylib.image.segments().iter().enumerate() {
                if region_for_segment(arch, seg.name.as_str(), seg.init_prot) != Some(kind) {
                    continue;
                }
                cursor = crate::arch::align_to(cursor, 8);
                if cursor + seg.vmsize > region.buffer.len() as u64 {
                    return Err(BuildError::BufferAllocationFailed);
                }
                dylib.segment_mappings.push(SegmentMapping {
                    source_segment_index: seg_idx,
                    region: kind,
                    dst_offset_in_region: cursor,
                    dst_size: seg.vmsize,
                    copy_size: seg.filesize.min(seg.vmsize),
                });
                cursor += seg.vmsize;
            }
        }
        region.size_in_use = cursor;
        data_regions.push(region);
    }

    // LINKEDIT: whatever's left (non-TEXT, non-DATA, e.g. debug/unwind
    // segments) then a 1MB pad, per spec.md §4.4 step 7.
    let linkedit_capacity: u64 = dylibs
        .iter()
        .flat_map(|d| d.image.segments())
        .filter(|s| s.name == "__LINKEDIT")
        .map(|s| s.vmsize)
        .sum();
    let linkedit = if linkedit_capacity == 0 {
        None
    } else {
        let mut region = Region::new(RegionKind::Linkedit, arch.align(linkedit_capacity + 0x10_0000));
        let mut cursor = 0u64;
        for dylib in dylibs.iter_mut() {
            for (seg_idx, seg) in dylib.image.segments().iter().enumerate() {
                if seg.name != "__LINKEDIT" {
                    continue;
                }
                cursor = arch.align(cursor);
                dylib.segment_mappings.push(SegmentMapping {
                    source_segment_index: seg_idx,
                    region: RegionKind::Linkedit,
                    dst_offset_in_region: cursor,
                    dst_size: seg.vmsize,
                    copy_size: seg.filesize.min(seg.vmsize),
                });
                cursor += seg.vmsize;
            }
        }
        cursor += 0x10_0000; // 1MB pad
        region.size_in_use = arch.align(cursor);
        Some(region)
    };

    Ok((text, data_regions, linkedit))
}

fn region_for_segment(arch: &ArchLayout, name: &str, init_prot: i32) -> Option<RegionKind> {
    const VM_PROT_WRITE: i32 = 0x2;
    let writable = init_prot & VM_PROT_WRITE != 0;
    if name == "__TEXT" || name == "__LINKEDIT" {
        return None;
    }
    classify_data_segment(name, writable, true, false, arch.authenticated_pointers())
}

/// Builds a `SubCache` shell (regions populated, dylib ranges recorded, no
/// code signature yet) from the outputs of [`assign_addresses`].
pub fn build_subcache(
    plan: &SubCachePlan,
    text: Region,
    data_regions: Vec<Region>,
    linkedit: Option<Region>,
) -> SubCache {
    SubCache {
        text,
        data_regions,
        linkedit,
        code_signature: Region::new(RegionKind::CodeSignature, 0x1000),
        aslr: Default::default(),
        text_first_dylib: plan.text_range.start,
        text_num_dylibs: plan.text_range.len(),
        data_first_dylib: plan.data_range.start,
        data_num_dylibs: plan.data_range.len(),
        linkedit_first_dylib: plan.linkedit_range.start,
        linkedit_num_dylibs: plan.linkedit_range.len(),
        cd_hash: [0; 20],
        cd_hash_agile: None,
        uuid: uuid::Uuid::nil(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_subcache_when_no_text_limit() {
        let arch = ArchLayout::for_arch("arm64").unwrap();
        let plans = plan_subcaches(arch, &[0x1000, 0x2000, 0x3000]);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].text_range, 0..3);
    }

    #[test]
    fn splits_on_text_limit_boundary() {
        let arch = ArchLayout::for_arch("arm64e").unwrap();
        // limit is 0x4000_0000; craft sizes that overflow after the 2nd.
        let limit = arch.sub_cache_text_limit;
        let sizes = vec![limit / 2, limit / 2, limit / 2];
        let plans = plan_subcaches(arch, &sizes);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].text_range, 0..2);
        assert_eq!(plans[1].text_range, 2..3);
    }

    #[test]
    fn exact_boundary_does_not_split_early() {
        let arch = ArchLayout::for_arch("arm64e").unwrap();
        let limit = arch.sub_cache_text_limit;
        let sizes = vec![limit / 2, limit / 2];
        let plans = plan_subcaches(arch, &sizes);
        assert_eq!(plans.len(), 1);
    }

    #[test]
    fn classify_data_segment_handles_const_and_auth() {
        assert_eq!(
            classify_data_segment("__DATA_CONST", true, true, false, true),
            Some(RegionKind::DataConst)
        );
        assert_eq!(
            classify_data_segment("__DATA_CONST", true, true, true, true),
            Some(RegionKind::Data)
        );
        assert_eq!(
            classify_data_segment("__AUTH_CONST", true, true, false, true),
            Some(RegionKind::AuthConst)
        );
        assert_eq!(
            classify_data_segment("__AUTH_CONST", true, true, false, false),
            Some(RegionKind::DataConst)
        );
        assert_eq!(classify_data_segment("__DATA", false, true, false, true), None);
    }
}
