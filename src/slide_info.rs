//! C10 — slide-info emitter (spec.md §4.8, on-disk shapes §6.3).
//!
//! Invoked once every bind/rebase has been materialized into a `Region`'s
//! buffer as a plain cache-absolute 64-bit address (what [`crate::bind`]
//! writes). This module rewrites each such slot in place, embedding a
//! "distance to the next rebase on this page" delta into its otherwise-
//! unused high bits, turning the flat rebase set the [`crate::model::AslrTracker`]
//! recorded into a walkable chained-fixup format the loader can apply after
//! choosing a slide.

use crate::arch::{ArchLayout, SlideInfoFormat};
use crate::error::{BuildError, Result};
use crate::model::AslrTracker;

pub const DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE: u16 = 0xFFFF;
pub const PAGE_ATTR_EXTRA: u16 = 0x8000;
pub const PAGE_ATTR_END_V2: u16 = 0x4000;
pub const PAGE_ATTR_END_V4: u16 = 0x8000;

/// V2/V4 slide-info header plus its two variable-length `u16` arrays
/// (spec.md §6.3).
#[derive(Debug, Clone, Default)]
pub struct SlideInfoV2 {
    pub version: u32,
    pub page_size: u32,
    pub delta_mask: u64,
    pub value_add: u64,
    pub page_starts: Vec<u16>,
    pub page_extras: Vec<u16>,
}

impl SlideInfoV2 {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.page_size.to_le_bytes());
        out.extend_from_slice(&self.delta_mask.to_le_bytes());
        out.extend_from_slice(&self.value_add.to_le_bytes());
        let page_starts_offset = 32 + 8; // header fields above + two u32 fields below
        out.extend_from_slice(&(page_starts_offset as u32).to_le_bytes());
        out.extend_from_slice(&(self.page_starts.len() as u32).to_le_bytes());
        let page_extras_offset = page_starts_offset + self.page_starts.len() * 2;
        out.extend_from_slice(&(page_extras_offset as u32).to_le_bytes());
        out.extend_from_slice(&(self.page_extras.len() as u32).to_le_bytes());
        for v in &self.page_starts {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.page_extras {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// V3 (arm64e) slide-info header plus its `u16 page_starts[]` (spec.md
/// §6.3) — the per-page chain descriptors are the region's own rewritten
/// 8-byte slots, not a separate array.
#[derive(Debug, Clone, Default)]
pub struct SlideInfoV3 {
    pub version: u32,
    pub page_size: u32,
    pub auth_value_add: u64,
    pub page_starts: Vec<u16>,
}

impl SlideInfoV3 {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.page_size.to_le_bytes());
        out.extend_from_slice(&(self.page_starts.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.auth_value_add.to_le_bytes());
        for v in &self.page_starts {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

pub enum SlideInfo {
    V2(SlideInfoV2),
    V3(SlideInfoV3),
}

impl SlideInfo {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            SlideInfo::V2(v) => v.serialize(),
            SlideInfo::V3(v) => v.serialize(),
        }
    }
}

/// Dispatch on the arch's slide-info format (spec.md §4.8).
pub fn encode_region(
    arch: &ArchLayout,
    region_bytes: &mut [u8],
    region_size: u64,
    aslr: &AslrTracker,
    base_address: u64,
) -> Result<SlideInfo> {
    match arch.slide_info_format {
        SlideInfoFormat::V2 => Ok(SlideInfo::V2(encode_v2(
            region_bytes,
            region_size,
            aslr,
            arch.pointer_delta_mask,
            base_address,
            2,
            PAGE_ATTR_END_V2,
        )?)),
        SlideInfoFormat::V4 => Ok(SlideInfo::V2(encode_v2(
            region_bytes,
            region_size,
            aslr,
            arch.pointer_delta_mask,
            base_address,
            4,
            PAGE_ATTR_END_V4,
        )?)),
        SlideInfoFormat::V3 => Ok(SlideInfo::V3(encode_v3(region_bytes, region_size, aslr, base_address)?)),
    }
}

/// Greedily chain every set ASLR bit within each 4KB page of `region_bytes`
/// into the V2/V4 embedded-delta format (spec.md §4.8 V2). `delta_mask`'s
/// bit width bounds how far one link can reach; when a gap doesn't fit, a
/// zero-valued intermediate slot between the two is pressed into service as
/// a relay link; failing that, the page's remaining rebases start a new
/// chain recorded in `page_extras`.
#[allow(clippy::too_many_arguments)]
fn encode_v2(
    region_bytes: &mut [u8],
    region_size: u64,
    aslr: &AslrTracker,
    delta_mask: u64,
    value_add: u64,
    version: u32,
    end_bit: u16,
) -> Result<SlideInfoV2> {
    const PAGE_SIZE: u64 = 0x1000;
    let shift = if delta_mask == 0 { 0 } else { delta_mask.trailing_zeros() };
    let max_delta_slots = if delta_mask == 0 { u64::MAX } else { delta_mask >> shift };

    let num_pages = region_size.div_ceil(PAGE_SIZE) as usize;
    let mut page_starts = vec![DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE; num_pages];
    let mut page_extras = Vec::new();

    let mut offsets_by_page: Vec<Vec<u64>> = vec![Vec::new(); num_pages];
    for offset in aslr.iter_offsets() {
        let page = (offset / PAGE_SIZE) as usize;
        if page < num_pages {
            offsets_by_page[page].push(offset);
        }
    }

    for (page_idx, offsets) in offsets_by_page.iter().enumerate() {
        if offsets.is_empty() {
            continue;
        }
        let page_base = page_idx as u64 * PAGE_SIZE;
        // Split into the chains we can actually encode, each a run of
        // offsets whose consecutive deltas fit `max_delta_slots` (after
        // trying a single relay slot for each gap).
        let mut chains: Vec<Vec<u64>> = vec![vec![offsets[0]]];
        for &offset in &offsets[1..] {
            let chain = chains.last_mut().unwrap();
            let prev = *chain.last().unwrap();
            let delta_slots = (offset - prev) / 4;
            if delta_slots <= max_delta_slots {
                chain.push(offset);
                continue;
            }
            if let Some(relay) = find_zero_relay(region_bytes, prev, offset, max_delta_slots) {
                chain.push(relay);
                chain.push(offset);
                continue;
            }
            chains.push(vec![offset]);
        }

        page_starts[page_idx] = ((offsets[0] - page_base) / 4) as u16;
        for (chain_idx, chain) in chains.iter().enumerate() {
            for pair in chain.windows(2) {
                let (cur, next) = (pair[0], pair[1]);
                write_delta_slot(region_bytes, cur, (next - cur) / 4, shift, value_add)?;
            }
            let last = *chain.last().unwrap();
            write_delta_slot(region_bytes, last, 0, shift, value_add)?;

            if chain_idx > 0 {
                let mut entry = ((chain[0] - page_base) / 4) as u16;
                if chain_idx == chains.len() - 1 {
                    entry |= end_bit;
                }
                page_extras.push(entry);
            }
        }
        if chains.len() > 1 {
            page_starts[page_idx] |= PAGE_ATTR_EXTRA;
        }
    }

    Ok(SlideInfoV2 {
        version,
        page_size: PAGE_SIZE as u32,
        delta_mask,
        value_add,
        page_starts,
        page_extras,
    })
}

fn find_zero_relay(region_bytes: &[u8], from: u64, to: u64, max_delta_slots: u64) -> Option<u64> {
    let mut candidate = from + 4;
    while candidate < to {
        let bytes = region_bytes.get(candidate as usize..candidate as usize + 8)?;
        if bytes.iter().all(|&b| b == 0)
            && (candidate - from) / 4 <= max_delta_slots
            && (to - candidate) / 4 <= max_delta_slots
        {
            return Some(candidate);
        }
        candidate += 4;
    }
    None
}

fn write_delta_slot(region_bytes: &mut [u8], offset: u64, delta_slots: u64, shift: u32, value_add: u64) -> Result<()> {
    let slot = region_bytes
        .get_mut(offset as usize..offset as usize + 8)
        .ok_or(BuildError::SlideInfoOverflow)?;
    let mut raw = u64::from_le_bytes(slot.try_into().unwrap());
    raw = raw.wrapping_sub(value_add);
    raw |= delta_slots << shift;
    slot.copy_from_slice(&raw.to_le_bytes());
    Ok(())
}

/// arm64e V3 chained-fixup descriptors (spec.md §4.8 V3, GLOSSARY
/// "Chained fixup"). Each set slot becomes either a 43-bit-target/8-bit-
/// high8 descriptor or, when the ASLR tracker's `auth` side table has an
/// entry for it, a 32-bit-target authenticated descriptor. `next` is an
/// 11-bit count of 8-byte strides to the next rebase on the page; pages
/// whose chain needs more reach than 11 bits allow overflow the format.
fn encode_v3(region_bytes: &mut [u8], region_size: u64, aslr: &AslrTracker, base_address: u64) -> Result<SlideInfoV3> {
    const PAGE_SIZE: u64 = 0x4000;
    const MAX_NEXT: u64 = 0x7FF;

    let num_pages = region_size.div_ceil(PAGE_SIZE) as usize;
    let mut page_starts = vec![DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE; num_pages];

    let mut offsets_by_page: Vec<Vec<u64>> = vec![Vec::new(); num_pages];
    for offset in aslr.iter_offsets() {
        let page = (offset / PAGE_SIZE) as usize;
        if page < num_pages {
            offsets_by_page[page].push(offset);
        }
    }

    for (page_idx, offsets) in offsets_by_page.iter().enumerate() {
        if offsets.is_empty() {
            continue;
        }
        let page_base = page_idx as u64 * PAGE_SIZE;
        page_starts[page_idx] = ((offsets[0] - page_base) / 8) as u16;

        for (i, &offset) in offsets.iter().enumerate() {
            let next_delta = match offsets.get(i + 1) {
                Some(&next) => {
                    let strides = (next - offset) / 8;
                    if strides > MAX_NEXT {
                        return Err(BuildError::SlideInfoOverflow);
                    }
                    strides
                }
                None => 0,
            };

            let slot = region_bytes
                .get_mut(offset as usize..offset as usize + 8)
                .ok_or(BuildError::SlideInfoOverflow)?;
            let raw = u64::from_le_bytes(slot.try_into().unwrap());
            let target = raw.wrapping_sub(base_address);

            let encoded = if let Some(meta) = aslr.auth.get(&(offset / 4)) {
                let target32 = (target & 0xFFFF_FFFF) as u64;
                target32
                    | ((meta.diversity as u64) << 32)
                    | ((meta.addr_div as u64) << 48)
                    | ((meta.key as u64) << 49)
                    | (next_delta << 51)
                    | (1u64 << 63) // authenticated
            } else {
                let high8 = aslr.high8.get(&(offset / 4)).copied().unwrap_or(0) as u64;
                (target & 0x7_FFFF_FFFFF) | (high8 << 43) | (next_delta << 51)
            };
            slot.copy_from_slice(&encoded.to_le_bytes());
        }
    }

    Ok(SlideInfoV3 {
        version: 3,
        page_size: PAGE_SIZE as u32,
        auth_value_add: base_address,
        page_starts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchLayout;

    #[test]
    fn v2_no_rebase_page_gets_sentinel() {
        let arch = ArchLayout::for_arch("arm64").unwrap();
        let mut region = vec![0u8; 0x2000];
        let aslr = AslrTracker::default();
        let info = encode_region(arch, &mut region, region.len() as u64, &aslr, 0).unwrap();
        match info {
            SlideInfo::V2(v2) => {
                assert_eq!(v2.page_starts, vec![DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE; 2]);
            }
            _ => panic!("expected v2"),
        }
    }

    #[test]
    fn v2_single_rebase_terminates_chain() {
        let arch = ArchLayout::for_arch("arm64").unwrap();
        let mut region = vec![0u8; 0x1000];
        region[0x10..0x18].copy_from_slice(&0x1_8000_1000u64.to_le_bytes());
        let mut aslr = AslrTracker::default();
        aslr.set_bit(0x10);
        let info = encode_region(arch, &mut region, region.len() as u64, &aslr, 0x1_8000_0000).unwrap();
        match info {
            SlideInfo::V2(v2) => {
                assert_eq!(v2.page_starts.len(), 1);
                assert_ne!(v2.page_starts[0], DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE);
                assert_eq!(v2.page_extras.len(), 0);
            }
            _ => panic!("expected v2"),
        }
    }

    #[test]
    fn v3_single_rebase_has_zero_next() {
        let arch = ArchLayout::for_arch("arm64e").unwrap();
        let mut region = vec![0u8; 0x4000];
        region[0x20..0x28].copy_from_slice(&0x1_8000_1000u64.to_le_bytes());
        let mut aslr = AslrTracker::default();
        aslr.set_bit(0x20);
        let info = encode_region(arch, &mut region, region.len() as u64, &aslr, 0x1_8000_0000).unwrap();
        match info {
            SlideInfo::V3(v3) => {
                assert_eq!(v3.page_starts.len(), 1);
                assert_ne!(v3.page_starts[0], DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE);
                let raw = u64::from_le_bytes(region[0x20..0x28].try_into().unwrap());
                let next = (raw >> 51) & 0x7FF;
                assert_eq!(next, 0);
            }
            _ => panic!("expected v3"),
        }
    }
}
