//! C1 — architecture profile.
//!
//! A compile-time table mapping an architecture name to the handful of
//! constants that drive every other stage: base address, total VM size,
//! page size, the chained-fixup delta mask, the per-sub-cache TEXT limit,
//! and the layout mode. Grounded in `_s_archLayout` (spec.md §9 DESIGN
//! NOTES) and in `examples/original_source/dyld/cache-builder/*` which
//! hard-codes one of these tables per supported CPU.
//!
//! Modeled after the teacher's `minidump_cpu.rs`, which is the same shape
//! of "one compile-time table per architecture" dispatch, just for CPU
//! context records instead of address layout.

use bitflags::bitflags;

bitflags! {
    /// Per-architecture layout behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArchFlags: u32 {
        /// Sub-caches are not necessarily contiguous in VM space.
        const DISCONTIGUOUS   = 1 << 0;
        /// 64-bit pointers throughout.
        const IS64            = 1 << 1;
        /// Chained-fixup pages add `value_add` back onto the raw target.
        const USE_VALUE_ADD   = 1 << 2;
        /// DATA/LINKEDIT of all dylibs is split into dedicated trailing
        /// sub-caches rather than living alongside each dylib's TEXT.
        const SPLIT_LAYOUT    = 1 << 3;
        /// Pointers in DATA use arm64e authentication metadata.
        const AUTH_PTRS       = 1 << 4;
    }
}

/// Which chained-fixup slide-info format an architecture's DATA pages are
/// encoded with, per spec.md §4.8 / §6.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideInfoFormat {
    /// Non-arm64e 64-bit, and armv7k/arm64_32 32-bit hosts.
    V2,
    /// arm64e: per-slot `{target, high8, next}` or `{target, diversity,
    /// addrDiv, key, next, auth}` chained-fixup descriptors.
    V3,
    /// Same shape as V2 but with a different end-bit and version tag.
    V4,
}

/// Immutable architecture layout parameters (spec.md §3 `ArchLayout`).
#[derive(Debug, Clone, Copy)]
pub struct ArchLayout {
    pub name: &'static str,
    pub base_address: u64,
    pub shared_region_size: u64,
    /// 0 means "one sub-cache, no TEXT-size limit".
    pub sub_cache_text_limit: u64,
    pub page_size: u32,
    pub code_signing_page_size: u32,
    pub pointer_delta_mask: u64,
    pub alignment_exponent: u32,
    pub slide_info_format: SlideInfoFormat,
    pub flags: ArchFlags,
}

impl ArchLayout {
    pub fn is64(&self) -> bool {
        self.flags.contains(ArchFlags::IS64)
    }

    pub fn split_layout(&self) -> bool {
        self.flags.contains(ArchFlags::SPLIT_LAYOUT)
    }

    pub fn discontiguous(&self) -> bool {
        self.flags.contains(ArchFlags::DISCONTIGUOUS)
    }

    pub fn use_value_add(&self) -> bool {
        self.flags.contains(ArchFlags::USE_VALUE_ADD)
    }

    pub fn authenticated_pointers(&self) -> bool {
        self.flags.contains(ArchFlags::AUTH_PTRS)
    }

    /// `align(addr, 2^exponent)`.
    pub fn align(&self, addr: u64) -> u64 {
        align_to(addr, 1u64 << self.alignment_exponent)
    }

    /// Look up the layout table entry for an architecture name.
    pub fn for_arch(name: &str) -> crate::error::Result<&'static ArchLayout> {
        ARCH_TABLE
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| crate::error::BuildError::UnsupportedArch(name.to_string()))
    }
}

pub fn align_to(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Static, compile-time constant table, total ordering by arch name (spec.md
/// §9 DESIGN NOTES).
pub static ARCH_TABLE: &[ArchLayout] = &[
    ArchLayout {
        name: "arm64",
        base_address: 0x1_8000_0000,
        shared_region_size: 0x1_0000_0000,
        sub_cache_text_limit: 0,
        page_size: 0x4000,
        code_signing_page_size: 0x4000,
        pointer_delta_mask: 0x00FF_FF00_0000_0000,
        alignment_exponent: 14,
        slide_info_format: SlideInfoFormat::V2,
        flags: ArchFlags::DISCONTIGUOUS
            .union(ArchFlags::IS64)
            .union(ArchFlags::USE_VALUE_ADD),
    },
    ArchLayout {
        name: "arm64e",
        base_address: 0x1_8000_0000,
        shared_region_size: 0x1_0000_0000,
        sub_cache_text_limit: 0x4000_0000,
        page_size: 0x4000,
        code_signing_page_size: 0x4000,
        pointer_delta_mask: 0x0000_7FFF_0000_0000,
        alignment_exponent: 14,
        slide_info_format: SlideInfoFormat::V3,
        flags: ArchFlags::DISCONTIGUOUS
            .union(ArchFlags::IS64)
            .union(ArchFlags::SPLIT_LAYOUT)
            .union(ArchFlags::AUTH_PTRS),
    },
    ArchLayout {
        name: "arm64_32",
        base_address: 0x8000_0000,
        shared_region_size: 0x4000_0000,
        sub_cache_text_limit: 0,
        page_size: 0x4000,
        code_signing_page_size: 0x4000,
        pointer_delta_mask: 0x00FF_0000,
        alignment_exponent: 14,
        slide_info_format: SlideInfoFormat::V2,
        flags: ArchFlags::USE_VALUE_ADD,
    },
    ArchLayout {
        name: "armv7k",
        base_address: 0x8000_0000,
        shared_region_size: 0x1800_0000,
        sub_cache_text_limit: 0,
        page_size: 0x1000,
        code_signing_page_size: 0x1000,
        pointer_delta_mask: 0x0000_0000,
        alignment_exponent: 12,
        slide_info_format: SlideInfoFormat::V2,
        flags: ArchFlags::USE_VALUE_ADD,
    },
    ArchLayout {
        name: "x86_64",
        base_address: 0x7FFF_8000_0000,
        shared_region_size: 0x4000_0000,
        sub_cache_text_limit: 0,
        page_size: 0x1000,
        code_signing_page_size: 0x1000,
        pointer_delta_mask: 0,
        alignment_exponent: 12,
        slide_info_format: SlideInfoFormat::V2,
        flags: ArchFlags::IS64,
    },
    ArchLayout {
        name: "x86_64h",
        base_address: 0x7FFF_8000_0000,
        shared_region_size: 0x4000_0000,
        sub_cache_text_limit: 0,
        page_size: 0x1000,
        code_signing_page_size: 0x1000,
        pointer_delta_mask: 0,
        alignment_exponent: 12,
        slide_info_format: SlideInfoFormat::V2,
        flags: ArchFlags::IS64,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_known_arch() {
        let layout = ArchLayout::for_arch("arm64e").unwrap();
        assert!(layout.split_layout());
        assert!(layout.authenticated_pointers());
        assert_eq!(layout.slide_info_format, SlideInfoFormat::V3);
    }

    #[test]
    fn rejects_unknown_arch() {
        assert!(ArchLayout::for_arch("riscv64").is_err());
    }

    #[test]
    fn align_rounds_up_to_page() {
        let layout = ArchLayout::for_arch("arm64").unwrap();
        assert_eq!(layout.align(1), 0x4000);
        assert_eq!(layout.align(0x4000), 0x4000);
        assert_eq!(layout.align(0x4001), 0x8000);
    }
}
