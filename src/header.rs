//! On-disk cache file header (spec.md §6.1) plus the small fixed-shape
//! arrays that hang directly off it: per-region mappings, per-dylib image
//! records, per-dylib TEXT info, and the trailing sub-cache array. The
//! patch table (§6.2) and slide-info blobs (§6.3) are big enough to get
//! their own modules ([`crate::patch`], [`crate::slide_info`]); everything
//! here is the glue that points at them.
//!
//! Byte layout is written by hand with `extend_from_slice`/`to_le_bytes`,
//! the same approach [`crate::trie`] and [`crate::patch`] use for their
//! on-disk shapes, rather than pulling `scroll`'s writer traits in on top
//! of its reader traits already used by [`crate::macho`].

use bitflags::bitflags;
use uuid::Uuid;

pub const MAGIC_PREFIX: &str = "dyld_v1";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const DYLIBS_EXPECTED_ON_DISK = 1 << 0;
        const SIMULATOR               = 1 << 1;
        const LOCALLY_BUILT_CACHE     = 1 << 2;
        const BUILT_FROM_CHAINED_FIXUPS = 1 << 3;
    }
}

bitflags! {
    /// Flag bits of a `MappingWithSlideInfo` record (spec.md §6.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        const AUTH_DATA  = 1;
        const DIRTY_DATA = 2;
        const CONST_DATA = 4;
    }
}

/// One `{address, size, fileOffset, maxProt, initProt}` mapping record.
#[derive(Debug, Clone, Copy)]
pub struct MappingInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

impl MappingInfo {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.file_offset.to_le_bytes());
        out.extend_from_slice(&self.max_prot.to_le_bytes());
        out.extend_from_slice(&self.init_prot.to_le_bytes());
    }
}

/// The same region plus slide-info location/flags.
#[derive(Debug, Clone, Copy)]
pub struct MappingWithSlideInfo {
    pub mapping: MappingInfo,
    pub slide_info_file_offset: u64,
    pub slide_info_file_size: u64,
    pub flags: MappingFlags,
}

impl MappingWithSlideInfo {
    fn write(&self, out: &mut Vec<u8>) {
        self.mapping.write(out);
        out.extend_from_slice(&self.slide_info_file_offset.to_le_bytes());
        out.extend_from_slice(&self.slide_info_file_size.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // pad to 8-byte align
    }
}

/// `{address, modTime, inode, pathFileOffset, pad}`, one per cached dylib
/// plus one per alias (spec.md §6.1 `imagesOffset`).
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_file_offset: u32,
}

impl ImageInfo {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.mod_time.to_le_bytes());
        out.extend_from_slice(&self.inode.to_le_bytes());
        out.extend_from_slice(&self.path_file_offset.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // pad
    }
}

/// `{uuid[16], loadAddress, textSegmentSize, pathOffset}` (SPEC_FULL.md §C.5,
/// `dyld_cache_image_text_info`).
#[derive(Debug, Clone, Copy)]
pub struct ImageTextInfo {
    pub uuid: Uuid,
    pub load_address: u64,
    pub text_segment_size: u64,
    pub path_offset: u32,
}

impl ImageTextInfo {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.uuid.as_bytes());
        out.extend_from_slice(&self.load_address.to_le_bytes());
        out.extend_from_slice(&self.text_segment_size.to_le_bytes());
        out.extend_from_slice(&self.path_offset.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // pad
    }
}

/// `{uuid[16], cacheVMOffset}`, trailing the first sub-cache's header only
/// (spec.md §4.9, §6.1 `subCacheArrayOffset`).
#[derive(Debug, Clone, Copy)]
pub struct SubCacheEntry {
    pub uuid: Uuid,
    pub cache_vm_offset: u64,
}

impl SubCacheEntry {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.uuid.as_bytes());
        out.extend_from_slice(&self.cache_vm_offset.to_le_bytes());
    }
}

/// Everything an already-laid-out sub-cache needs to serialize its header
/// (spec.md §6.1, bit-exact field order). `*_addr`/`*_size` fields that name
/// another blob (patch table, tries, slide info) are filled in by the
/// builder once those blobs have been placed into the file.
#[derive(Debug, Clone, Default)]
pub struct CacheHeader {
    pub arch_name: String,
    pub mappings: Vec<MappingInfo>,
    pub mappings_with_slide: Vec<MappingWithSlideInfo>,
    pub images: Vec<ImageInfo>,
    pub images_text: Vec<ImageTextInfo>,
    pub patch_info_addr: u32,
    pub patch_info_size: u32,
    pub dylibs_trie_addr: u32,
    pub dylibs_trie_size: u32,
    pub program_trie_addr: u32,
    pub program_trie_size: u32,
    pub dylibs_pbl_set_addr: u64,
    pub programs_pbl_set_pool_addr: u64,
    pub programs_pbl_set_pool_size: u64,
    pub sub_caches: Vec<SubCacheEntry>,
    pub code_signature_offset: u64,
    pub code_signature_size: u64,
    pub local_symbols_offset: u64,
    pub local_symbols_size: u64,
    pub uuid: Uuid,
    pub symbol_file_uuid: Uuid,
    pub platform: u8,
    pub format_version: u8,
    pub flags: HeaderFlags,
    pub shared_region_start: u64,
    pub shared_region_size: u64,
    pub max_slide: u64,
    pub rosetta_read_only_addr: u64,
    pub rosetta_read_only_size: u64,
    pub rosetta_read_write_addr: u64,
    pub rosetta_read_write_size: u64,
    pub os_version: u64,
    pub alt_platform: u32,
    pub alt_os_version: u64,
}

/// Fixed header byte size up to (not including) the variable-length
/// trailing arrays: enough `u32 offset/count` and `u64` fields to lay every
/// array out contiguously after it, as spec.md §6.1 describes.
pub const HEADER_FIXED_SIZE: u64 = 16 // magic
    + 4 * 2  // mappings
    + 4 * 2  // mappingsWithSlide
    + 4 * 2  // images
    + 4 * 2  // imagesText
    + 4 * 2  // patchInfo
    + 4 * 2  // dylibsTrie
    + 4 * 2  // programTrie
    + 8      // dylibsPBLSetAddr
    + 8 * 2  // programsPBLSetPool
    + 4 * 2  // subCacheArray
    + 8 * 2  // codeSignature
    + 8 * 2  // localSymbols
    + 16 * 2 // uuid + symbolFileUUID
    + 4      // platform/formatVersion/flags/pad
    + 8 * 2  // sharedRegion
    + 8      // maxSlide
    + 8 * 2  // rosettaRO
    + 8 * 2  // rosettaRW
    + 8      // osVersion
    + 4      // altPlatform
    + 8; // altOsVersion

impl CacheHeader {
    /// Lay out the trailing arrays back-to-back starting right after the
    /// fixed header, and return the fully serialized header bytes (the
    /// caller appends TEXT/DATA*/LINKEDIT/CodeSignature after this).
    pub fn serialize(&self) -> Vec<u8> {
        let mut cursor = HEADER_FIXED_SIZE;

        let mappings_off = cursor;
        cursor += self.mappings.len() as u64 * 28;
        let mappings_slide_off = cursor;
        cursor += self.mappings_with_slide.len() as u64 * 44;
        let images_off = cursor;
        cursor += self.images.len() as u64 * 24;
        let images_text_off = cursor;
        cursor += self.images_text.len() as u64 * 36;
        let subcache_off = cursor;
        cursor += self.sub_caches.len() as u64 * 24;

        let mut out = Vec::with_capacity(cursor as usize);

        let mut magic = [0u8; 16];
        let prefix = MAGIC_PREFIX.as_bytes();
        magic[..prefix.len()].copy_from_slice(prefix);
        let arch_bytes = self.arch_name.as_bytes();
        let start = 15usize.saturating_sub(arch_bytes.len()).max(prefix.len());
        let avail = 16 - start;
        let n = arch_bytes.len().min(avail.saturating_sub(1));
        magic[start..start + n].copy_from_slice(&arch_bytes[..n]);
        out.extend_from_slice(&magic);

        out.extend_from_slice(&(mappings_off as u32).to_le_bytes());
        out.extend_from_slice(&(self.mappings.len() as u32).to_le_bytes());
        out.extend_from_slice(&(mappings_slide_off as u32).to_le_bytes());
        out.extend_from_slice(&(self.mappings_with_slide.len() as u32).to_le_bytes());
        out.extend_from_slice(&(images_off as u32).to_le_bytes());
        out.extend_from_slice(&(self.images.len() as u32).to_le_bytes());
        out.extend_from_slice(&(images_text_off as u32).to_le_bytes());
        out.extend_from_slice(&(self.images_text.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.patch_info_addr.to_le_bytes());
        out.extend_from_slice(&self.patch_info_size.to_le_bytes());
        out.extend_from_slice(&self.dylibs_trie_addr.to_le_bytes());
        out.extend_from_slice(&self.dylibs_trie_size.to_le_bytes());
        out.extend_from_slice(&self.program_trie_addr.to_le_bytes());
        out.extend_from_slice(&self.program_trie_size.to_le_bytes());
        out.extend_from_slice(&self.dylibs_pbl_set_addr.to_le_bytes());
        out.extend_from_slice(&self.programs_pbl_set_pool_addr.to_le_bytes());
        out.extend_from_slice(&self.programs_pbl_set_pool_size.to_le_bytes());
        out.extend_from_slice(&(subcache_off as u32).to_le_bytes());
        out.extend_from_slice(&(self.sub_caches.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.code_signature_offset.to_le_bytes());
        out.extend_from_slice(&self.code_signature_size.to_le_bytes());
        out.extend_from_slice(&self.local_symbols_offset.to_le_bytes());
        out.extend_from_slice(&self.local_symbols_size.to_le_bytes());
        out.extend_from_slice(self.uuid.as_bytes());
        out.extend_from_slice(self.symbol_file_uuid.as_bytes());
        out.push(self.platform);
        out.push(self.format_version);
        out.extend_from_slice(&(self.flags.bits() as u16).to_le_bytes());
        out.extend_from_slice(&self.shared_region_start.to_le_bytes());
        out.extend_from_slice(&self.shared_region_size.to_le_bytes());
        out.extend_from_slice(&self.max_slide.to_le_bytes());
        out.extend_from_slice(&self.rosetta_read_only_addr.to_le_bytes());
        out.extend_from_slice(&self.rosetta_read_only_size.to_le_bytes());
        out.extend_from_slice(&self.rosetta_read_write_addr.to_le_bytes());
        out.extend_from_slice(&self.rosetta_read_write_size.to_le_bytes());
        out.extend_from_slice(&self.os_version.to_le_bytes());
        out.extend_from_slice(&self.alt_platform.to_le_bytes());
        out.extend_from_slice(&self.alt_os_version.to_le_bytes());

        debug_assert_eq!(out.len() as u64, HEADER_FIXED_SIZE);

        for m in &self.mappings {
            m.write(&mut out);
        }
        for m in &self.mappings_with_slide {
            m.write(&mut out);
        }
        for i in &self.images {
            i.write(&mut out);
        }
        for i in &self.images_text {
            i.write(&mut out);
        }
        for s in &self.sub_caches {
            s.write(&mut out);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_carries_arch_name() {
        let header = CacheHeader {
            arch_name: "arm64e".to_string(),
            ..Default::default()
        };
        let bytes = header.serialize();
        let magic = &bytes[0..16];
        let text = String::from_utf8_lossy(magic);
        assert!(text.contains("arm64e"));
    }

    #[test]
    fn trailing_arrays_land_after_fixed_header() {
        let header = CacheHeader {
            mappings: vec![MappingInfo {
                address: 0,
                size: 0x1000,
                file_offset: 0,
                max_prot: 3,
                init_prot: 1,
            }],
            ..Default::default()
        };
        let bytes = header.serialize();
        assert_eq!(bytes.len() as u64, HEADER_FIXED_SIZE + 28);
    }
}
