//! C9 — dylib-path and program trie emission (spec.md §4.7), plus the
//! per-dylib `dyld_cache_image_text_info` array (SPEC_FULL.md §C.5).
//!
//! Both tries share [`crate::trie::TrieBuilder`]; what differs is only the
//! key and payload. The dylib-path trie's payload is a ULEB128-encoded
//! image index (so a loader can binary-search-free its way from an
//! `open()` path straight to the image array); the program trie's payload
//! is a ULEB128-encoded offset into the (not-yet-modeled) PrebuiltLoaderSet
//! pool, which this crate treats as an opaque blob supplied by the external
//! optimizer (SPEC_FULL.md §B).

use crate::header::ImageTextInfo;
use crate::model::DylibInfo;
use crate::trie::{write_uleb128, TrieBuilder};

/// Build the dylib-path trie: every cached dylib's install name, plus any
/// extra load-path aliases it's known by, each mapping to its `image_index`.
pub fn build_dylib_trie(dylibs: &[DylibInfo], aliases: &[(String, usize)]) -> Vec<u8> {
    let mut builder = TrieBuilder::new();
    for dylib in dylibs {
        let mut payload = Vec::new();
        write_uleb128(&mut payload, dylib.image_index as u64);
        builder.insert(&dylib.install_name, payload);
        if dylib.path != dylib.install_name {
            let mut payload = Vec::new();
            write_uleb128(&mut payload, dylib.image_index as u64);
            builder.insert(&dylib.path, payload);
        }
    }
    for (alias, image_index) in aliases {
        let mut payload = Vec::new();
        write_uleb128(&mut payload, *image_index as u64);
        builder.insert(alias, payload);
    }
    builder.build()
}

/// One entry the program trie can resolve: either a main-executable path,
/// or a `"/cdhash/<40-hex>"` key recovered from a cdHash-only launch lookup
/// (spec.md §4.7), mapped to an offset into the PrebuiltLoaderSet pool.
pub struct ProgramEntry {
    pub key: String,
    pub pool_offset: u64,
}

pub fn cdhash_key(cd_hash: &[u8; 20]) -> String {
    let mut s = String::with_capacity(8 + 40);
    s.push_str("/cdhash/");
    for byte in cd_hash {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

pub fn build_program_trie(entries: &[ProgramEntry]) -> Vec<u8> {
    let mut builder = TrieBuilder::new();
    for entry in entries {
        let mut payload = Vec::new();
        write_uleb128(&mut payload, entry.pool_offset);
        builder.insert(&entry.key, payload);
    }
    builder.build()
}

/// Build the `dyld_cache_image_text_info` array (SPEC_FULL.md §C.5): one
/// entry per cached dylib, in image-index order, giving its UUID, load
/// address, `__TEXT` size, and an offset into the shared path string pool
/// the caller maintains (the same pool `header::ImageInfo.path_file_offset`
/// indexes into).
pub fn build_image_text_info(
    dylibs: &[DylibInfo],
    base_address: u64,
    path_offset_of: impl Fn(&DylibInfo) -> u32,
) -> Vec<ImageTextInfo> {
    let mut out = Vec::with_capacity(dylibs.len());
    for dylib in dylibs {
        let text_mappings: Vec<_> = dylib
            .segment_mappings
            .iter()
            .filter(|m| m.region == crate::model::RegionKind::Text)
            .collect();
        let text_offset = text_mappings.iter().map(|m| m.dst_offset_in_region).min().unwrap_or(0);
        let text_size: u64 = text_mappings.iter().map(|m| m.dst_size).sum();
        out.push(ImageTextInfo {
            uuid: uuid::Uuid::from_bytes(dylib.image.uuid()),
            load_address: base_address + text_offset,
            text_segment_size: text_size,
            path_offset: path_offset_of(dylib),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::ParsedImage;
    use crate::model::{RegionKind, SegmentMapping, TextCoalescer};

    fn dylib(install_name: &str, path: &str, image_index: usize) -> DylibInfo {
        DylibInfo {
            install_name: install_name.to_string(),
            path: path.to_string(),
            image: Box::new(ParsedImage::default()),
            segment_mappings: vec![SegmentMapping {
                source_segment_index: 0,
                region: RegionKind::Text,
                dst_offset_in_region: 0x4000,
                dst_size: 0x1000,
                copy_size: 0x1000,
            }],
            text_coalescer: TextCoalescer::default(),
            owning_subcache: 0,
            image_index,
        }
    }

    #[test]
    fn dylib_trie_resolves_install_name_and_alias_path() {
        let dylibs = vec![dylib("/usr/lib/libfoo.dylib", "/usr/lib/libfoo.dylib", 0)];
        let aliases = vec![("/usr/lib/libfoo_alias.dylib".to_string(), 0)];
        let bytes = build_dylib_trie(&dylibs, &aliases);
        let entries = crate::trie::decode_all(&bytes);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn cdhash_key_formats_as_lowercase_hex() {
        let hash = [0xabu8; 20];
        let key = cdhash_key(&hash);
        assert!(key.starts_with("/cdhash/ab"));
        assert_eq!(key.len(), 8 + 40);
    }

    #[test]
    fn image_text_info_uses_minimum_text_offset() {
        let dylibs = vec![dylib("/usr/lib/libfoo.dylib", "/usr/lib/libfoo.dylib", 3)];
        let infos = build_image_text_info(&dylibs, 0x1_8000_0000, |_| 100);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].load_address, 0x1_8000_4000);
        assert_eq!(infos[0].text_segment_size, 0x1000);
        assert_eq!(infos[0].path_offset, 100);
    }
}
