//! C11 — codesigner / UUID (spec.md §4.9, on-disk shapes §6.4).
//!
//! Lays out an ad-hoc `CS_SuperBlob` over the final bytes of one sub-cache
//! (TEXT + DATA* + LINKEDIT [+ local symbols]), then derives the cache
//! UUID from the resulting CodeDirectory and patches it back into page 0 —
//! which requires re-hashing page 0 a second time, per spec.md's "key
//! twist".
//!
//! Page hashing is the first of the two parallel fan-outs spec.md §5
//! names: every page's hash lands in a disjoint slice of the pre-sized
//! hash-slot buffer, so no locking is needed across the `std::thread::scope`
//! fan-out — mirroring the teacher's `dumper_cpu_info` one-thread-per-core
//! split, just for hashing instead of `/proc` reads.

use sha1::{Digest as _, Sha1};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::CodeSigningDigestMode;
use crate::error::Result;

pub mod constants {
    pub const CS_MAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
    pub const CS_MAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;
    pub const CS_MAGIC_REQUIREMENTS: u32 = 0xfade_0c01;
    pub const CS_MAGIC_BLOBWRAPPER: u32 = 0xfade_0b01;
    pub const CS_HASHTYPE_SHA1: u8 = 1;
    pub const CS_HASHTYPE_SHA256: u8 = 2;
    /// `kSecCodeSignatureAdhoc`.
    pub const CS_ADHOC: u32 = 0x0000_0002;
    pub const CODE_DIRECTORY_VERSION: u32 = 0x0002_0400;
    pub const CSSLOT_CODEDIRECTORY: u32 = 0;
    pub const CSSLOT_REQUIREMENTS: u32 = 2;
    pub const CSSLOT_CMS_SIGNATURE: u32 = 0x1_0000;
    pub const CSSLOT_ALTERNATE_CODEDIRECTORY_0: u32 = 0x1000;
}
use constants::*;

pub const CD_HASH_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct SignResult {
    pub super_blob: Vec<u8>,
    pub uuid: Uuid,
    pub cd_hash: [u8; CD_HASH_LEN],
    pub cd_hash_agile: Option<[u8; CD_HASH_LEN]>,
}

fn hash_pages(buffer: &[u8], page_size: u32, code_limit: u64, sha256: bool) -> Vec<u8> {
    let page_size = page_size as usize;
    let num_pages = (code_limit as usize).div_ceil(page_size);
    let hash_size = if sha256 { 32 } else { 20 };
    let mut slots = vec![0u8; num_pages * hash_size];

    std::thread::scope(|scope| {
        let chunk = num_pages.div_ceil(std::thread::available_parallelism().map_or(1, |n| n.get()));
        let chunk = chunk.max(1);
        for (worker_idx, slot_chunk) in slots.chunks_mut(chunk * hash_size).enumerate() {
            let start_page = worker_idx * chunk;
            scope.spawn(move || {
                for (i, out) in slot_chunk.chunks_mut(hash_size).enumerate() {
                    let page = start_page + i;
                    let begin = page * page_size;
                    let end = (begin + page_size).min(buffer.len());
                    let data = if begin < buffer.len() { &buffer[begin..end] } else { &[] };
                    if sha256 {
                        out.copy_from_slice(&Sha256::digest(data));
                    } else {
                        out.copy_from_slice(&Sha1::digest(data));
                    }
                }
            });
        }
    });

    slots
}

fn rehash_page(buffer: &[u8], page_size: u32, page_index: usize, sha256: bool) -> Vec<u8> {
    let page_size = page_size as usize;
    let begin = page_index * page_size;
    let end = (begin + page_size).min(buffer.len());
    let data = if begin < buffer.len() { &buffer[begin..end] } else { &[] };
    if sha256 {
        Sha256::digest(data).to_vec()
    } else {
        Sha1::digest(data).to_vec()
    }
}

/// One CodeDirectory blob: header fields + identifier + hash slots, built
/// and re-serializable so page 0's slot can be patched after the UUID is
/// known.
struct CodeDirectory {
    hash_type: u8,
    hash_size: u8,
    page_size_log2: u8,
    code_limit: u64,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    identifier: String,
    hashes: Vec<u8>,
}

impl CodeDirectory {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&CS_MAGIC_CODEDIRECTORY.to_be_bytes());
        let length_placeholder = out.len();
        out.extend_from_slice(&0u32.to_be_bytes()); // length, patched below
        out.extend_from_slice(&CODE_DIRECTORY_VERSION.to_be_bytes());
        out.extend_from_slice(&CS_ADHOC.to_be_bytes()); // flags

        let ident_bytes = self.identifier.as_bytes();
        let header_size = 4 + 4 + 4 + 4 // magic, length, version, flags
            + 4 // hashOffset
            + 4 // identOffset
            + 4 // nSpecialSlots
            + 4 // nCodeSlots
            + 8 // codeLimit64 (we always use the 64-bit-capable layout)
            + 1 + 1 + 1 + 1 // hashSize, hashType, platform, pageSize
            + 4 // spare2
            + 8 + 8 + 4; // execSegBase, execSegLimit, execSegFlags
        let ident_offset = header_size as u32;
        let hash_offset = ident_offset + ident_bytes.len() as u32 + 1;

        out.extend_from_slice(&hash_offset.to_be_bytes());
        out.extend_from_slice(&ident_offset.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // nSpecialSlots
        let n_code_slots = (self.hashes.len() / self.hash_size as usize) as u32;
        out.extend_from_slice(&n_code_slots.to_be_bytes());
        out.extend_from_slice(&self.code_limit.to_be_bytes());
        out.push(self.hash_size);
        out.push(self.hash_type);
        out.push(0); // platform
        out.push(self.page_size_log2);
        out.extend_from_slice(&0u32.to_be_bytes()); // spare2
        out.extend_from_slice(&self.exec_seg_base.to_be_bytes());
        out.extend_from_slice(&self.exec_seg_limit.to_be_bytes());
        out.extend_from_slice(&1u32.to_be_bytes()); // execSegFlags: CS_EXECSEG_MAIN_BINARY-ish, adhoc cache

        debug_assert_eq!(out.len(), header_size);
        out.extend_from_slice(ident_bytes);
        out.push(0);
        debug_assert_eq!(out.len() as u32, hash_offset);
        out.extend_from_slice(&self.hashes);

        let len = out.len() as u32;
        out[length_placeholder..length_placeholder + 4].copy_from_slice(&len.to_be_bytes());
        out
    }

    /// Byte offset of code-slot `page_index`'s hash within `serialize()`'s
    /// output, used to patch page 0's slot after the UUID is known.
    fn hash_slot_offset(&self, page_index: usize) -> usize {
        let ident_bytes_len = self.identifier.len() + 1;
        let header_size = 4 + 4 + 4 + 4 + 4 + 4 + 4 + 4 + 8 + 1 + 1 + 1 + 1 + 4 + 8 + 8 + 4;
        header_size + ident_bytes_len + page_index * self.hash_size as usize
    }
}

fn cd_hash(cd_bytes: &[u8], sha256: bool) -> [u8; CD_HASH_LEN] {
    let mut out = [0u8; CD_HASH_LEN];
    if sha256 {
        out.copy_from_slice(&Sha256::digest(cd_bytes)[..CD_HASH_LEN]);
    } else {
        out.copy_from_slice(&Sha1::digest(cd_bytes));
    }
    out
}

fn force_rfc4122_v3(bytes: &mut [u8; 16]) {
    bytes[6] = (bytes[6] & 0x0F) | 0x30;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
}

/// Sign one sub-cache's final buffer in place (patching `uuid_offset` with
/// the derived UUID) and return the serialized `CS_SuperBlob`.
pub fn sign(
    buffer: &mut [u8],
    code_limit: u64,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    page_size: u32,
    digest_mode: CodeSigningDigestMode,
    identifier: &str,
    uuid_offset: usize,
) -> Result<SignResult> {
    let page_size_log2 = page_size.trailing_zeros() as u8;
    let want_sha256 = !matches!(digest_mode, CodeSigningDigestMode::Sha1Only);
    let want_sha1 = !matches!(digest_mode, CodeSigningDigestMode::Sha256Only);

    let sha256_hashes = want_sha256.then(|| hash_pages(buffer, page_size, code_limit, true));
    let sha1_hashes = want_sha1.then(|| hash_pages(buffer, page_size, code_limit, false));

    // Primary CD per spec.md §4.9/§8 scenario 4: Agile uses SHA1 as
    // primary with a SHA256 alternate; single-digest modes use whichever
    // was requested.
    let primary_is_sha256 = matches!(digest_mode, CodeSigningDigestMode::Sha256Only);

    let build_cd = |sha256: bool, hashes: &[u8]| CodeDirectory {
        hash_type: if sha256 { CS_HASHTYPE_SHA256 } else { CS_HASHTYPE_SHA1 },
        hash_size: if sha256 { 32 } else { 20 },
        page_size_log2,
        code_limit,
        exec_seg_base,
        exec_seg_limit,
        identifier: identifier.to_string(),
        hashes: hashes.to_vec(),
    };

    let mut primary_cd = if primary_is_sha256 {
        build_cd(true, sha256_hashes.as_ref().unwrap())
    } else {
        build_cd(false, sha1_hashes.as_ref().unwrap())
    };
    let mut alternate_cd = match digest_mode {
        CodeSigningDigestMode::Agile => Some(build_cd(true, sha256_hashes.as_ref().unwrap())),
        _ => None,
    };

    // UUID derivation: SHA256 of the primary CD, truncated, RFC4122 v3
    // forced, then patched into page 0 and that page's hash recomputed in
    // every CD this build is emitting.
    let primary_bytes_pre_uuid = primary_cd.serialize();
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&Sha256::digest(&primary_bytes_pre_uuid)[..16]);
    force_rfc4122_v3(&mut uuid);

    if let Some(slot) = buffer.get_mut(uuid_offset..uuid_offset + 16) {
        slot.copy_from_slice(&uuid);
    }

    let new_page0_sha256 = want_sha256.then(|| rehash_page(buffer, page_size, 0, true));
    let new_page0_sha1 = want_sha1.then(|| rehash_page(buffer, page_size, 0, false));

    if primary_is_sha256 {
        let off = primary_cd.hash_slot_offset(0);
        primary_cd.hashes[..32].copy_from_slice(new_page0_sha256.as_ref().unwrap());
        let _ = off;
    } else {
        primary_cd.hashes[..20].copy_from_slice(new_page0_sha1.as_ref().unwrap());
    }
    if let Some(alt) = alternate_cd.as_mut() {
        alt.hashes[..32].copy_from_slice(new_page0_sha256.as_ref().unwrap());
    }

    let primary_bytes = primary_cd.serialize();
    let alternate_bytes = alternate_cd.as_ref().map(|cd| cd.serialize());

    let cd_hash_value = cd_hash(&primary_bytes, primary_is_sha256);
    let cd_hash_agile = alternate_bytes.as_ref().map(|b| cd_hash(b, true));

    let requirements_blob = {
        let mut b = Vec::new();
        b.extend_from_slice(&CS_MAGIC_REQUIREMENTS.to_be_bytes());
        b.extend_from_slice(&12u32.to_be_bytes());
        b.extend_from_slice(&0u32.to_be_bytes());
        b
    };
    let cms_blob = {
        let mut b = Vec::new();
        b.extend_from_slice(&CS_MAGIC_BLOBWRAPPER.to_be_bytes());
        b.extend_from_slice(&8u32.to_be_bytes());
        b
    };

    let mut entries: Vec<(u32, Vec<u8>)> = vec![
        (CSSLOT_CODEDIRECTORY, primary_bytes),
        (CSSLOT_REQUIREMENTS, requirements_blob),
        (CSSLOT_CMS_SIGNATURE, cms_blob),
    ];
    if let Some(alt) = alternate_bytes {
        entries.push((CSSLOT_ALTERNATE_CODEDIRECTORY_0, alt));
    }

    let super_blob = build_super_blob(&entries);

    Ok(SignResult {
        super_blob,
        uuid: Uuid::from_bytes(uuid),
        cd_hash: cd_hash_value,
        cd_hash_agile,
    })
}

fn build_super_blob(entries: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let index_size = 8 * entries.len();
    let header_size = 12 + index_size;
    let mut offsets = Vec::with_capacity(entries.len());
    let mut cursor = header_size as u32;
    for (_, blob) in entries {
        offsets.push(cursor);
        cursor += blob.len() as u32;
    }

    let mut out = Vec::with_capacity(cursor as usize);
    out.extend_from_slice(&CS_MAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    out.extend_from_slice(&cursor.to_be_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for ((slot_type, _), offset) in entries.iter().zip(&offsets) {
        out.extend_from_slice(&slot_type.to_be_bytes());
        out.extend_from_slice(&offset.to_be_bytes());
    }
    for (_, blob) in entries {
        out.extend_from_slice(blob);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_only_produces_one_cd_and_no_alternate() {
        let mut buffer = vec![0u8; 0x4000];
        let result = sign(
            &mut buffer,
            0x4000,
            0,
            0x1000,
            0x1000,
            CodeSigningDigestMode::Sha256Only,
            "com.apple.dyld.cache",
            16,
        )
        .unwrap();
        assert!(result.cd_hash_agile.is_none());
        assert_ne!(result.uuid, Uuid::nil());
        // RFC4122 v3 bits forced.
        assert_eq!(result.uuid.as_bytes()[6] & 0xF0, 0x30);
        assert_eq!(result.uuid.as_bytes()[8] & 0xC0, 0x80);
    }

    #[test]
    fn agile_mode_has_four_slots() {
        let mut buffer = vec![0u8; 0x2000];
        let result = sign(
            &mut buffer,
            0x2000,
            0,
            0x1000,
            0x1000,
            CodeSigningDigestMode::Agile,
            "com.apple.dyld.cache",
            16,
        )
        .unwrap();
        assert!(result.cd_hash_agile.is_some());
        let count = u32::from_be_bytes(result.super_blob[8..12].try_into().unwrap());
        assert_eq!(count, 4);
    }

    #[test]
    fn uuid_is_embedded_at_requested_offset() {
        let mut buffer = vec![0u8; 0x1000];
        let result = sign(
            &mut buffer,
            0x1000,
            0,
            0x1000,
            0x1000,
            CodeSigningDigestMode::Sha256Only,
            "x",
            100,
        )
        .unwrap();
        assert_eq!(&buffer[100..116], result.uuid.as_bytes());
    }
}
