//! C8 — patch-table emitter (spec.md §4.6, on-disk shapes in §6.2).
//!
//! Compresses the `PatchTuple`s the binder (C7) recorded into the six
//! parallel arrays of `PatchInfoV2`. A static never-eliminate symbol list
//! plus `verify::is_overridable_path` gate which exports actually get an
//! entry (spec.md §4.6 pass 1); SPEC_FULL.md §C.1 adds the read-side query
//! API (`uses_of_export`/`should_patch_client`) mirroring the original's
//! `forEachPatchableUseOfExport`/`shouldPatchClientOfImage`.

use std::collections::BTreeMap;

use crate::error::{BuildError, Result};
use crate::model::{PatchTuple, PointerMetaData};
use crate::verify::is_overridable_path;

/// Symbols that always get a patch-table entry regardless of path
/// overridability, per spec.md §4.6 pass 1 ("static never-eliminate list").
pub const NEVER_ELIMINATE_SYMBOLS: &[&str] = &[
    "_malloc",
    "_free",
    "_realloc",
    "_calloc",
    "_memcpy",
    "_memmove",
    "_dispatch_async",
    "_dispatch_sync",
    "_objc_msgSend",
    "__ZdlPv",  // operator delete(void*)
    "__Znwm",   // operator new(unsigned long)
];

fn is_never_eliminate(name: &str) -> bool {
    NEVER_ELIMINATE_SYMBOLS.contains(&name) || name.ends_with("_setter") || name.starts_with("_objc_set")
}

/// `PatchableLocationV2`'s bitfield payload (spec.md §6.2). `addend` is the
/// signed 5-bit value; encoding sign-extends via `(addend << 52) >> 52` on
/// decode, matching `CachePatching.h`'s `getAddend()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedLocation {
    pub dylib_offset_of_use: u32,
    pub high7: u8,
    pub addend5: u8,
    pub authenticated: bool,
    pub uses_address_diversity: bool,
    pub key: u8,
    pub discriminator: u16,
}

pub fn encode_addend(addend: i64) -> u8 {
    (addend as u64 & 0x1F) as u8
}

pub fn decode_addend(addend5: u8) -> i64 {
    (((addend5 as u64) << 59) as i64) >> 59
}

fn encode_location(tuple: &PatchTuple, producer_export_high8_halved: u8) -> EncodedLocation {
    let meta = &tuple.pointer_meta;
    EncodedLocation {
        dylib_offset_of_use: tuple.location_dylib_vm_offset as u32,
        high7: producer_export_high8_halved,
        addend5: encode_addend(tuple.addend),
        authenticated: meta.authenticated,
        uses_address_diversity: meta.addr_div,
        key: meta.key,
        discriminator: meta.diversity,
    }
}

#[derive(Debug, Clone)]
pub struct ImageExport {
    pub dylib_offset_of_impl: u64,
    pub export_name_offset: u32,
}

#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub client_dylib_index: usize,
    pub client_exports_start: u32,
    pub client_exports_count: u32,
}

#[derive(Debug, Clone)]
pub struct ClientExportEntry {
    pub image_export_index: u32,
    pub locations_start: u32,
    pub locations_count: u32,
}

#[derive(Debug, Clone)]
pub struct ImagePatches {
    pub clients_start: u32,
    pub clients_count: u32,
}

/// The fully-built, not-yet-serialized patch table (spec.md §6.2
/// `PatchInfoV2` plus its five sub-arrays).
#[derive(Debug, Clone, Default)]
pub struct PatchTable {
    pub image_patches: Vec<ImagePatches>,
    pub image_exports: Vec<ImageExport>,
    pub clients: Vec<ClientEntry>,
    pub client_exports: Vec<ClientExportEntry>,
    pub locations: Vec<EncodedLocation>,
    pub export_names: Vec<u8>,
}

/// `sizeof(PatchableLocationV2)` in the serialized form [`PatchTable::serialize`]
/// writes: offset(4) + bitfield(4), per spec.md §6.2's bit-exact
/// `{u32 dylibOffsetOfUse; u32 {high7:7,addend:5,authenticated:1,
/// usesAddressDiversity:1,key:2,discriminator:16}}`.
pub const PATCHABLE_LOCATION_SIZE: u32 = 8;

impl EncodedLocation {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.dylib_offset_of_use.to_le_bytes());
        let bitfield: u32 = (self.high7 as u32)
            | ((self.addend5 as u32) << 7)
            | ((self.authenticated as u32) << 12)
            | ((self.uses_address_diversity as u32) << 13)
            | ((self.key as u32) << 14)
            | ((self.discriminator as u32) << 16);
        out.extend_from_slice(&bitfield.to_le_bytes());
    }
}

impl ImageExport {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.dylib_offset_of_impl.to_le_bytes());
        out.extend_from_slice(&self.export_name_offset.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }
}

impl ClientEntry {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.client_dylib_index as u32).to_le_bytes());
        out.extend_from_slice(&self.client_exports_start.to_le_bytes());
        out.extend_from_slice(&self.client_exports_count.to_le_bytes());
    }
}

impl ClientExportEntry {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.image_export_index.to_le_bytes());
        out.extend_from_slice(&self.locations_start.to_le_bytes());
        out.extend_from_slice(&self.locations_count.to_le_bytes());
    }
}

impl ImagePatches {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.clients_start.to_le_bytes());
        out.extend_from_slice(&self.clients_count.to_le_bytes());
    }
}

impl PatchTable {
    /// Lay the six parallel arrays out back-to-back after a fixed
    /// `PatchInfoV2` header (spec.md §6.2), returning the fully serialized
    /// blob that `header::CacheHeader.patch_info_addr/size` points at.
    pub fn serialize(&self) -> Vec<u8> {
        const HEADER_SIZE: u32 = 4 + 4 * 2 * 6; // version + 6 (offset,count) pairs

        let mut cursor = HEADER_SIZE;
        let image_patches_off = cursor;
        cursor += self.image_patches.len() as u32 * 8;
        let image_exports_off = cursor;
        cursor += self.image_exports.len() as u32 * 16;
        let clients_off = cursor;
        cursor += self.clients.len() as u32 * 12;
        let client_exports_off = cursor;
        cursor += self.client_exports.len() as u32 * 12;
        let locations_off = cursor;
        cursor += self.locations.len() as u32 * PATCHABLE_LOCATION_SIZE;
        let export_names_off = cursor;
        cursor += self.export_names.len() as u32;

        let mut out = Vec::with_capacity(cursor as usize);
        out.extend_from_slice(&2u32.to_le_bytes()); // patchTableVersion
        out.extend_from_slice(&image_patches_off.to_le_bytes());
        out.extend_from_slice(&(self.image_patches.len() as u32).to_le_bytes());
        out.extend_from_slice(&image_exports_off.to_le_bytes());
        out.extend_from_slice(&(self.image_exports.len() as u32).to_le_bytes());
        out.extend_from_slice(&clients_off.to_le_bytes());
        out.extend_from_slice(&(self.clients.len() as u32).to_le_bytes());
        out.extend_from_slice(&client_exports_off.to_le_bytes());
        out.extend_from_slice(&(self.client_exports.len() as u32).to_le_bytes());
        out.extend_from_slice(&locations_off.to_le_bytes());
        out.extend_from_slice(&(self.locations.len() as u32).to_le_bytes());
        out.extend_from_slice(&export_names_off.to_le_bytes());
        out.extend_from_slice(&(self.export_names.len() as u32).to_le_bytes());

        for p in &self.image_patches {
            p.write(&mut out);
        }
        for e in &self.image_exports {
            e.write(&mut out);
        }
        for c in &self.clients {
            c.write(&mut out);
        }
        for c in &self.client_exports {
            c.write(&mut out);
        }
        for l in &self.locations {
            l.write(&mut out);
        }
        out.extend_from_slice(&self.export_names);

        out
    }

    /// SPEC_FULL.md §C.1: `forEachPatchableUseOfExport` — every recorded use
    /// of `(producer_index, export_dylib_offset)`, as `(client_index,
    /// location_offset, location)` triples.
    pub fn uses_of_export(
        &self,
        producer_index: usize,
        export_dylib_offset: u64,
    ) -> Vec<(usize, u32, EncodedLocation)> {
        let Some(patches) = self.image_patches.get(producer_index) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for client in &self.clients
            [patches.clients_start as usize..(patches.clients_start + patches.clients_count) as usize]
        {
            for client_export in &self.client_exports[client.client_exports_start as usize
                ..(client.client_exports_start + client.client_exports_count) as usize]
            {
                let export = &self.image_exports[client_export.image_export_index as usize];
                if export.dylib_offset_of_impl != export_dylib_offset {
                    continue;
                }
                for loc in &self.locations[client_export.locations_start as usize
                    ..(client_export.locations_start + client_export.locations_count) as usize]
                {
                    out.push((client.client_dylib_index, loc.dylib_offset_of_use, *loc));
                }
            }
        }
        out
    }

    /// SPEC_FULL.md §C.1: `shouldPatchClientOfImage` — does producer
    /// `producer_index` have any recorded patch entry naming `client_index`
    /// as a client at all.
    pub fn should_patch_client(&self, producer_index: usize, client_index: usize) -> bool {
        let Some(patches) = self.image_patches.get(producer_index) else {
            return false;
        };
        self.clients[patches.clients_start as usize..(patches.clients_start + patches.clients_count) as usize]
            .iter()
            .any(|c| c.client_dylib_index == client_index)
    }
}

/// Build the patch table from every tuple the binder recorded across all
/// cached dylibs. `producer_path` looks up a producer's install-name (used
/// only for the overridability gate).
pub fn build_patch_table(
    tuples: &[PatchTuple],
    num_dylibs: usize,
    producer_path: impl Fn(usize) -> String,
) -> Result<PatchTable> {
    // Pass 1: filter to tuples whose export must be kept, grouped by
    // (producer, export_offset, export_name) -> (client -> [locations]).
    let mut kept: Vec<&PatchTuple> = Vec::new();
    for tuple in tuples {
        let path = producer_path(tuple.producer_image_index);
        if is_overridable_path(&path) || is_never_eliminate(&tuple.export_name) || tuple.weak_def {
            kept.push(tuple);
        }
    }

    // Group by producer -> export -> client -> locations, preserving a
    // deterministic iteration order (image index, then export offset, then
    // client index, then location offset).
    type ExportKey = (u64, String);
    let mut by_producer: BTreeMap<usize, BTreeMap<ExportKey, BTreeMap<usize, Vec<&PatchTuple>>>> =
        BTreeMap::new();
    for tuple in &kept {
        by_producer
            .entry(tuple.producer_image_index)
            .or_default()
            .entry((tuple.export_dylib_vm_offset, tuple.export_name.clone()))
            .or_default()
            .entry(tuple.client_image_index)
            .or_default()
            .push(tuple);
    }

    let mut table = PatchTable {
        image_patches: vec![ImagePatches { clients_start: 0, clients_count: 0 }; num_dylibs],
        ..Default::default()
    };

    for producer in 0..num_dylibs {
        let clients_start = table.clients.len() as u32;
        let mut clients_count = 0u32;

        if let Some(exports) = by_producer.get(&producer) {
            // Need client -> export -> locations, inverted from
            // export -> client -> locations, to match the on-disk shape
            // (clients[] indexes into clientExports[], not the reverse).
            let mut by_client: BTreeMap<usize, Vec<(&ExportKey, &Vec<&PatchTuple>)>> = BTreeMap::new();
            for (export_key, per_client) in exports {
                for (client, locs) in per_client {
                    by_client.entry(*client).or_default().push((export_key, locs));
                }
            }

            for (client_index, exports_for_client) in &by_client {
                let client_exports_start = table.client_exports.len() as u32;
                for (export_key, locs) in exports_for_client {
                    let (export_offset, export_name) = export_key;
                    let export_name_offset = table.export_names.len() as u32;
                    table.export_names.extend_from_slice(export_name.as_bytes());
                    table.export_names.push(0);
                    while table.export_names.len() % 4 != 0 {
                        table.export_names.push(0);
                    }
                    let image_export_index = table.image_exports.len() as u32;
                    table.image_exports.push(ImageExport {
                        dylib_offset_of_impl: *export_offset,
                        export_name_offset,
                    });

                    let locations_start = table.locations.len() as u32;
                    for loc in locs.iter() {
                        let high8 = loc.pointer_meta.high8;
                        if high8 % 2 != 0 {
                            return Err(BuildError::SymbolCountMiscalculation);
                        }
                        table.locations.push(encode_location(loc, high8 / 2));
                    }
                    let locations_count = locs.len() as u32;

                    table.client_exports.push(ClientExportEntry {
                        image_export_index,
                        locations_start,
                        locations_count,
                    });
                }
                let client_exports_count = table.client_exports.len() as u32 - client_exports_start;
                table.clients.push(ClientEntry {
                    client_dylib_index: *client_index,
                    client_exports_start,
                    client_exports_count,
                });
                clients_count += 1;
            }
        }

        table.image_patches[producer] = ImagePatches { clients_start, clients_count };
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(producer: usize, export_off: u64, name: &str, client: usize, use_off: u64) -> PatchTuple {
        weak_tuple(producer, export_off, name, client, use_off, false)
    }

    fn weak_tuple(
        producer: usize,
        export_off: u64,
        name: &str,
        client: usize,
        use_off: u64,
        weak_def: bool,
    ) -> PatchTuple {
        PatchTuple {
            producer_image_index: producer,
            export_dylib_vm_offset: export_off,
            export_name: name.to_string(),
            client_image_index: client,
            location_dylib_vm_offset: use_off,
            pointer_meta: PointerMetaData::default(),
            addend: 0,
            weak_def,
        }
    }

    #[test]
    fn never_eliminate_symbol_survives_non_overridable_path() {
        let tuples = vec![tuple(0, 0x10, "_malloc", 1, 0x1234)];
        let table = build_patch_table(&tuples, 2, |_| "/usr/lib/libc.dylib".to_string()).unwrap();
        let uses = table.uses_of_export(0, 0x10);
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, 1);
        assert_eq!(uses[0].1, 0x1234);
    }

    #[test]
    fn non_overridable_non_never_eliminate_export_is_dropped() {
        let tuples = vec![tuple(0, 0x10, "_someInternalHelper", 1, 0x1234)];
        let table = build_patch_table(&tuples, 2, |_| "/usr/lib/libc.dylib".to_string()).unwrap();
        assert!(table.uses_of_export(0, 0x10).is_empty());
        assert!(!table.should_patch_client(0, 1));
    }

    #[test]
    fn weak_def_export_survives_non_overridable_non_never_eliminate_path() {
        let tuples = vec![weak_tuple(0, 0x10, "_someWeakHelper", 1, 0x1234, true)];
        let table = build_patch_table(&tuples, 2, |_| "/usr/lib/libc.dylib".to_string()).unwrap();
        let uses = table.uses_of_export(0, 0x10);
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, 1);
        assert_eq!(uses[0].1, 0x1234);
    }

    #[test]
    fn addend_sign_extension_round_trips() {
        assert_eq!(encode_addend(-1), 0x1F);
        assert_eq!(decode_addend(0x1F), -1);
        assert_eq!(decode_addend(0x00), 0);
    }

    #[test]
    fn serialize_lays_out_header_and_export_names_last() {
        let tuples = vec![tuple(0, 0x10, "_malloc", 1, 0x1234)];
        let table = build_patch_table(&tuples, 2, |_| "/usr/lib/libc.dylib".to_string()).unwrap();
        let bytes = table.serialize();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 2);
        assert!(bytes.ends_with(b"_malloc\0"));
    }
}
