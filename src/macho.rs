//! The "Mach-O reader" external collaborator (spec.md §1, SPEC_FULL.md §B).
//!
//! `MachoImage` is the read-side interface the out-of-scope Mach-O reader
//! exposes to the rest of this crate. [`parse`] is a bounded concrete
//! implementation of it, good enough to drive the pipeline end-to-end over
//! ordinary dylibs: mach_header_64, LC_SEGMENT_64/LC_UUID/LC_ID_DYLIB/
//! LC_LOAD_DYLIB family, LC_DYLD_EXPORTS_TRIE, and a constrained subset of
//! LC_DYLD_CHAINED_FIXUPS (generic64 and arm64e page-start/page-extra
//! records).
//!
//! Grounded in the teacher's `src/mac/streams/module_list.rs`, which
//! hand-rolls the same load-command structs to walk a live task's loaded
//! images. That code casts raw pointers into live process memory; here we
//! are parsing untrusted bytes from an mmap'd file, so every read goes
//! through `scroll`'s bounds-checked accessors instead.

use scroll::{Pread, LE};

use crate::error::{BuildError, Result};
use crate::trie;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM_64: u32 = 0xcffa_edfe;

const LC_REQ_DYLD: u32 = 0x8000_0000;
const LC_SEGMENT_64: u32 = 0x19;
const LC_ID_DYLIB: u32 = 0x0d;
const LC_LOAD_DYLIB: u32 = 0x0c;
const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
const LC_UUID: u32 = 0x1b;
const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

const DYLD_CHAINED_PTR_64: u16 = 2;
const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
const DYLD_CHAINED_PTR_ARM64E: u16 = 1;

const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

/// One `__TEXT`/`__DATA`/... segment, with its sections (spec.md §3).
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub max_prot: i32,
    pub init_prot: i32,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub segment_name: String,
    pub addr: u64,
    pub size: u64,
    pub flags: u32,
}

/// How strongly this image depends on another dylib.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Load,
    Weak,
    Reexport,
    Upward,
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub install_name: String,
    pub kind: DependencyKind,
    pub current_version: u32,
    pub compatibility_version: u32,
}

#[derive(Debug, Clone)]
pub struct ExportSymbol {
    pub name: String,
    pub offset: u64,
    pub weak_definition: bool,
    pub reexport: bool,
    pub reexported_from: Option<(u64, String)>,
    pub stub_and_resolver: bool,
}

/// A single fixup location decoded out of `LC_DYLD_CHAINED_FIXUPS`, in the
/// constrained generic64/arm64e subset SPEC_FULL.md §B commits to.
#[derive(Debug, Clone)]
pub enum FixupKind {
    Rebase { target: u64 },
    /// `lib_ordinal` is the 1-based `LC_LOAD_DYLIB` dependency ordinal and
    /// `symbol_name` the bind target's name, both already resolved from the
    /// chained-fixups imports/symbols tables (spec.md §4.5 "symbolic bind"
    /// needs a name to look up, not just an ordinal into the dependency
    /// list).
    Bind { lib_ordinal: u32, symbol_name: String, addend: i64 },
    AuthRebase { target: u32, diversity: u16, addr_div: bool, key: u8 },
    AuthBind { lib_ordinal: u32, symbol_name: String, diversity: u16, addr_div: bool, key: u8 },
}

#[derive(Debug, Clone)]
pub struct Fixup {
    /// Byte offset from the start of the whole mapped image (i.e. including
    /// the segment's own `vmaddr` base, already added in).
    pub image_offset: u64,
    pub kind: FixupKind,
}

/// The read-side interface this crate treats as externally supplied.
pub trait MachoImage {
    fn install_name(&self) -> &str;
    fn uuid(&self) -> [u8; 16];
    fn is64(&self) -> bool;
    fn cpu_type(&self) -> i32;
    fn cpu_subtype(&self) -> i32;
    fn current_version(&self) -> u32;
    fn compatibility_version(&self) -> u32;
    fn segments(&self) -> &[Segment];
    fn dependencies(&self) -> &[Dependency];
    fn exports(&self) -> &[ExportSymbol];
    fn fixups(&self) -> &[Fixup];
}

/// A bounded, in-memory parse result for one dylib file. See module docs.
#[derive(Debug, Clone, Default)]
pub struct ParsedImage {
    pub install_name: String,
    pub uuid: [u8; 16],
    pub is64: bool,
    pub cpu_type: i32,
    pub cpu_subtype: i32,
    pub current_version: u32,
    pub compatibility_version: u32,
    pub segments: Vec<Segment>,
    pub dependencies: Vec<Dependency>,
    pub exports: Vec<ExportSymbol>,
    pub fixups: Vec<Fixup>,
}

impl MachoImage for ParsedImage {
    fn install_name(&self) -> &str {
        &self.install_name
    }
    fn uuid(&self) -> [u8; 16] {
        self.uuid
    }
    fn is64(&self) -> bool {
        self.is64
    }
    fn cpu_type(&self) -> i32 {
        self.cpu_type
    }
    fn cpu_subtype(&self) -> i32 {
        self.cpu_subtype
    }
    fn current_version(&self) -> u32 {
        self.current_version
    }
    fn compatibility_version(&self) -> u32 {
        self.compatibility_version
    }
    fn segments(&self) -> &[Segment] {
        &self.segments
    }
    fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }
    fn exports(&self) -> &[ExportSymbol] {
        &self.exports
    }
    fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }
}

fn cstr16(bytes: &[u8; 16]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(16);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_cstr_at(data: &[u8], offset: usize) -> Result<String> {
    let rest = data
        .get(offset..)
        .ok_or_else(|| parse_error("load command string offset out of range"))?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| parse_error("unterminated load command string"))?;
    Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
}

fn parse_error(message: &str) -> BuildError {
    BuildError::FixupFailed {
        message: message.to_string(),
        dylib_path: String::new(),
    }
}

/// Parse a single Mach-O dylib from its raw file bytes (no fat/universal
/// header support: spec.md §2 takes one arch slice's worth of input per
/// build, so fat-slice selection is the input loader's job, not this
/// parser's).
pub fn parse(data: &[u8]) -> Result<ParsedImage> {
    let magic: u32 = data
        .pread_with(0, LE)
        .map_err(|_| parse_error("file too small for a mach_header"))?;
    if magic == MH_CIGAM_64 {
        return Err(parse_error("big-endian mach-o input is not supported"));
    }
    if magic != MH_MAGIC_64 {
        return Err(parse_error("not a 64-bit mach-o file"));
    }

    let cpu_type: i32 = data.pread_with(4, LE).map_err(|_| parse_error("truncated header"))?;
    let cpu_subtype: i32 = data.pread_with(8, LE).map_err(|_| parse_error("truncated header"))?;
    let _filetype: u32 = data.pread_with(12, LE).map_err(|_| parse_error("truncated header"))?;
    let ncmds: u32 = data.pread_with(16, LE).map_err(|_| parse_error("truncated header"))?;
    let sizeofcmds: u32 = data.pread_with(20, LE).map_err(|_| parse_error("truncated header"))?;

    const HEADER_SIZE: usize = 32;
    let commands_end = HEADER_SIZE + sizeofcmds as usize;
    if data.len() < commands_end {
        return Err(parse_error("load commands run past end of file"));
    }

    let mut image = ParsedImage {
        is64: true,
        cpu_type,
        cpu_subtype,
        ..Default::default()
    };

    let mut exports_trie: Option<(usize, usize)> = None;
    let mut chained_fixups: Option<(usize, usize)> = None;

    let mut offset = HEADER_SIZE;
    for _ in 0..ncmds {
        if offset + 8 > commands_end {
            return Err(parse_error("load command header runs past sizeofcmds"));
        }
        let cmd: u32 = data.pread_with(offset, LE).map_err(|_| parse_error("truncated binary"))?;
        let cmdsize: u32 = data.pread_with(offset + 4, LE).map_err(|_| parse_error("truncated binary"))?;
        if cmdsize < 8 || offset + cmdsize as usize > commands_end {
            return Err(parse_error("malformed load command size"));
        }

        match cmd {
            LC_SEGMENT_64 => image.segments.push(parse_segment(data, offset)?),
            LC_ID_DYLIB => {
                let (name_off, current_version, compat_version) = parse_dylib(data, offset)?;
                image.install_name = read_cstr_at(data, offset + name_off)?;
                image.current_version = current_version;
                image.compatibility_version = compat_version;
            }
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB => {
                let (name_off, current_version, compat_version) = parse_dylib(data, offset)?;
                let kind = match cmd {
                    LC_LOAD_WEAK_DYLIB => DependencyKind::Weak,
                    LC_REEXPORT_DYLIB => DependencyKind::Reexport,
                    LC_LOAD_UPWARD_DYLIB => DependencyKind::Upward,
                    _ => DependencyKind::Load,
                };
                image.dependencies.push(Dependency {
                    install_name: read_cstr_at(data, offset + name_off)?,
                    kind,
                    current_version,
                    compatibility_version: compat_version,
                });
            }
            LC_UUID => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(&data[offset + 8..offset + 24]);
                image.uuid = uuid;
            }
            LC_DYLD_EXPORTS_TRIE => {
                exports_trie = Some(parse_linkedit_data(data, offset)?);
            }
            LC_DYLD_CHAINED_FIXUPS => {
                chained_fixups = Some(parse_linkedit_data(data, offset)?);
            }
            _ => {}
        }

        offset += cmdsize as usize;
    }

    if let Some((trie_off, trie_size)) = exports_trie {
        image.exports = parse_exports_trie(data, trie_off, trie_size)?;
    }

    if let Some((fixups_off, fixups_size)) = chained_fixups {
        image.fixups = parse_chained_fixups(data, fixups_off, fixups_size, &image.segments)?;
    }

    Ok(image)
}

fn parse_segment(data: &[u8], offset: usize) -> Result<Segment> {
    let mut segname = [0u8; 16];
    segname.copy_from_slice(
        data.get(offset + 8..offset + 24)
            .ok_or_else(|| parse_error("truncated segment command"))?,
    );
    let name = cstr16(&segname);
    let vmaddr: u64 = data.pread_with(offset + 24, LE).map_err(|_| parse_error("truncated binary"))?;
    let vmsize: u64 = data.pread_with(offset + 32, LE).map_err(|_| parse_error("truncated binary"))?;
    let fileoff: u64 = data.pread_with(offset + 40, LE).map_err(|_| parse_error("truncated binary"))?;
    let filesize: u64 = data.pread_with(offset + 48, LE).map_err(|_| parse_error("truncated binary"))?;
    let max_prot: i32 = data.pread_with(offset + 56, LE).map_err(|_| parse_error("truncated binary"))?;
    let init_prot: i32 = data.pread_with(offset + 60, LE).map_err(|_| parse_error("truncated binary"))?;
    let nsects: u32 = data.pread_with(offset + 64, LE).map_err(|_| parse_error("truncated binary"))?;

    let mut sections = Vec::with_capacity(nsects as usize);
    let mut sect_offset = offset + 72; // sizeof(segment_command_64)
    for _ in 0..nsects {
        let mut sectname = [0u8; 16];
        let mut segname_field = [0u8; 16];
        sectname.copy_from_slice(
            data.get(sect_offset..sect_offset + 16)
                .ok_or_else(|| parse_error("truncated section"))?,
        );
        segname_field.copy_from_slice(
            data.get(sect_offset + 16..sect_offset + 32)
                .ok_or_else(|| parse_error("truncated section"))?,
        );
        let addr: u64 = data.pread_with(sect_offset + 32, LE).map_err(|_| parse_error("truncated binary"))?;
        let size: u64 = data.pread_with(sect_offset + 40, LE).map_err(|_| parse_error("truncated binary"))?;
        let flags: u32 = data.pread_with(sect_offset + 64, LE).map_err(|_| parse_error("truncated binary"))?;
        sections.push(Section {
            name: cstr16(&sectname),
            segment_name: cstr16(&segname_field),
            addr,
            size,
            flags,
        });
        sect_offset += 80; // sizeof(section_64)
    }

    Ok(Segment {
        name,
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        max_prot,
        init_prot,
        sections,
    })
}

/// Returns `(name_offset_within_command, current_version, compatibility_version)`.
fn parse_dylib(data: &[u8], offset: usize) -> Result<(usize, u32, u32)> {
    let name_off: u32 = data
        .pread_with(offset + 8, LE)
        .map_err(|_| parse_error("truncated dylib command"))?;
    let current_version: u32 = data.pread_with(offset + 16, LE).map_err(|_| parse_error("truncated binary"))?;
    let compat_version: u32 = data.pread_with(offset + 20, LE).map_err(|_| parse_error("truncated binary"))?;
    Ok((name_off as usize, current_version, compat_version))
}

/// Returns `(dataoff, datasize)` of a `linkedit_data_command`.
fn parse_linkedit_data(data: &[u8], offset: usize) -> Result<(usize, usize)> {
    let dataoff: u32 = data
        .pread_with(offset + 8, LE)
        .map_err(|_| parse_error("truncated linkedit_data_command"))?;
    let datasize: u32 = data.pread_with(offset + 12, LE).map_err(|_| parse_error("truncated binary"))?;
    Ok((dataoff as usize, datasize as usize))
}

fn parse_exports_trie(data: &[u8], offset: usize, size: usize) -> Result<Vec<ExportSymbol>> {
    let bytes = data
        .get(offset..offset + size)
        .ok_or_else(|| parse_error("export trie runs past end of file"))?;
    let entries = trie::decode_all(bytes);
    let mut exports = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some((flags, rest)) = trie::read_uleb128(&entry.terminal)
            .map(|(v, n)| (v, &entry.terminal[n..]))
        else {
            continue;
        };
        if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let Some((ordinal, n)) = trie::read_uleb128(rest) else {
                continue;
            };
            let lib_name = String::from_utf8_lossy(&rest[n..])
                .trim_end_matches('\0')
                .to_string();
            exports.push(ExportSymbol {
                name: entry.name,
                offset: 0,
                weak_definition: flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0,
                reexport: true,
                reexported_from: Some((ordinal, lib_name)),
                stub_and_resolver: false,
            });
            continue;
        }
        let Some((sym_offset, n)) = trie::read_uleb128(rest) else {
            continue;
        };
        let stub_and_resolver = flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0;
        if stub_and_resolver {
            // a resolver-offset ULEB128 follows; not needed by this crate's
            // pipeline so it is skipped rather than decoded.
            let _ = &rest[n..];
        }
        exports.push(ExportSymbol {
            name: entry.name,
            offset: sym_offset,
            weak_definition: flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0,
            reexport: false,
            reexported_from: None,
            stub_and_resolver,
        });
    }
    Ok(exports)
}

/// `DYLD_CHAINED_IMPORT` (format 1): the only import encoding this bounded
/// reader decodes (spec.md §1/SPEC_FULL.md §B — format 2/3, which add an
/// explicit addend field to each import rather than the pointer itself,
/// are rejected rather than silently mis-decoded).
const DYLD_CHAINED_IMPORT: u32 = 1;

fn parse_imports(data: &[u8], blob_offset: usize, header: &[u8]) -> Result<Vec<(u32, String)>> {
    // dyld_chained_fixups_header: fixups_version@0, starts_offset@4,
    // imports_offset@8, symbols_offset@12, imports_count@16,
    // imports_format@20, symbols_format@24.
    let imports_offset: u32 = header.pread_with(8, LE).map_err(|_| parse_error("truncated binary"))?;
    let symbols_offset: u32 = header.pread_with(12, LE).map_err(|_| parse_error("truncated binary"))?;
    let imports_count: u32 = header.pread_with(16, LE).map_err(|_| parse_error("truncated binary"))?;
    let imports_format: u32 = header.pread_with(20, LE).map_err(|_| parse_error("truncated binary"))?;
    if imports_count == 0 {
        return Ok(Vec::new());
    }
    if imports_format != DYLD_CHAINED_IMPORT {
        return Err(parse_error("unsupported chained-fixups imports format"));
    }

    let mut imports = Vec::with_capacity(imports_count as usize);
    for i in 0..imports_count {
        let entry_off = blob_offset + imports_offset as usize + i as usize * 4;
        let raw: u32 = data
            .pread_with(entry_off, LE)
            .map_err(|_| parse_error("chained import entry runs past end of file"))?;
        let lib_ordinal = raw & 0xFF;
        let name_offset = raw >> 9;
        let name = read_cstr_at(data, blob_offset + symbols_offset as usize + name_offset as usize)?;
        imports.push((lib_ordinal, name));
    }
    Ok(imports)
}

fn parse_chained_fixups(
    data: &[u8],
    offset: usize,
    size: usize,
    segments: &[Segment],
) -> Result<Vec<Fixup>> {
    let header = data
        .get(offset..offset + size)
        .ok_or_else(|| parse_error("chained fixups blob runs past end of file"))?;
    if header.len() < 28 {
        return Err(parse_error("chained fixups header too small"));
    }
    let starts_offset: u32 = header.pread_with(4, LE).map_err(|_| parse_error("truncated binary"))?;
    let imports = parse_imports(data, offset, header)?;

    let starts = data
        .get(offset + starts_offset as usize..offset + size)
        .ok_or_else(|| parse_error("chained starts-in-image runs past end of blob"))?;
    if starts.len() < 4 {
        return Ok(Vec::new());
    }
    let seg_count: u32 = starts.pread_with(0, LE).map_err(|_| parse_error("truncated binary"))?;

    let mut fixups = Vec::new();
    for seg_index in 0..seg_count {
        let entry_off = 4 + seg_index as usize * 4;
        let Some(seg_info_offset) = starts.get(entry_off..entry_off + 4) else {
            continue;
        };
        let seg_info_offset: u32 = seg_info_offset.pread_with(0, LE).map_err(|_| parse_error("truncated binary"))?;
        if seg_info_offset == 0 {
            continue;
        }
        let Some(seg_info) = starts.get(seg_info_offset as usize..) else {
            continue;
        };
        if seg_info.len() < 22 {
            continue;
        }
        let page_size: u16 = seg_info.pread_with(2, LE).map_err(|_| parse_error("truncated binary"))?;
        let pointer_format: u16 = seg_info.pread_with(4, LE).map_err(|_| parse_error("truncated binary"))?;
        let segment_offset: u64 = seg_info.pread_with(8, LE).map_err(|_| parse_error("truncated binary"))?;
        let page_count: u16 = seg_info.pread_with(20, LE).map_err(|_| parse_error("truncated binary"))?;

        let segment_base = segments
            .get(seg_index as usize)
            .map(|s| s.vmaddr)
            .unwrap_or(segment_offset);

        for page in 0..page_count {
            let start_off = 22 + page as usize * 2;
            let Some(raw) = seg_info.get(start_off..start_off + 2) else {
                continue;
            };
            let mut page_start: u16 = raw.pread_with(0, LE).map_err(|_| parse_error("truncated binary"))?;
            if page_start == 0xFFFF {
                continue;
            }
            // Chain-overflow "extras" bit: high bit set means page_start is
            // an index into a pageExtras array rather than a direct byte
            // offset. This bounded reader accepts only the common
            // non-overflow case and stops walking the chain if it's hit.
            if page_start & 0x8000 != 0 {
                page_start &= 0x7FFF;
            }

            let page_base = segment_base + segment_offset + page as u64 * page_size as u64;
            walk_chain(data, page_base, page_start as u64, pointer_format, &imports, &mut fixups);
        }
    }

    Ok(fixups)
}

/// Resolves a chain bind's import-table ordinal to the `(lib_ordinal,
/// symbol_name)` pair the binder (C7) actually needs. An out-of-range chain
/// ordinal (malformed input) resolves to dependency ordinal 0 and an empty
/// name, which the binder reports as an unresolved bind rather than
/// panicking.
fn resolve_import(imports: &[(u32, String)], chain_ordinal: u32) -> (u32, String) {
    imports
        .get(chain_ordinal as usize)
        .cloned()
        .unwrap_or((0, String::new()))
}

fn walk_chain(
    data: &[u8],
    page_base: u64,
    mut chain_offset: u64,
    pointer_format: u16,
    imports: &[(u32, String)],
    out: &mut Vec<Fixup>,
) {
    loop {
        let image_offset = page_base + chain_offset;
        let Some(raw) = data.get(image_offset as usize..image_offset as usize + 8) else {
            return;
        };
        let raw = u64::from_le_bytes(raw.try_into().expect("slice checked to be 8 bytes above"));

        let next = match pointer_format {
            DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
                let next = (raw >> 51) & 0xFFF;
                let is_bind = raw & (1 << 63) != 0;
                if is_bind {
                    let chain_ordinal = (raw & 0x00FF_FFFF) as u32;
                    let addend = ((raw >> 24) & 0xFF) as i64;
                    let (lib_ordinal, symbol_name) = resolve_import(imports, chain_ordinal);
                    out.push(Fixup {
                        image_offset,
                        kind: FixupKind::Bind { lib_ordinal, symbol_name, addend },
                    });
                } else {
                    let target = raw & 0xF_FFFF_FFFF;
                    out.push(Fixup {
                        image_offset,
                        kind: FixupKind::Rebase { target },
                    });
                }
                next
            }
            DYLD_CHAINED_PTR_ARM64E => {
                let next = (raw >> 51) & 0x7FF;
                let is_auth = raw & (1 << 63) != 0;
                let is_bind = raw & (1 << 62) != 0;
                if is_auth {
                    let diversity = (raw & 0xFFFF) as u16;
                    let addr_div = raw & (1 << 16) != 0;
                    let key = ((raw >> 17) & 0x3) as u8;
                    if is_bind {
                        let chain_ordinal = (raw >> 32) as u32 & 0xFFFF;
                        let (lib_ordinal, symbol_name) = resolve_import(imports, chain_ordinal);
                        out.push(Fixup {
                            image_offset,
                            kind: FixupKind::AuthBind { lib_ordinal, symbol_name, diversity, addr_div, key },
                        });
                    } else {
                        let target = (raw >> 32) as u32;
                        out.push(Fixup {
                            image_offset,
                            kind: FixupKind::AuthRebase { target, diversity, addr_div, key },
                        });
                    }
                } else if is_bind {
                    let chain_ordinal = (raw & 0xFFFF_FFFF) as u32;
                    let addend = ((raw >> 32) & 0xFF) as i64;
                    let (lib_ordinal, symbol_name) = resolve_import(imports, chain_ordinal);
                    out.push(Fixup {
                        image_offset,
                        kind: FixupKind::Bind { lib_ordinal, symbol_name, addend },
                    });
                } else {
                    let target = raw & 0x7_FFFF_FFFF;
                    out.push(Fixup {
                        image_offset,
                        kind: FixupKind::Rebase { target },
                    });
                }
                next
            }
            _ => return,
        };

        if next == 0 {
            return;
        }
        chain_offset += next * 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_i32(buf: &mut Vec<u8>, v: i32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn minimal_dylib() -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, MH_MAGIC_64);
        push_i32(&mut buf, 0x0100000c); // CPU_TYPE_ARM64
        push_i32(&mut buf, 0);
        push_u32(&mut buf, 0x6); // MH_DYLIB
        push_u32(&mut buf, 1); // ncmds
        push_u32(&mut buf, 0); // sizeofcmds, filled below
        push_u32(&mut buf, 0); // flags
        push_u32(&mut buf, 0); // reserved

        let mut seg = Vec::new();
        push_u32(&mut seg, LC_SEGMENT_64);
        push_u32(&mut seg, 0); // cmdsize, filled below
        let mut segname = [0u8; 16];
        segname[..6].copy_from_slice(b"__TEXT");
        seg.extend_from_slice(&segname);
        push_u64(&mut seg, 0x1000); // vmaddr
        push_u64(&mut seg, 0x4000); // vmsize
        push_u64(&mut seg, 0); // fileoff
        push_u64(&mut seg, 0x4000); // filesize
        push_i32(&mut seg, 7); // maxprot
        push_i32(&mut seg, 5); // initprot
        push_u32(&mut seg, 0); // nsects
        push_u32(&mut seg, 0); // flags
        let cmdsize = seg.len() as u32;
        seg[4..8].copy_from_slice(&cmdsize.to_le_bytes());

        buf[20..24].copy_from_slice(&cmdsize.to_le_bytes());
        buf.extend_from_slice(&seg);
        buf
    }

    #[test]
    fn parses_minimal_segment() {
        let bytes = minimal_dylib();
        let image = parse(&bytes).unwrap();
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].name, "__TEXT");
        assert_eq!(image.segments[0].vmaddr, 0x1000);
        assert_eq!(image.segments[0].vmsize, 0x4000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = minimal_dylib();
        bytes[0] = 0;
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn rejects_truncated_file() {
        assert!(parse(&[0u8; 4]).is_err());
    }

    /// Builds a dylib with a `__DATA` segment containing one
    /// `DYLD_CHAINED_PTR_64` bind pointer and the accompanying
    /// `LC_DYLD_CHAINED_FIXUPS` blob (one-entry imports table, no symbols
    /// compression). Regression coverage for the header field-offset fix:
    /// `parse_imports` used to read `symbols_offset`/`imports_count`/
    /// `imports_format` four bytes too far into the header, which would have
    /// resolved every bind to a garbage or out-of-range symbol name.
    fn dylib_with_one_bind(import_name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, MH_MAGIC_64);
        push_i32(&mut buf, 0x0100000c);
        push_i32(&mut buf, 0);
        push_u32(&mut buf, 0x6);
        push_u32(&mut buf, 3); // ncmds: text seg, data seg, chained fixups
        push_u32(&mut buf, 0); // sizeofcmds, filled below
        push_u32(&mut buf, 0);
        push_u32(&mut buf, 0);

        let mut text_seg = Vec::new();
        push_u32(&mut text_seg, LC_SEGMENT_64);
        push_u32(&mut text_seg, 0);
        let mut segname = [0u8; 16];
        segname[..6].copy_from_slice(b"__TEXT");
        text_seg.extend_from_slice(&segname);
        push_u64(&mut text_seg, 0); // vmaddr
        push_u64(&mut text_seg, 0x1000); // vmsize
        push_u64(&mut text_seg, 0); // fileoff
        push_u64(&mut text_seg, 0x1000); // filesize
        push_i32(&mut text_seg, 7);
        push_i32(&mut text_seg, 5);
        push_u32(&mut text_seg, 0);
        push_u32(&mut text_seg, 0);
        let text_cmdsize = text_seg.len() as u32;
        text_seg[4..8].copy_from_slice(&text_cmdsize.to_le_bytes());

        let data_vmaddr = 0x1000u64;
        let data_size = 0x1000u64;
        let mut data_seg = Vec::new();
        push_u32(&mut data_seg, LC_SEGMENT_64);
        push_u32(&mut data_seg, 0);
        let mut dataname = [0u8; 16];
        dataname[..6].copy_from_slice(b"__DATA");
        data_seg.extend_from_slice(&dataname);
        push_u64(&mut data_seg, data_vmaddr);
        push_u64(&mut data_seg, data_size);
        push_u64(&mut data_seg, data_vmaddr); // fileoff == vmaddr
        push_u64(&mut data_seg, data_size);
        push_i32(&mut data_seg, 3);
        push_i32(&mut data_seg, 3);
        push_u32(&mut data_seg, 0);
        push_u32(&mut data_seg, 0);
        let data_cmdsize = data_seg.len() as u32;
        data_seg[4..8].copy_from_slice(&data_cmdsize.to_le_bytes());

        // Chained-fixups blob, placed right after the __DATA segment's file
        // content: header (28 bytes) + starts-in-image (one segment, one
        // page) + one import entry + the import's symbol name.
        let header_size = 28usize;
        let starts_offset = header_size as u32;
        // starts_bytes is built precisely against what parse_chained_fixups
        // reads: seg_count@0, then one u32 seg_info_offset per segment
        // (relative to `starts` itself), then at that offset a
        // dyld_chained_starts_in_segment: page_size@+2 (u16), pointer_format@+4
        // (u16), segment_offset@+8 (u64), page_count@+20 (u16), followed by
        // page_count u16 page_starts.
        let mut starts_bytes = Vec::new();
        push_u32(&mut starts_bytes, 2); // seg_count
        push_u32(&mut starts_bytes, 0); // segment 0 (__TEXT): no fixups
        let seg1_info_offset = starts_bytes.len() as u32 + 4; // right after this u32
        push_u32(&mut starts_bytes, seg1_info_offset);
        let seg1_info_start = starts_bytes.len();
        debug_assert_eq!(seg1_info_start, seg1_info_offset as usize);
        starts_bytes.extend_from_slice(&0u16.to_le_bytes()); // size field (unused) @+0
        starts_bytes.extend_from_slice(&(data_size as u16).to_le_bytes()); // page_size @+2
        starts_bytes.extend_from_slice(&DYLD_CHAINED_PTR_64.to_le_bytes()); // pointer_format @+4
        starts_bytes.extend_from_slice(&0u16.to_le_bytes()); // @+6..+8 pad to reach segment_offset@+8
        starts_bytes.extend_from_slice(&0u64.to_le_bytes()); // segment_offset @+8..+16
        starts_bytes.extend_from_slice(&0u32.to_le_bytes()); // @+16..+20 pad to reach page_count@+20
        starts_bytes.extend_from_slice(&1u16.to_le_bytes()); // page_count @+20
        starts_bytes.extend_from_slice(&0u16.to_le_bytes()); // page_starts[0] @+22: chain at byte 0 of the page

        let imports_offset = starts_offset + starts_bytes.len() as u32;
        let import_entry_off = imports_offset;
        let symbols_offset = import_entry_off + 4; // one import entry, 4 bytes
        let mut symbols_bytes = Vec::new();
        symbols_bytes.extend_from_slice(import_name.as_bytes());
        symbols_bytes.push(0);

        let lib_ordinal = 1u32;
        let name_offset = 0u32;
        let import_raw = (lib_ordinal & 0xFF) | (0u32 << 8) | (name_offset << 9);

        let mut fixups_blob = Vec::new();
        push_u32(&mut fixups_blob, 0); // fixups_version
        push_u32(&mut fixups_blob, starts_offset); // starts_offset
        push_u32(&mut fixups_blob, imports_offset); // imports_offset
        push_u32(&mut fixups_blob, symbols_offset); // symbols_offset
        push_u32(&mut fixups_blob, 1); // imports_count
        push_u32(&mut fixups_blob, DYLD_CHAINED_IMPORT); // imports_format
        push_u32(&mut fixups_blob, 0); // symbols_format
        debug_assert_eq!(fixups_blob.len(), header_size);
        fixups_blob.extend_from_slice(&starts_bytes);
        push_u32(&mut fixups_blob, import_raw);
        fixups_blob.extend_from_slice(&symbols_bytes);

        let mut fixups_cmd = Vec::new();
        push_u32(&mut fixups_cmd, LC_DYLD_CHAINED_FIXUPS);
        push_u32(&mut fixups_cmd, 0);
        push_u32(&mut fixups_cmd, 0); // dataoff, filled below
        push_u32(&mut fixups_cmd, fixups_blob.len() as u32); // datasize
        let fixups_cmdsize = fixups_cmd.len() as u32;
        fixups_cmd[4..8].copy_from_slice(&fixups_cmdsize.to_le_bytes());

        let sizeofcmds = text_cmdsize + data_cmdsize + fixups_cmdsize;
        buf[20..24].copy_from_slice(&sizeofcmds.to_le_bytes());
        buf.extend_from_slice(&text_seg);
        buf.extend_from_slice(&data_seg);
        let fixups_cmd_offset_in_cmd = buf.len();
        buf.extend_from_slice(&fixups_cmd);

        // Pad the file out to where __DATA's file content starts, zero-fill
        // the page, then overwrite the one chain slot with a bind pointer:
        // bit 63 set (is_bind), chain_ordinal 0 (our only import), no addend,
        // next == 0 (end of chain).
        let data_file_start = buf.len().max(data_vmaddr as usize);
        buf.resize(data_file_start, 0);
        buf.resize(data_file_start + data_size as usize, 0);
        let bind_raw: u64 = 1 << 63;
        buf[data_file_start..data_file_start + 8].copy_from_slice(&bind_raw.to_le_bytes());
        let fixups_dataoff = buf.len() as u32;
        buf[fixups_cmd_offset_in_cmd + 8..fixups_cmd_offset_in_cmd + 12]
            .copy_from_slice(&fixups_dataoff.to_le_bytes());
        buf.extend_from_slice(&fixups_blob);
        buf
    }

    #[test]
    fn chained_fixups_bind_resolves_import_symbol_name() {
        let bytes = dylib_with_one_bind("_imported_symbol");
        let image = parse(&bytes).unwrap();
        assert_eq!(image.fixups.len(), 1);
        match &image.fixups[0].kind {
            FixupKind::Bind { lib_ordinal, symbol_name, .. } => {
                assert_eq!(*lib_ordinal, 1);
                assert_eq!(symbol_name, "_imported_symbol");
            }
            other => panic!("expected a Bind fixup, got {other:?}"),
        }
    }
}
