//! Debug map emission (SPEC_FULL.md §C.3), generalizing the original's
//! `DyldSharedCache::mapFile`/`generateJSONMap`: a plain-text and a JSON
//! dump of every region's address/size/permissions plus every cached
//! dylib's placement within them. Purely a debugging aid — nothing else in
//! the pipeline reads it back. Only produced when
//! [`crate::config::CreateOptions::output_map_file_path`] is set; writing
//! it to disk is the caller's job, the same as every other
//! [`crate::writer::PendingOutput`].

use serde::Serialize;
use serde_json::Value;

/// One mapped region of one sub-cache, in the shape `generateJSONMap`
/// emits per-segment: a name, its cache-relative address and size, and its
/// `mmap` protection bits.
#[derive(Debug, Clone, Serialize)]
pub struct MapRegion {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub init_prot: i32,
    pub max_prot: i32,
}

/// One cached dylib's entry: its install name and where its `__TEXT`
/// landed, enough to correlate a crash address back to an image without
/// re-running the whole layout pass.
#[derive(Debug, Clone, Serialize)]
pub struct MapDylib {
    pub install_name: String,
    pub text_address: u64,
    pub text_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheMap {
    pub arch: String,
    pub regions: Vec<MapRegion>,
    pub dylibs: Vec<MapDylib>,
}

fn prot_string(prot: i32) -> String {
    let mut s = String::new();
    s.push(if prot & 0b001 != 0 { 'r' } else { '-' });
    s.push(if prot & 0b010 != 0 { 'w' } else { '-' });
    s.push(if prot & 0b100 != 0 { 'x' } else { '-' });
    s
}

impl CacheMap {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// A `dyld_shared_cache_util -map`-shaped plain-text rendering: one
    /// line per region, then one line per dylib, sorted by address within
    /// each section.
    pub fn to_text(&self) -> String {
        let mut regions = self.regions.clone();
        regions.sort_by_key(|r| r.address);
        let mut dylibs = self.dylibs.clone();
        dylibs.sort_by_key(|d| d.text_address);

        let mut out = String::new();
        out.push_str(&format!("# {} shared cache map\n", self.arch));
        for region in &regions {
            out.push_str(&format!(
                "0x{:016X} -> 0x{:016X} {} {}\n",
                region.address,
                region.address + region.size,
                prot_string(region.init_prot),
                region.name,
            ));
        }
        out.push('\n');
        for dylib in &dylibs {
            out.push_str(&format!(
                "0x{:016X} -> 0x{:016X} {}\n",
                dylib.text_address,
                dylib.text_address + dylib.text_size,
                dylib.install_name,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_string_renders_rwx_bits() {
        assert_eq!(prot_string(0b101), "r-x");
        assert_eq!(prot_string(0b011), "rw-");
        assert_eq!(prot_string(0), "---");
    }

    #[test]
    fn text_map_lists_regions_then_dylibs_sorted_by_address() {
        let map = CacheMap {
            arch: "arm64e".to_string(),
            regions: vec![
                MapRegion { name: "__LINKEDIT".to_string(), address: 0x2000, size: 0x1000, init_prot: 0b001, max_prot: 0b001 },
                MapRegion { name: "__TEXT".to_string(), address: 0, size: 0x1000, init_prot: 0b101, max_prot: 0b101 },
            ],
            dylibs: vec![MapDylib { install_name: "/usr/lib/libfoo.dylib".to_string(), text_address: 0x10, text_size: 0x20 }],
        };
        let text = map.to_text();
        let text_pos = text.find("__TEXT").unwrap();
        let linkedit_pos = text.find("__LINKEDIT").unwrap();
        assert!(text_pos < linkedit_pos);
        assert!(text.contains("libfoo.dylib"));
    }

    #[test]
    fn json_round_trips_region_fields() {
        let map = CacheMap {
            arch: "arm64".to_string(),
            regions: vec![MapRegion { name: "__DATA".to_string(), address: 0x4000, size: 0x100, init_prot: 3, max_prot: 3 }],
            dylibs: Vec::new(),
        };
        let json = map.to_json();
        assert_eq!(json["regions"][0]["address"], 0x4000);
        assert_eq!(json["regions"][0]["name"], "__DATA");
    }
}
