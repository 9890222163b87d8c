//! A shared-library cache builder (spec.md §1): given a self-contained set
//! of Mach-O dylibs for one architecture, lays out coalesced TEXT/DATA*/
//! LINKEDIT regions, pre-links every cross-dylib reference, and emits one or
//! more contiguous cache files along with the patch tables, tries, slide
//! info and ad-hoc code signature the runtime loader needs.
//!
//! This crate owns the layout + fixup + patch-table pipeline (C1-C12, see
//! SPEC_FULL.md); it treats the Mach-O reader, the ObjC/Swift metadata
//! optimizer, and the LINKEDIT optimizer as external collaborators whose
//! interfaces are fixed by the [`macho`] module but whose implementations
//! live outside this crate (spec.md §1).

pub mod arch;
pub mod bind;
pub mod builder;
pub mod codesign;
pub mod config;
pub mod error;
pub mod graph;
pub mod header;
pub mod input;
pub mod layout;
pub mod macho;
pub mod map;
pub mod model;
pub mod patch;
pub mod slide_info;
pub mod sort;
pub mod trie;
pub mod tries;
pub mod verify;
pub mod writer;

pub use builder::{build, BuildResult};
pub use config::CreateOptions;
pub use error::{BuildError, Diagnostics, Result};
pub use model::{InputFile, RequirementState};
