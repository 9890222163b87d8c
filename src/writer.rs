//! C12 — atomic file writer (spec.md §4.10).
//!
//! Writes each finished sub-cache to a temp file beside its final path,
//! `fsync`s, and renames it into place, so a build that dies partway never
//! leaves a half-written cache at the path a loader might already be
//! reading from. Grounded in the teacher's own use of `tempfile` for
//! minidump output (`src/minidump_writer.rs`'s `NamedTempFile`), generalized
//! here to the cache's own `<path>` / `.1` / `.2` / `.symbols` naming
//! convention (spec.md §4.10).

use std::io::Write as _;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{BuildError, Result};

/// Where one sub-cache's bytes end up relative to the build's primary
/// output path (spec.md §4.10 naming convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// The first sub-cache: written to `output_file_path` itself.
    Primary,
    /// The Nth (1-based) additional sub-cache: `output_file_path.N`.
    Numbered(u32),
    /// The local-symbols sub-cache: `output_file_path.symbols`.
    Symbols,
}

pub fn output_path(base: &str, kind: OutputKind) -> PathBuf {
    match kind {
        OutputKind::Primary => PathBuf::from(base),
        OutputKind::Numbered(n) => PathBuf::from(format!("{base}.{n}")),
        OutputKind::Symbols => PathBuf::from(format!("{base}.symbols")),
    }
}

/// Write `bytes` atomically to `path`: create a temp file in the same
/// directory, write, `fsync`, `chmod 444`, then rename over the final path.
/// The same-directory requirement keeps the rename a same-filesystem atomic
/// op rather than a cross-device copy.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o444))?;
    }

    tmp.persist(path).map_err(|e| BuildError::RenameFailed {
        from: e.file.path().display().to_string(),
        to: path.display().to_string(),
    })?;
    Ok(())
}

/// One sub-cache ready to be emitted: its final bytes plus which output
/// slot it occupies.
pub struct PendingOutput {
    pub kind: OutputKind,
    pub bytes: Vec<u8>,
}

/// Write every pending sub-cache under `output_file_path`'s naming
/// convention. Returns the concrete paths written, in input order.
pub fn write_all(output_file_path: &str, outputs: &[PendingOutput]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(outputs.len());
    for output in outputs {
        let path = output_path(output_file_path, output.kind);
        write_atomically(&path, &output.bytes)?;
        written.push(path);
    }
    Ok(written)
}

/// In-memory emission mode for testing (spec.md §4.10 "supports in-memory
/// emission for testing"): skips the filesystem entirely and just reports
/// where each sub-cache's bytes would have landed.
pub fn emit_in_memory(output_file_path: &str, outputs: Vec<PendingOutput>) -> Vec<(PathBuf, Vec<u8>)> {
    outputs
        .into_iter()
        .map(|output| (output_path(output_file_path, output.kind), output.bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_follows_naming_convention() {
        assert_eq!(output_path("/tmp/cache", OutputKind::Primary), PathBuf::from("/tmp/cache"));
        assert_eq!(
            output_path("/tmp/cache", OutputKind::Numbered(1)),
            PathBuf::from("/tmp/cache.1")
        );
        assert_eq!(
            output_path("/tmp/cache", OutputKind::Symbols),
            PathBuf::from("/tmp/cache.symbols")
        );
    }

    #[test]
    fn write_atomically_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        write_atomically(&path, b"hello cache").unwrap();
        let read_back = std::fs::read(&path).unwrap();
        assert_eq!(read_back, b"hello cache");
    }

    #[test]
    fn emit_in_memory_skips_filesystem() {
        let outputs = vec![PendingOutput { kind: OutputKind::Primary, bytes: vec![1, 2, 3] }];
        let result = emit_in_memory("/tmp/does-not-exist/cache", outputs);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].1, vec![1, 2, 3]);
        assert!(!result[0].0.exists());
    }
}
