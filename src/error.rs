//! Fatal and non-fatal error handling for a cache build.
//!
//! Modeled on the teacher crate's `SoftErrorList<E>` (`src/error_list.rs`):
//! a build collects warnings as it goes and only stops at the first fatal
//! error, per spec.md §7.

use thiserror::Error;

/// The `Result` type used throughout this crate.
pub type Result<T> = std::result::Result<T, BuildError>;

/// A fatal error that aborts the build. One variant per spec.md §7 error
/// kind.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Construction-time configuration problems.
    #[error("unsupported architecture '{0}'")]
    UnsupportedArch(String),
    #[error("no outputs requested")]
    NoOutputsRequested,

    /// Self-containment failures (spec.md §4.1).
    #[error("missing required minimum set of dylibs")]
    BelowMinimumDylibCount,
    #[error("required binary not included: {0}")]
    RequiredBinaryMissing(String),

    /// Layout failures (spec.md §4.2-§4.4).
    #[error("cache overflow by {0} bytes")]
    CacheOverflow(u64),
    #[error("cache overflow after optimizations, by {0} bytes")]
    CacheOverflowAfterOptimizations(u64),
    #[error("could not allocate buffer")]
    BufferAllocationFailed,
    #[error("segment {0} was duplicated in layout")]
    SegmentDuplicated(String),

    /// Binder failures (spec.md §4.5).
    #[error("{message}, applying fixups to {dylib_path}")]
    FixupFailed { message: String, dylib_path: String },

    /// Encoding failures (spec.md §4.8, §4.6).
    #[error("kernel slide info overflow buffer")]
    SlideInfoOverflow,
    #[error("rebase overflow in v2/v4 page extras")]
    PageExtrasOverflow,
    #[error("symbol count miscalculation")]
    SymbolCountMiscalculation,

    /// I/O failures (spec.md §4.10).
    #[error("could not rename file '{from}' to: '{to}'")]
    RenameFailed { from: String, to: String },
    #[error("could not write file {0}")]
    WriteFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A fatal error recorded into a [`Diagnostics`] bag via free-text
    /// `error()` rather than constructed directly (e.g. a `MustBeIncluded`
    /// input missing after self-contained verification, spec.md §4.1 rule
    /// 5). The message is already fully formed at the call site.
    #[error("{0}")]
    Fatal(String),
}

/// A per-input diagnostic: why a single candidate dylib failed to make it
/// into the cache. Accumulated by the self-contained verifier (spec.md
/// §4.1) and surfaced as a warning unless the input was `MustBeIncluded`.
#[derive(Debug, Clone, thiserror::Error, serde::Serialize)]
#[error("{reason}")]
pub struct InputDiagnostic {
    pub path: String,
    pub reason: String,
}

/// Append-only bag of non-fatal warnings plus (at most) one fatal error,
/// collected over the course of one build. See spec.md §7.
#[derive(Debug, Default, serde::Serialize)]
pub struct Diagnostics {
    warnings: Vec<String>,
    #[serde(skip)]
    fatal: Option<BuildErrorRecord>,
}

#[derive(Debug)]
struct BuildErrorRecord(String);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning. Never aborts the build.
    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Record a fatal error if none has been recorded yet. First one wins,
    /// per spec.md §7.
    pub fn error(&mut self, message: impl Into<String>) {
        if self.fatal.is_none() {
            self.fatal = Some(BuildErrorRecord(message.into()));
        }
    }

    pub fn has_error(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Take the first fatal error, if any, turning it into a `BuildError`.
    pub fn into_result(self) -> Result<Vec<String>> {
        match self.fatal {
            Some(BuildErrorRecord(msg)) => Err(BuildError::Fatal(msg)),
            None => Ok(self.warnings),
        }
    }

    /// Serialize the accumulated warnings to JSON, for callers that log
    /// build diagnostics as structured output rather than plain text.
    pub fn to_json(&self) -> std::result::Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fatal_wins() {
        let mut diag = Diagnostics::new();
        diag.error("first");
        diag.error("second");
        assert!(diag.has_error());
        let err = diag.into_result().unwrap_err();
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn warnings_accumulate_without_aborting() {
        let mut diag = Diagnostics::new();
        diag.warning("a");
        diag.warning("b");
        assert!(!diag.has_error());
        let warnings = diag.into_result().unwrap();
        assert_eq!(warnings, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn to_json_serializes_warnings() {
        let mut diag = Diagnostics::new();
        diag.warning("evicted /usr/lib/libfoo.dylib");
        let value = diag.to_json().unwrap();
        assert_eq!(value, serde_json::json!({"warnings": ["evicted /usr/lib/libfoo.dylib"]}));
    }
}
